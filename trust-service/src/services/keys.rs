use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashSet;
use std::fs;

use super::error::ServiceError;
use crate::config::TokenConfig;

/// Signing algorithm of every token this service issues and accepts.
pub const TOKEN_ALGORITHM: Algorithm = Algorithm::RS256;

/// RS256 key pair shared by the session and signin token issuers.
pub struct IssuerKeys {
    issuer: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl IssuerKeys {
    /// Load the RSA key pair from the configured PEM files.
    pub fn load(config: &TokenConfig) -> Result<Self, anyhow::Error> {
        let private_key_pem = fs::read_to_string(&config.private_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read private key from {}: {}",
                config.private_key_path,
                e
            )
        })?;

        let public_key_pem = fs::read_to_string(&config.public_key_path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read public key from {}: {}",
                config.public_key_path,
                e
            )
        })?;

        let keys = Self::from_pem(
            &config.issuer,
            private_key_pem.as_bytes(),
            public_key_pem.as_bytes(),
        )?;
        tracing::info!(issuer = %config.issuer, "Token keys loaded");
        Ok(keys)
    }

    pub fn from_pem(
        issuer: &str,
        private_key_pem: &[u8],
        public_key_pem: &[u8],
    ) -> Result<Self, anyhow::Error> {
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem)
            .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

        Ok(Self {
            issuer: issuer.to_string(),
            encoding_key,
            decoding_key,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn sign<C: Serialize>(&self, claims: &C) -> Result<String, ServiceError> {
        encode(&Header::new(TOKEN_ALGORITHM), claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Failed to encode token: {}", e)))
    }

    /// Checks the signature and issuer. Expiry is left to the caller so it
    /// is evaluated without leeway against the caller's clock.
    pub fn verify<C: DeserializeOwned>(&self, token: &str) -> Result<C, ServiceError> {
        let header = decode_header(token)
            .map_err(|e| ServiceError::Unauthorized(format!("Malformed token: {}", e)))?;
        if header.alg != TOKEN_ALGORITHM {
            return Err(ServiceError::Unauthorized(format!(
                "Unexpected token algorithm {:?}",
                header.alg
            )));
        }

        let mut validation = Validation::new(TOKEN_ALGORITHM);
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::new();
        validation.set_issuer(&[&self.issuer]);

        decode::<C>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| ServiceError::Unauthorized(format!("Invalid token: {}", e)))
    }
}
