use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Value callers send back in place of a secret they never saw.
pub const PASSWORD_PLACEHOLDER: &str = "**********";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no encryption key configured")]
    NoKey,

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("ciphertext rejected by every configured key")]
    Decrypt,

    #[error("{0} has no canonical form")]
    NoCanonicalForm(&'static str),

    #[error("secret value could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A secret field. Outside the store it holds either the clear value or the
/// placeholder, never ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sealed<T> {
    Placeholder,
    Clear(T),
}

impl<T> Default for Sealed<T> {
    fn default() -> Self {
        Sealed::Placeholder
    }
}

impl<T> Sealed<T> {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Sealed::Placeholder)
    }

    pub fn clear(&self) -> Option<&T> {
        match self {
            Sealed::Clear(value) => Some(value),
            Sealed::Placeholder => None,
        }
    }
}

impl<T: Serialize> Serialize for Sealed<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Sealed::Placeholder => serializer.serialize_str(PASSWORD_PLACEHOLDER),
            Sealed::Clear(value) => value.serialize(serializer),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Sealed<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        if raw.as_str() == Some(PASSWORD_PLACEHOLDER) {
            return Ok(Sealed::Placeholder);
        }
        serde_json::from_value(raw)
            .map(Sealed::Clear)
            .map_err(serde::de::Error::custom)
    }
}

/// Type-erased access to a secret field for the record store.
pub trait SecretSlot: Send {
    fn is_placeholder(&self) -> bool;
    /// Plaintext bytes, or `None` while masked.
    fn to_plain(&self) -> Result<Option<Vec<u8>>, CryptoError>;
    fn set_plain(&mut self, plain: &[u8]) -> Result<(), CryptoError>;
    fn mask(&mut self);
}

impl<T: Serialize + DeserializeOwned + Send> SecretSlot for Sealed<T> {
    fn is_placeholder(&self) -> bool {
        Sealed::is_placeholder(self)
    }

    fn to_plain(&self) -> Result<Option<Vec<u8>>, CryptoError> {
        match self {
            Sealed::Placeholder => Ok(None),
            Sealed::Clear(value) => Ok(Some(serde_json::to_vec(value)?)),
        }
    }

    fn set_plain(&mut self, plain: &[u8]) -> Result<(), CryptoError> {
        *self = Sealed::Clear(serde_json::from_slice(plain)?);
        Ok(())
    }

    fn mask(&mut self) {
        *self = Sealed::Placeholder;
    }
}

/// A named secret field borrowed from a record.
pub struct SecretField<'a> {
    pub name: &'static str,
    pub slot: &'a mut dyn SecretSlot,
}

impl<'a> SecretField<'a> {
    pub fn new(name: &'static str, slot: &'a mut dyn SecretSlot) -> Self {
        Self { name, slot }
    }
}

/// ChaCha20-Poly1305 over secret fields. The first key encrypts, every key
/// is tried on decryption so retired keys keep reading old rows.
pub struct FieldEncryptor {
    ciphers: Vec<ChaCha20Poly1305>,
}

impl FieldEncryptor {
    pub fn from_raw_keys(keys: &[[u8; KEY_LEN]]) -> Result<Self, CryptoError> {
        if keys.is_empty() {
            return Err(CryptoError::NoKey);
        }
        let ciphers = keys
            .iter()
            .map(|key| ChaCha20Poly1305::new(Key::from_slice(key)))
            .collect();
        Ok(Self { ciphers })
    }

    /// Keys are base64-encoded 32-byte values, newest first.
    pub fn from_base64_keys(keys: &[SecretString]) -> Result<Self, CryptoError> {
        let raw = keys
            .iter()
            .map(|key| decode_key(key.expose_secret()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_raw_keys(&raw)
    }

    /// Output is `nonce || ciphertext`.
    pub fn encrypt(&self, plain: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.ciphers.first().ok_or(CryptoError::NoKey)?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plain, aad })
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce);
        self.ciphers
            .iter()
            .find_map(|cipher| {
                cipher
                    .decrypt(
                        nonce,
                        Payload {
                            msg: ciphertext,
                            aad,
                        },
                    )
                    .ok()
            })
            .ok_or(CryptoError::Decrypt)
    }
}

pub(crate) fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        CryptoError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len()))
    })
}
