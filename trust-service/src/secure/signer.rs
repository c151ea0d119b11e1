use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};

use super::encryption::{decode_key, CryptoError, SecretField};

/// A record whose integrity is protected by a detached signature.
pub trait Signable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Storage namespace of the record type.
    const KIND: &'static str;

    fn id(&self) -> &str;

    /// Deterministic renderings of the signed fields, newest layout first.
    /// New signatures cover the first form; older forms keep rows signed
    /// before a layout change readable.
    fn canonical_forms(&self) -> Vec<String>;

    fn secret_fields(&mut self) -> Vec<SecretField<'_>> {
        Vec::new()
    }
}

/// Ed25519 signer over canonical forms, with key rotation.
pub struct CanonicalSigner {
    signing: SigningKey,
    verifying: Vec<VerifyingKey>,
}

impl CanonicalSigner {
    /// Seeds are 32 bytes each, newest first.
    pub fn from_seeds(seeds: &[[u8; 32]]) -> Result<Self, CryptoError> {
        let mut keys = seeds.iter().map(SigningKey::from_bytes);
        let signing = keys.next().ok_or(CryptoError::NoKey)?;
        let verifying = std::iter::once(signing.verifying_key())
            .chain(keys.map(|k| k.verifying_key()))
            .collect();
        Ok(Self { signing, verifying })
    }

    pub fn from_base64_keys(keys: &[SecretString]) -> Result<Self, CryptoError> {
        let seeds = keys
            .iter()
            .map(|key| decode_key(key.expose_secret()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_seeds(&seeds)
    }

    /// Signs the newest canonical form.
    pub fn sign<T: Signable>(&self, record: &T) -> Result<String, CryptoError> {
        self.sign_form(record, 0)
    }

    /// Signs the canonical form at `index`, 0 being the newest.
    pub fn sign_form<T: Signable>(&self, record: &T, index: usize) -> Result<String, CryptoError> {
        let form = record
            .canonical_forms()
            .into_iter()
            .nth(index)
            .ok_or(CryptoError::NoCanonicalForm(T::KIND))?;
        let signature = self.signing.sign(form.as_bytes());
        Ok(STANDARD.encode(signature.to_bytes()))
    }

    /// True when any canonical form verifies under any configured key.
    pub fn verify<T: Signable>(&self, record: &T, signature: &str) -> bool {
        let Ok(bytes) = STANDARD.decode(signature) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return false;
        };

        record.canonical_forms().iter().any(|form| {
            self.verifying
                .iter()
                .any(|key| key.verify(form.as_bytes(), &signature).is_ok())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Note {
        id: String,
        body: String,
        flag: bool,
    }

    impl Signable for Note {
        const KIND: &'static str = "note";

        fn id(&self) -> &str {
            &self.id
        }

        fn canonical_forms(&self) -> Vec<String> {
            vec![
                format!("{}|{}|{}", self.id, self.body, self.flag),
                format!("{}|{}", self.id, self.body),
            ]
        }
    }

    fn note() -> Note {
        Note {
            id: "n1".into(),
            body: "hello".into(),
            flag: false,
        }
    }

    #[test]
    fn test_tampered_field_fails_verification() {
        let signer = CanonicalSigner::from_seeds(&[[3u8; 32]]).unwrap();
        let mut n = note();
        let sig = signer.sign(&n).unwrap();
        assert!(signer.verify(&n, &sig));

        n.body = "hello!".into();
        assert!(!signer.verify(&n, &sig));
    }

    #[test]
    fn test_older_form_still_verifies() {
        let signer = CanonicalSigner::from_seeds(&[[3u8; 32]]).unwrap();
        let n = note();
        let old = signer.signing.sign(format!("{}|{}", n.id, n.body).as_bytes());
        assert!(signer.verify(&n, &STANDARD.encode(old.to_bytes())));
        assert_eq!(
            signer.sign_form(&n, 1).unwrap(),
            STANDARD.encode(old.to_bytes())
        );
        assert!(signer.sign_form(&n, 2).is_err());
    }

    #[test]
    fn test_rotated_signer_reads_old_signatures() {
        let old = CanonicalSigner::from_seeds(&[[3u8; 32]]).unwrap();
        let rotated = CanonicalSigner::from_seeds(&[[4u8; 32], [3u8; 32]]).unwrap();
        let sig = old.sign(&note()).unwrap();

        assert!(rotated.verify(&note(), &sig));
        let fresh = rotated.sign(&note()).unwrap();
        assert!(!old.verify(&note(), &fresh));
    }

    #[test]
    fn test_garbage_signature_is_rejected() {
        let signer = CanonicalSigner::from_seeds(&[[3u8; 32]]).unwrap();
        assert!(!signer.verify(&note(), "not base64!"));
        assert!(!signer.verify(&note(), &STANDARD.encode([0u8; 12])));
    }
}
