//! Tamper evidence and field encryption for persisted records.

pub mod encryption;
pub mod signer;
pub mod store;

pub use encryption::{
    CryptoError, FieldEncryptor, SecretField, SecretSlot, Sealed, PASSWORD_PLACEHOLDER,
};
pub use signer::{CanonicalSigner, Signable};
pub use store::{LoadOptions, SecuredStore};
