use crate::did::{Did, ED25519_MULTICODEC_PREFIX};
use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
};
use multibase::Base;
use rand::rngs::OsRng;
use std::convert::TryInto;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DidKeyError {
    #[error("Signature verification failed")]
    VerificationError(#[from] ed25519_dalek::SignatureError),
    #[error("Invalid key bytes length: expected {expected}, got {got}")]
    InvalidKeyBytesLength { expected: usize, got: usize },
    #[error("Invalid DID string: {0}")]
    InvalidDidString(String),
    #[error("Unsupported DID method: {0}")]
    UnsupportedDidMethod(String),
    #[error("Invalid multibase encoding: {0}")]
    InvalidMultibase(#[from] multibase::Error),
    #[error("Invalid multicodec prefix: expected 0xed01, got {0:?}")]
    InvalidMulticodecPrefix(Vec<u8>),
}

/// Manages an Ed25519 keypair associated with a `did:key` identifier.
///
/// The signing key never leaves this struct: callers get signatures and the
/// verifying key, nothing else.
#[derive(Debug)] // Avoid Clone for keypairs
pub struct DidKey {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    did: Did,
}

impl DidKey {
    /// Generate a new DidKey using OS randomness.
    pub fn new() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Deterministically derive a key from a 32-byte seed.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Load a key from raw secret bytes, e.g. read from a key file.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, DidKeyError> {
        let seed: &[u8; SECRET_KEY_LENGTH] =
            bytes.try_into().map_err(|_| DidKeyError::InvalidKeyBytesLength {
                expected: SECRET_KEY_LENGTH,
                got: bytes.len(),
            })?;
        Ok(Self::from_seed(seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let did = Did::from_verifying_key(&verifying_key);
        DidKey { signing_key, verifying_key, did }
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), DidKeyError> {
        self.verifying_key
            .verify(message, signature)
            .map_err(DidKeyError::VerificationError)
    }

    pub fn to_did_string(&self) -> String {
        self.did.to_string()
    }

    /// Recover the verifying key embedded in a `did:key` identifier.
    pub fn verifying_key_from_did(did: &Did) -> Result<VerifyingKey, DidKeyError> {
        if !did.is_did_key() {
            return Err(DidKeyError::UnsupportedDidMethod(did.to_string()));
        }
        let encoded_key = did.method_specific_id();

        let (base, decoded_bytes) = multibase::decode(encoded_key)?;
        if base != Base::Base58Btc {
            return Err(DidKeyError::InvalidDidString(
                "Expected base58btc encoding (prefix 'z')".to_string(),
            ));
        }

        if !decoded_bytes.starts_with(ED25519_MULTICODEC_PREFIX) {
            return Err(DidKeyError::InvalidMulticodecPrefix(
                decoded_bytes.iter().take(2).copied().collect(),
            ));
        }

        let key_bytes = &decoded_bytes[ED25519_MULTICODEC_PREFIX.len()..];
        let key_array: &[u8; PUBLIC_KEY_LENGTH] =
            key_bytes
                .try_into()
                .map_err(|_| DidKeyError::InvalidKeyBytesLength {
                    expected: PUBLIC_KEY_LENGTH,
                    got: key_bytes.len(),
                })?;

        VerifyingKey::from_bytes(key_array).map_err(DidKeyError::VerificationError)
    }
}

impl Default for DidKey {
    fn default() -> Self {
        Self::new()
    }
}
