use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Multicodec prefix for Ed25519 public keys (0xed01)
pub(crate) const ED25519_MULTICODEC_PREFIX: &[u8] = &[0xed, 0x01];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DidParseError {
    #[error("DID must start with 'did:': {0}")]
    MissingScheme(String),
    #[error("DID is missing a method or method-specific id: {0}")]
    Incomplete(String),
}

/// A Decentralized Identifier.
///
/// Stored in its string form (`did:<method>:<id>`) so it can travel over the
/// wire unchanged and order lexicographically. `did:key` identifiers embed an
/// Ed25519 public key and can be resolved without any network lookup.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Did(String);

impl Did {
    /// Build the `did:key` identifier for an Ed25519 verifying key.
    pub fn from_verifying_key(verifying_key: &VerifyingKey) -> Self {
        let mut prefixed_key = ED25519_MULTICODEC_PREFIX.to_vec();
        prefixed_key.extend_from_slice(verifying_key.as_bytes());
        Did(format!(
            "did:key:{}",
            multibase::encode(multibase::Base::Base58Btc, prefixed_key)
        ))
    }

    /// Parse and validate the generic `did:<method>:<id>` shape.
    pub fn parse(s: &str) -> Result<Self, DidParseError> {
        let rest = s
            .strip_prefix("did:")
            .ok_or_else(|| DidParseError::MissingScheme(s.to_string()))?;
        match rest.split_once(':') {
            Some((method, id)) if !method.is_empty() && !id.is_empty() => Ok(Did(s.to_string())),
            _ => Err(DidParseError::Incomplete(s.to_string())),
        }
    }

    /// The DID method, e.g. `key` for `did:key:z6Mk...`.
    pub fn method(&self) -> &str {
        self.0
            .strip_prefix("did:")
            .and_then(|rest| rest.split(':').next())
            .unwrap_or_default()
    }

    /// The method-specific identifier.
    pub fn method_specific_id(&self) -> &str {
        self.0
            .strip_prefix("did:")
            .and_then(|rest| rest.split_once(':'))
            .map(|(_, id)| id)
            .unwrap_or_default()
    }

    pub fn is_did_key(&self) -> bool {
        self.method() == "key"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Did {
    type Err = DidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Did::parse(s)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
