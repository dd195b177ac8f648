use cid::{Cid as ExternalCid, Version};
use multihash::Multihash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Multicodec code for sha2-256
const SHA2_256: u64 = 0x12;
/// Multicodec code for raw bytes
pub const RAW_CODEC: u64 = 0x55;
/// Multicodec code for DAG-CBOR
pub const DAG_CBOR_CODEC: u64 = 0x71;

/// Errors that can occur when working with CIDs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CidError {
    #[error("Failed to parse CID from bytes: {0}")]
    ParseError(String),
    #[error("Failed to parse CID from string: {0}")]
    FromStrError(String),
    #[error("Failed to build multihash: {0}")]
    Multihash(String),
}

/// Content reference used for WASM modules, inputs, outputs and receipts.
///
/// Wraps `cid::Cid` (CIDv1, sha2-256) and serializes as its binary form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Cid(ExternalCid);

impl Cid {
    /// CID of opaque bytes (raw codec).
    pub fn from_bytes(data: &[u8]) -> Result<Self, CidError> {
        Self::with_codec(RAW_CODEC, data)
    }

    /// CID of a DAG-CBOR encoded object.
    pub fn for_dag_cbor(encoded: &[u8]) -> Result<Self, CidError> {
        Self::with_codec(DAG_CBOR_CODEC, encoded)
    }

    fn with_codec(codec: u64, data: &[u8]) -> Result<Self, CidError> {
        let digest = Sha256::digest(data);
        let mh = Multihash::<64>::wrap(SHA2_256, &digest)
            .map_err(|e| CidError::Multihash(e.to_string()))?;
        ExternalCid::new(Version::V1, codec, mh)
            .map(Cid)
            .map_err(|e| CidError::ParseError(e.to_string()))
    }

    /// Multicodec of the referenced content.
    pub fn codec(&self) -> u64 {
        self.0.codec()
    }

    /// Binary CID, used as the DHT key for the referenced content.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    /// Whether `data` hashes to this CID under its own codec.
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::with_codec(self.codec(), data)
            .map(|other| &other == self)
            .unwrap_or(false)
    }
}

impl FromStr for Cid {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExternalCid::from_str(s)
            .map(Cid)
            .map_err(|e| CidError::FromStrError(format!("CID parse error: {}", e)))
    }
}

impl TryFrom<&[u8]> for Cid {
    type Error = CidError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        ExternalCid::try_from(bytes)
            .map(Cid)
            .map_err(|e| CidError::ParseError(e.to_string()))
    }
}

impl From<ExternalCid> for Cid {
    fn from(cid: ExternalCid) -> Self {
        Cid(cid)
    }
}

impl Serialize for Cid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&self.0.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: serde_bytes::ByteBuf = Deserialize::deserialize(deserializer)?;
        ExternalCid::try_from(bytes.as_ref())
            .map(Cid)
            .map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
