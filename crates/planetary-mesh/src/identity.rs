//! Node identity, signing and DID resolution.

use crate::codec::{self, SignedPayload};
use crate::error::{AuthError, MeshError, MeshResult};
use crate::transport::MeshTransport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use icn_core_types::{Did, DidKey};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::TryInto;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// DHT namespace for DID documents
const DID_DOCUMENT_PREFIX: &str = "/icn/did/";

/// The local node's identity: a DID, its signing key and the transport peer id.
///
/// Immutable for the lifetime of the process. The signing key is never
/// exposed; callers only get signatures.
#[derive(Debug)]
pub struct MeshIdentity {
    did_key: DidKey,
    did: Did,
    peer_id: String,
}

impl MeshIdentity {
    /// Identity whose DID is the key's own `did:key`.
    pub fn new(did_key: DidKey, peer_id: impl Into<String>) -> Self {
        let did = did_key.did().clone();
        Self { did_key, did, peer_id: peer_id.into() }
    }

    /// Identity under another DID method, bound to `did_key` through a
    /// DID document published in the DHT.
    pub fn with_did(did: Did, did_key: DidKey, peer_id: impl Into<String>) -> Self {
        Self { did_key, did, peer_id: peer_id.into() }
    }

    pub fn generate(peer_id: impl Into<String>) -> Self {
        Self::new(DidKey::new(), peer_id)
    }

    pub fn did(&self) -> &Did {
        &self.did
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.did_key.verifying_key()
    }

    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.did_key.sign(payload).to_bytes().to_vec()
    }

    /// Whether peers need a DID document to verify this identity.
    pub fn needs_did_document(&self) -> bool {
        !self.did.is_did_key()
    }

    /// Signed document binding this DID to its public key.
    pub fn did_document(&self) -> MeshResult<DidDocument> {
        DidDocument {
            id: self.did.clone(),
            public_key: self.verifying_key().as_bytes().to_vec(),
            updated_at: Utc::now(),
            signature: Vec::new(),
        }
        .sign_with(self)
    }
}

/// Binds a non-`did:key` DID to an Ed25519 key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidDocument {
    pub id: Did,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub updated_at: DateTime<Utc>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl DidDocument {
    fn verifying_key(&self) -> Result<VerifyingKey, AuthError> {
        let bytes: &[u8; PUBLIC_KEY_LENGTH] = self
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::Unresolvable(format!("{}: bad key length", self.id)))?;
        VerifyingKey::from_bytes(bytes)
            .map_err(|e| AuthError::Unresolvable(format!("{}: {}", self.id, e)))
    }
}

pub fn did_document_key(did: &Did) -> Vec<u8> {
    format!("{}{}", DID_DOCUMENT_PREFIX, did).into_bytes()
}

/// Check a raw signature against a known key.
pub fn verify_with_key(
    key: &VerifyingKey,
    did: &Did,
    payload: &[u8],
    signature: &[u8],
) -> Result<(), AuthError> {
    let sig_array: [u8; SIGNATURE_LENGTH] = signature.try_into().map_err(|_| {
        AuthError::MalformedSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LENGTH,
            signature.len()
        ))
    })?;
    key.verify(payload, &Signature::from_bytes(&sig_array))
        .map_err(|_| AuthError::SignatureMismatch(did.to_string()))
}

/// Maps a DID to the key that signs for it.
#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve(&self, did: &Did) -> Result<VerifyingKey, AuthError>;
}

/// Resolves only self-certifying `did:key` identifiers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DidKeyResolver;

#[async_trait]
impl DidResolver for DidKeyResolver {
    async fn resolve(&self, did: &Did) -> Result<VerifyingKey, AuthError> {
        DidKey::verifying_key_from_did(did).map_err(|e| AuthError::Unresolvable(format!("{}: {}", did, e)))
    }
}

/// Resolves `did:key` locally and everything else from DID documents in the
/// DHT, caching successful lookups.
///
/// The first document found for a DID is trusted; documents must be
/// self-signed by the key they publish.
pub struct DhtDidResolver {
    transport: Arc<dyn MeshTransport>,
    cache: RwLock<HashMap<Did, VerifyingKey>>,
    lookup_timeout: Duration,
}

impl DhtDidResolver {
    pub fn new(transport: Arc<dyn MeshTransport>, lookup_timeout: Duration) -> Self {
        Self {
            transport,
            cache: RwLock::new(HashMap::new()),
            lookup_timeout,
        }
    }

    /// Seed the cache, e.g. with the local identity.
    pub async fn insert(&self, did: Did, key: VerifyingKey) {
        self.cache.write().await.insert(did, key);
    }

    async fn fetch_document(&self, did: &Did) -> Result<VerifyingKey, AuthError> {
        let key = did_document_key(did);
        let lookup = tokio::time::timeout(self.lookup_timeout, self.transport.dht_get(&key)).await;
        let bytes = match lookup {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => return Err(AuthError::Unresolvable(format!("{}: no DID document", did))),
            Ok(Err(e)) => return Err(AuthError::Unresolvable(format!("{}: {}", did, e))),
            Err(_) => return Err(AuthError::Unresolvable(format!("{}: lookup timed out", did))),
        };
        let (document, payload) = codec::decode_signed::<DidDocument>(&bytes)
            .map_err(|e| AuthError::Unresolvable(format!("{}: {}", did, e)))?;
        if &document.id != did {
            return Err(AuthError::Unresolvable(format!(
                "{}: document is for {}",
                did, document.id
            )));
        }
        let verifying_key = document.verifying_key()?;
        verify_with_key(&verifying_key, did, &payload, document.signature())
            .map_err(|e| AuthError::Unresolvable(format!("{}: document not self-signed ({})", did, e)))?;
        Ok(verifying_key)
    }
}

#[async_trait]
impl DidResolver for DhtDidResolver {
    async fn resolve(&self, did: &Did) -> Result<VerifyingKey, AuthError> {
        if let Some(key) = self.cache.read().await.get(did) {
            return Ok(*key);
        }
        let key = if did.is_did_key() {
            DidKeyResolver.resolve(did).await?
        } else {
            debug!("Resolving {} from DHT", did);
            self.fetch_document(did).await?
        };
        self.cache.write().await.insert(did.clone(), key);
        Ok(key)
    }
}

/// Verifies signed messages against their claimed signer.
#[derive(Clone)]
pub struct SignatureVerifier {
    resolver: Arc<dyn DidResolver>,
}

impl SignatureVerifier {
    pub fn new(resolver: Arc<dyn DidResolver>) -> Self {
        Self { resolver }
    }

    pub async fn verify(&self, did: &Did, payload: &[u8], signature: &[u8]) -> Result<(), AuthError> {
        let key = self.resolver.resolve(did).await?;
        verify_with_key(&key, did, payload, signature)
    }

    /// Verify a message built or held locally.
    pub async fn verify_payload<M: SignedPayload + Sync>(&self, message: &M) -> MeshResult<()> {
        let payload = message.signing_bytes()?;
        self.verify_signed(M::SCHEMA, message.signer(), &payload, message.signature())
            .await
    }

    /// Verify a decoded message against the signed bytes taken from its
    /// received encoding.
    pub async fn verify_decoded<M: SignedPayload + Sync>(&self, message: &M, signed_bytes: &[u8]) -> MeshResult<()> {
        self.verify_signed(M::SCHEMA, message.signer(), signed_bytes, message.signature())
            .await
    }

    pub async fn verify_signed(
        &self,
        schema: &str,
        signer: &Did,
        signed_bytes: &[u8],
        signature: &[u8],
    ) -> MeshResult<()> {
        self.verify(signer, signed_bytes, signature).await.map_err(|e| {
            warn!("Rejecting {} from {}: {}", schema, signer, e);
            MeshError::Authentication(e)
        })
    }
}
