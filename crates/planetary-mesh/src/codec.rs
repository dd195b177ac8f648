//! Canonical DAG-CBOR encoding and the signing convention for mesh messages.

use crate::error::{MeshError, MeshResult};
use crate::identity::MeshIdentity;
use icn_core_types::Did;
use ipld_core::ipld::Ipld;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Field every signed message carries its signature in
const SIGNATURE_FIELD: &str = "signature";

/// Encode a value as canonical DAG-CBOR.
pub fn to_canonical<T: Serialize>(value: &T) -> MeshResult<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| MeshError::Malformed(format!("encode: {}", e)))
}

/// Decode DAG-CBOR. Unknown fields are ignored, missing required fields fail.
pub fn from_canonical<T: DeserializeOwned>(bytes: &[u8]) -> MeshResult<T> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(|e| MeshError::Malformed(format!("decode: {}", e)))
}

/// Signed bytes for a message body in its generic IPLD form: the versioned
/// schema name, a zero byte, then the canonical encoding of the body with an
/// empty signature.
///
/// Working on the generic form keeps fields this build does not know about
/// inside the signed bytes, so a newer peer's additive fields still verify.
pub fn signing_bytes_of(schema: &str, body: Ipld) -> MeshResult<Vec<u8>> {
    let Ipld::Map(mut fields) = body else {
        return Err(MeshError::Malformed(format!("{} body is not a map", schema)));
    };
    match fields.get_mut(SIGNATURE_FIELD) {
        Some(signature) => *signature = Ipld::Bytes(Vec::new()),
        None => return Err(MeshError::Malformed(format!("{} has no signature", schema))),
    }
    let encoded = to_canonical(&Ipld::Map(fields))?;
    let mut bytes = Vec::with_capacity(schema.len() + 1 + encoded.len());
    bytes.extend_from_slice(schema.as_bytes());
    bytes.push(0);
    bytes.extend(encoded);
    Ok(bytes)
}

/// Decode a signed message along with the bytes its signature covers, taken
/// from the encoding as received rather than from the typed value.
pub fn decode_signed<M: SignedPayload + DeserializeOwned>(bytes: &[u8]) -> MeshResult<(M, Vec<u8>)> {
    let message: M = from_canonical(bytes)?;
    let body: Ipld = from_canonical(bytes)?;
    let signed = signing_bytes_of(M::SCHEMA, body)?;
    Ok((message, signed))
}

/// A message that carries its own signature over its canonical encoding.
///
/// See [`signing_bytes_of`] for the signed bytes. The name prefix keeps a
/// signature for one message kind from validating another.
pub trait SignedPayload: Serialize + Clone {
    /// Versioned schema name, e.g. `JobBidV1`
    const SCHEMA: &'static str;

    /// DID whose key must have produced the signature
    fn signer(&self) -> &Did;
    fn signature(&self) -> &[u8];
    fn signature_mut(&mut self) -> &mut Vec<u8>;

    /// Signed bytes of a locally held value. Inbound messages use the bytes
    /// from [`decode_signed`] instead.
    fn signing_bytes(&self) -> MeshResult<Vec<u8>> {
        let body: Ipld = from_canonical(&to_canonical(self)?)?;
        signing_bytes_of(Self::SCHEMA, body)
    }

    /// Sign in place with the node identity. The signer field must already
    /// name this identity.
    fn sign_with(mut self, identity: &MeshIdentity) -> MeshResult<Self> {
        if self.signer() != identity.did() {
            return Err(MeshError::contextual(format!(
                "{} names signer {} but local identity is {}",
                Self::SCHEMA,
                self.signer(),
                identity.did()
            )));
        }
        let bytes = self.signing_bytes()?;
        *self.signature_mut() = identity.sign(&bytes);
        Ok(self)
    }
}

macro_rules! signed_payload {
    ($ty:ty, $schema:literal, $signer:ident) => {
        impl SignedPayload for $ty {
            const SCHEMA: &'static str = $schema;

            fn signer(&self) -> &Did {
                &self.$signer
            }

            fn signature(&self) -> &[u8] {
                &self.signature
            }

            fn signature_mut(&mut self) -> &mut Vec<u8> {
                &mut self.signature
            }
        }
    };
}

signed_payload!(crate::types::NodeCapability, "CapabilityAdvertisementV1", node_did);
signed_payload!(crate::types::JobAnnouncement, "JobAnnouncementV1", originator_did);
signed_payload!(crate::types::Bid, "JobBidV1", executor_did);
signed_payload!(crate::types::Assignment, "JobAssignmentV1", originator_did);
signed_payload!(crate::types::StatusUpdate, "JobStatusUpdateV1", executor_did);
signed_payload!(crate::types::ReceiptAvailable, "ExecutionReceiptAvailableV1", executor_did);
signed_payload!(crate::types::InteractiveMessage, "InteractiveMessageV1", sender_did);
signed_payload!(crate::receipt::ExecutionReceipt, "ExecutionReceiptV1", executor_did);
signed_payload!(crate::identity::DidDocument, "DidDocumentV1", id);
