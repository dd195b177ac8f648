//! Core identity and content-addressing types shared by the mesh crates.

pub mod cid_model;
pub mod did;
pub mod did_key;

pub use cid_model::{Cid, CidError};
pub use did::{Did, DidParseError};
pub use did_key::{DidKey, DidKeyError};
