//! `cache` crate: configuration fingerprints and the per-fingerprint
//! resource cache used to reuse expensive handles (live connections,
//! configured agents) across requests.

pub mod error;
pub mod fingerprint;
pub mod resource;

pub use error::CacheError;
pub use fingerprint::{ContentSignature, Fingerprint};
pub use resource::{CacheStats, ResourceCache};
