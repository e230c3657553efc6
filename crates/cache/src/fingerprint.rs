//! Deterministic cache keys derived from resource configuration.
//!
//! Two configurations share a cached resource only when every component of
//! their fingerprint matches.  The content signature ties the key to the
//! version of the backing data, so replacing a data file under an unchanged
//! locator produces a new key instead of reusing a resource built from the
//! old file.

use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::CacheError;

/// Version marker of the data behind a resource locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSignature {
    /// The resource has no versioned backing data (e.g. a remote database).
    None,
    /// Size and modification time of a backing file.
    File { len: u64, modified_ms: u64 },
    /// The backing file is gone.  Distinct from every `File` signature so a
    /// deleted file never maps onto the resource built before deletion.
    Missing,
    /// Content digest of in-memory data.
    Digest { sha256: String },
}

impl ContentSignature {
    /// Signature of a file on disk.  A missing file yields `Missing`; any
    /// other metadata failure is an error.
    pub fn of_path(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let meta = match std::fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::Missing),
            Err(source) => {
                return Err(CacheError::Metadata { path: path.to_path_buf(), source });
            }
        };
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(Self::File { len: meta.len(), modified_ms })
    }

    /// SHA-256 signature of in-memory content.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self::Digest { sha256: format!("{:x}", Sha256::digest(bytes.as_ref())) }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// Cache key for an expensive resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub tenant: String,
    /// Selected model / resource identifier.
    pub model: String,
    pub connection_type: String,
    /// Connection string or equivalent.  Never printed by `Display`.
    pub locator: String,
    pub content: ContentSignature,
    /// Behaviour-affecting flags, kept sorted so insertion order is irrelevant.
    pub flags: BTreeMap<String, String>,
}

impl Fingerprint {
    pub fn new(
        tenant: impl Into<String>,
        model: impl Into<String>,
        connection_type: impl Into<String>,
        locator: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            model: model.into(),
            connection_type: connection_type.into(),
            locator: locator.into(),
            content: ContentSignature::None,
            flags: BTreeMap::new(),
        }
    }

    pub fn with_content(mut self, content: ContentSignature) -> Self {
        self.content = content;
        self
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.flags.insert(name.into(), value.to_string());
        self
    }

    /// Stable hex SHA-256 of the canonical JSON form.  Identical across
    /// processes and runs, so it can appear in logs and external keys.
    pub fn digest(&self) -> String {
        // Struct fields serialise in declaration order and flags are a
        // BTreeMap, so the encoding is canonical.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(&canonical))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digest = self.digest();
        write!(
            f,
            "{}/{}/{}#{}",
            self.tenant,
            self.model,
            self.connection_type,
            &digest[..12]
        )
    }
}
