//! Content addressing for course material kept off the ledger.
//!
//! Blobs are identified by `sha256-<base64url digest>`. The ledger only ever
//! stores the identifier string.

use std::{
    collections::BTreeMap,
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("content store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed content reference {0:?}")]
    InvalidRef(String),
    #[error("content {0} not found")]
    NotFound(ContentRef),
    #[error("stored bytes for {0} do not match their digest")]
    DigestMismatch(ContentRef),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentRef(String);

impl ContentRef {
    pub const PREFIX: &'static str = "sha256-";

    pub fn for_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{}{}", Self::PREFIX, URL_SAFE_NO_PAD.encode(digest)))
    }

    pub fn parse(value: &str) -> Result<Self, ContentError> {
        let encoded = value
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| ContentError::InvalidRef(value.to_owned()))?;
        let digest = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| ContentError::InvalidRef(value.to_owned()))?;
        if digest.len() != 32 {
            return Err(ContentError::InvalidRef(value.to_owned()));
        }
        Ok(Self(value.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, bytes: &[u8]) -> bool {
        *self == Self::for_bytes(bytes)
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentRef {
    type Err = ContentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentRef {
    type Error = ContentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentRef> for String {
    fn from(value: ContentRef) -> Self {
        value.0
    }
}

pub trait ContentStore {
    /// Stores a blob and returns its identifier. Storing the same bytes twice
    /// yields the same identifier.
    fn put_blob(&mut self, bytes: &[u8]) -> Result<ContentRef, ContentError>;

    fn get(&self, content_ref: &ContentRef) -> Result<Vec<u8>, ContentError>;

    fn put_metadata(&mut self, metadata: &serde_json::Value) -> Result<ContentRef, ContentError> {
        let bytes = serde_json::to_vec(metadata)?;
        self.put_blob(&bytes)
    }
}

/// One file per blob, named by its identifier.
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ContentError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, content_ref: &ContentRef) -> PathBuf {
        self.root.join(content_ref.as_str())
    }
}

impl ContentStore for FsContentStore {
    fn put_blob(&mut self, bytes: &[u8]) -> Result<ContentRef, ContentError> {
        let content_ref = ContentRef::for_bytes(bytes);
        let path = self.blob_path(&content_ref);
        if path.exists() {
            debug!(%content_ref, "blob already pinned");
            return Ok(content_ref);
        }
        // a blob only appears under its id once fully written
        let tmp = path.with_extension("partial");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!(%content_ref, len = bytes.len(), "blob pinned");
        Ok(content_ref)
    }

    fn get(&self, content_ref: &ContentRef) -> Result<Vec<u8>, ContentError> {
        let path = self.blob_path(content_ref);
        if !path.exists() {
            return Err(ContentError::NotFound(content_ref.clone()));
        }
        let bytes = fs::read(&path)?;
        if !content_ref.matches(&bytes) {
            return Err(ContentError::DigestMismatch(content_ref.clone()));
        }
        Ok(bytes)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryContentStore {
    blobs: BTreeMap<ContentRef, Vec<u8>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl ContentStore for MemoryContentStore {
    fn put_blob(&mut self, bytes: &[u8]) -> Result<ContentRef, ContentError> {
        let content_ref = ContentRef::for_bytes(bytes);
        self.blobs
            .entry(content_ref.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(content_ref)
    }

    fn get(&self, content_ref: &ContentRef) -> Result<Vec<u8>, ContentError> {
        self.blobs
            .get(content_ref)
            .cloned()
            .ok_or_else(|| ContentError::NotFound(content_ref.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_deterministic_and_parseable() {
        let a = ContentRef::for_bytes(b"lesson one");
        let b = ContentRef::for_bytes(b"lesson one");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with(ContentRef::PREFIX));
        assert_eq!(ContentRef::parse(a.as_str()).unwrap(), a);
        assert_ne!(a, ContentRef::for_bytes(b"lesson two"));
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        for bad in ["", "sha256-", "md5-abcd", "sha256-!!!", "sha256-AAAA"] {
            assert!(matches!(
                ContentRef::parse(bad),
                Err(ContentError::InvalidRef(_))
            ));
        }
    }

    #[test]
    fn memory_store_dedupes() {
        let mut store = MemoryContentStore::new();
        let first = store.put_blob(b"video").unwrap();
        let second = store.put_blob(b"video").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&first).unwrap(), b"video");
    }

    #[test]
    fn metadata_is_stored_as_json() {
        let mut store = MemoryContentStore::new();
        let meta = serde_json::json!({ "title": "Rust", "lessons": 12 });
        let content_ref = store.put_metadata(&meta).unwrap();
        let bytes = store.get(&content_ref).unwrap();
        let back: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn fs_store_round_trips_and_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsContentStore::open(dir.path().join("content")).unwrap();
        let content_ref = store.put_blob(b"syllabus").unwrap();
        assert_eq!(store.get(&content_ref).unwrap(), b"syllabus");
        assert_eq!(store.put_blob(b"syllabus").unwrap(), content_ref);

        fs::write(store.root().join(content_ref.as_str()), b"tampered").unwrap();
        assert!(matches!(
            store.get(&content_ref),
            Err(ContentError::DigestMismatch(_))
        ));

        let missing = ContentRef::for_bytes(b"never stored");
        assert!(matches!(store.get(&missing), Err(ContentError::NotFound(_))));
    }

    #[test]
    fn serde_uses_plain_string() {
        let content_ref = ContentRef::for_bytes(b"x");
        let json = serde_json::to_string(&content_ref).unwrap();
        assert_eq!(json, format!("\"{}\"", content_ref));
        assert!(serde_json::from_str::<ContentRef>("\"nope\"").is_err());
    }
}
