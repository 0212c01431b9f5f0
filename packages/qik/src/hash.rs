//! Hashing operations and types.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A Blake3 hash, hex encoded.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct Blake3(String);

impl Blake3 {
    /// Hash the contents of a buffer.
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let mut hasher = blake3::Hasher::new();
        hasher.update(buffer);

        let hash = hex::encode(hasher.finalize().as_bytes());
        trace!(?hash, bytes = ?buffer.len(), "hash buffer");
        Self(hash)
    }

    /// Hash the fields of the iterator in order, framing each field with its
    /// length so that no field's bytes can collide with the concatenation of
    /// its neighbors.
    pub fn from_frames(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        let mut bytes = 0;

        for field in fields {
            let field = field.as_ref();
            bytes += field.len();
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }

        let hash = hex::encode(hasher.finalize().as_bytes());
        trace!(?hash, ?bytes, "hash frames");
        Self(hash)
    }

    /// View the hash as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Blake3 {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<[u8]> for Blake3 {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// The digest of a runnable's full dependency state.
///
/// Identical fingerprints imply identical expected outputs; the fingerprint
/// is the cache key for a runnable's entries. See `resolve` for how the
/// digest is computed.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct Fingerprint(Blake3);

impl Fingerprint {
    /// Wrap a computed digest.
    pub fn new(digest: Blake3) -> Self {
        Self(digest)
    }

    /// View the fingerprint as a string.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

/// An opaque content hash produced by the hash source.
///
/// `qik` does not interpret these beyond equality; in practice they are the
/// object ids that `git hash-object` reports.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<[u8]> for ContentHash {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}
