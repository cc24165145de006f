//! Namespaced KV key builders and ETag helpers for FILESTORE
//! Keep this module focused and small; complex logic belongs in higher layers.

use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

/// Store holding the id -> owner index shared by all owners.
pub const INDEX_STORE: &str = "entry_index";

/// Store holding content blobs for the in-process content collaborator.
pub const BLOB_STORE: &str = "blobs";

/// Per-owner store name. Owner ids come from the identity provider and may contain any
/// characters, so the store name is derived from a hash of the id.
pub fn owner_store(owner_id: &str) -> String {
    format!("owner_{:016x}", xxh3_64(owner_id.as_bytes()))
}

/// Build keys for FILESTORE-scoped namespaces.
pub struct Keys;

impl Keys {
    pub fn entry(id: &Uuid) -> String { format!("entry::{}", id) }
    #[inline]
    pub fn entry_prefix() -> &'static str { "entry::" }
    pub fn owner_of(id: &Uuid) -> String { format!("owner_of::{}", id) }
    #[inline]
    pub fn owner_of_prefix() -> &'static str { "owner_of::" }
    pub fn dedup(token: &str) -> String { format!("dedup::{}", token) }
    pub fn blob(owner_id: &str, blob_id: &Uuid) -> String { format!("blob::{}::{}", owner_store(owner_id), blob_id) }

    /// Parse the entry id back out of an entry key.
    pub fn entry_id(key: &str) -> Option<Uuid> {
        key.strip_prefix(Self::entry_prefix()).and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Stable ETag for a byte slice using xxh3_64; returned as fixed-width lowercase hex.
pub fn etag_for_bytes(bytes: &[u8]) -> String {
    let h = xxh3_64(bytes);
    format!("{h:016x}")
}

#[cfg(test)]
#[path = "kv_tests.rs"]
mod kv_tests;
