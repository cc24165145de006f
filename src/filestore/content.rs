//! Content storage collaborator: turns uploaded bytes into opaque references.
//! Entries only ever hold the returned refs, never the bytes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::storage::SharedStore;

use super::error::{FilestoreError, FilestoreResult};
use super::kv::{etag_for_bytes, Keys, BLOB_STORE};

/// Image transformation appended to a content ref to address its thumbnail.
const THUMBNAIL_TRANSFORM: &str = "tr=w-400,h-300,fo-auto";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredContent {
    pub content_ref: String,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
}

#[async_trait]
pub trait ContentStorage: Send + Sync {
    /// Persist `bytes` for `owner`. Failures surface as `StorageUnavailable`.
    async fn put(&self, owner: &str, name: &str, bytes: &[u8], content_type: &str) -> FilestoreResult<StoredContent>;

    /// Drop previously stored content; unknown refs are ignored.
    async fn remove(&self, content_ref: &str) -> FilestoreResult<()>;
}

/// In-process content storage backed by the `blobs` KV store.
///
/// Refs look like `kv://<db>/blob::<owner store>::<uuid>?etag=<xxh3>`; image thumbnails
/// are the same ref with a transformation suffix, resolved by whatever serves the blobs.
#[derive(Clone)]
pub struct KvContentStorage {
    store: SharedStore,
    db: String,
}

impl KvContentStorage {
    pub fn new(store: SharedStore, db: impl Into<String>) -> Self {
        Self { store, db: db.into() }
    }

    fn key_of<'r>(&self, content_ref: &'r str) -> Option<&'r str> {
        let rest = content_ref.strip_prefix("kv://")?;
        let (db, key) = rest.split_once('/')?;
        if db != self.db {
            return None;
        }
        Some(key.split(['?', '&']).next().unwrap_or(key))
    }

    /// Bytes behind a content ref, if still stored.
    pub fn fetch(&self, content_ref: &str) -> Option<Vec<u8>> {
        let key = self.key_of(content_ref)?;
        self.store.kv_store(&self.db, BLOB_STORE).get_bytes(key)
    }
}

#[async_trait]
impl ContentStorage for KvContentStorage {
    async fn put(&self, owner: &str, name: &str, bytes: &[u8], content_type: &str) -> FilestoreResult<StoredContent> {
        let key = Keys::blob(owner, &Uuid::new_v4());
        let etag = etag_for_bytes(bytes);
        self.store.kv_store(&self.db, BLOB_STORE).set_bytes(key.clone(), bytes, None, None);
        let content_ref = format!("kv://{}/{}?etag={}", self.db, key, etag);
        let thumbnail_ref = content_type.starts_with("image/").then(|| format!("{}&{}", content_ref, THUMBNAIL_TRANSFORM));
        debug!(target: "echofiles::store", "stored {} bytes for '{}' as {}", bytes.len(), name, key);
        Ok(StoredContent { content_ref, thumbnail_ref })
    }

    async fn remove(&self, content_ref: &str) -> FilestoreResult<()> {
        let key = self
            .key_of(content_ref)
            .ok_or_else(|| FilestoreError::StorageUnavailable(format!("foreign content ref '{content_ref}'")))?;
        self.store.kv_store(&self.db, BLOB_STORE).delete(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_fetch_remove() {
        let cs = KvContentStorage::new(SharedStore::in_memory(), "echofiles");
        let stored = cs.put("u1", "notes.txt", b"hello", "text/plain").await.unwrap();
        assert!(stored.content_ref.starts_with("kv://echofiles/blob::"));
        assert!(stored.content_ref.ends_with(&etag_for_bytes(b"hello")));
        assert!(stored.thumbnail_ref.is_none());
        assert_eq!(cs.fetch(&stored.content_ref), Some(b"hello".to_vec()));
        cs.remove(&stored.content_ref).await.unwrap();
        assert_eq!(cs.fetch(&stored.content_ref), None);
    }

    #[tokio::test]
    async fn images_get_thumbnail_refs() {
        let cs = KvContentStorage::new(SharedStore::in_memory(), "echofiles");
        let stored = cs.put("u1", "cat.png", &[0x89, b'P', b'N', b'G'], "image/png").await.unwrap();
        let thumb = stored.thumbnail_ref.unwrap();
        assert!(thumb.starts_with(&stored.content_ref));
        assert_eq!(cs.fetch(&thumb), cs.fetch(&stored.content_ref));
    }

    #[tokio::test]
    async fn foreign_refs_are_rejected() {
        let cs = KvContentStorage::new(SharedStore::in_memory(), "echofiles");
        assert!(cs.remove("https://cdn.example/x.png").await.is_err());
        assert!(cs.remove("kv://otherdb/blob::x").await.is_err());
    }
}
