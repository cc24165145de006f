//! Entity store: the authoritative table of entries, one KV store per owner.
//!
//! Layout inside database `<db>`:
//! - `owner_<xxh3(owner)>` holds `entry::<uuid>` rows (JSON) and `dedup::<token>` keys (TTL)
//! - `entry_index` maps `owner_of::<uuid>` to the owning user, so an id that exists for some
//!   other owner is reported as an ownership mismatch rather than a plain miss.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::{KvStore, KvValue, SharedStore};

use super::error::{FilestoreError, FilestoreResult};
use super::kv::{owner_store, Keys, INDEX_STORE};
use super::types::{Entry, EntryPatch, NewEntry};

/// Listing order: folders first, then case-insensitive name, then creation time, then id.
pub fn entry_order(a: &Entry, b: &Entry) -> Ordering {
    b.is_folder
        .cmp(&a.is_folder)
        .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by(entry_order);
}

fn decode(value: KvValue, id: &Uuid) -> FilestoreResult<Entry> {
    match value {
        KvValue::Json(v) => Ok(serde_json::from_value(v)?),
        _ => Err(FilestoreError::Inconsistent { id: id.to_string(), reason: "entry row is not JSON" }),
    }
}

#[derive(Clone)]
pub struct EntityStore {
    store: SharedStore,
    db: String,
    structural: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl EntityStore {
    pub fn new(store: SharedStore, db: impl Into<String>) -> Self {
        Self { store, db: db.into(), structural: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn owner_kv(&self, owner: &str) -> KvStore { self.store.kv_store(&self.db, &owner_store(owner)) }

    fn index(&self) -> KvStore { self.store.kv_store(&self.db, INDEX_STORE) }

    /// Per-owner mutex serializing re-parenting and subtree path rewrites.
    pub fn structural_lock(&self, owner: &str) -> Arc<Mutex<()>> {
        self.structural.lock().entry(owner.to_string()).or_default().clone()
    }

    /// Error for an id that has no row in `owner`'s store.
    fn missing(&self, id: &Uuid, owner: &str) -> FilestoreError {
        match self.index().get(&Keys::owner_of(id)) {
            Some(KvValue::Str(o)) if o != owner => {
                warn!(target: "echofiles::store", "cross-owner access to {} by {}", id, owner);
                FilestoreError::OwnershipMismatch { id: id.to_string() }
            }
            _ => FilestoreError::not_found(id.to_string()),
        }
    }

    pub fn get(&self, id: &Uuid, owner: &str) -> FilestoreResult<Entry> {
        match self.owner_kv(owner).get(&Keys::entry(id)) {
            Some(v) => decode(v, id),
            None => Err(self.missing(id, owner)),
        }
    }

    /// Every entry of `owner`, in listing order. Undecodable rows fail the whole read.
    pub fn snapshot(&self, owner: &str) -> FilestoreResult<Vec<Entry>> {
        let mut out = Vec::new();
        for (k, v) in self.owner_kv(owner).scan_prefix(Keys::entry_prefix()) {
            let id = Keys::entry_id(&k).unwrap_or_else(Uuid::nil);
            out.push(decode(v, &id)?);
        }
        sort_entries(&mut out);
        Ok(out)
    }

    /// Direct children of `parent` (or root-level entries), trashed ones included.
    pub fn list_children(&self, parent: Option<&Uuid>, owner: &str) -> FilestoreResult<Vec<Entry>> {
        if let Some(p) = parent {
            self.get(p, owner)?;
        }
        let mut out: Vec<Entry> = self
            .snapshot(owner)?
            .into_iter()
            .filter(|e| e.parent_id.as_ref() == parent)
            .collect();
        sort_entries(&mut out);
        Ok(out)
    }

    pub fn insert(&self, new: NewEntry) -> FilestoreResult<Entry> {
        self.insert_with_id(Uuid::new_v4(), new)
    }

    /// Insert with a caller-reserved id. The row is written in a single `set`.
    pub(crate) fn insert_with_id(&self, id: Uuid, new: NewEntry) -> FilestoreResult<Entry> {
        let now = Utc::now();
        let is_folder = new.is_folder();
        let (size, content_type, content_ref, thumbnail_ref) = match new.file {
            Some(f) => (f.size, Some(f.content_type), f.content_ref, f.thumbnail_ref),
            None => (0, None, None, None),
        };
        let entry = Entry {
            id,
            owner_id: new.owner_id,
            parent_id: new.parent_id,
            name: new.name,
            path: new.path,
            size,
            content_type,
            content_ref,
            thumbnail_ref,
            is_folder,
            is_starred: false,
            is_trash: false,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&entry)?;
        self.index().set(Keys::owner_of(&id), KvValue::Str(entry.owner_id.clone()), None, None);
        self.owner_kv(&entry.owner_id).set(Keys::entry(&id), KvValue::Json(json), None, None);
        debug!(target: "echofiles::store", "insert {} path='{}' folder={}", id, entry.path, is_folder);
        Ok(entry)
    }

    /// Apply `patch` to one row under its write lock and bump `updated_at`.
    pub fn update(&self, id: &Uuid, owner: &str, patch: &EntryPatch) -> FilestoreResult<Entry> {
        let now = Utc::now();
        let res = self.owner_kv(owner).update_json(&Keys::entry(id), |v| {
            let mut e: Entry = serde_json::from_value(v)?;
            patch.apply(&mut e, now);
            Ok::<_, FilestoreError>(serde_json::to_value(&e)?)
        })?;
        match res {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Err(self.missing(id, owner)),
        }
    }

    /// Apply several patches atomically: either every row is rewritten or none is.
    pub fn update_many(&self, owner: &str, patches: &[(Uuid, EntryPatch)]) -> FilestoreResult<Vec<Entry>> {
        if patches.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let by_key: HashMap<String, &EntryPatch> = patches.iter().map(|(id, p)| (Keys::entry(id), p)).collect();
        let keys: Vec<String> = patches.iter().map(|(id, _)| Keys::entry(id)).collect();
        let kv = self.owner_kv(owner);
        let mut updated = Vec::with_capacity(keys.len());
        let all_present = kv.update_json_many(&keys, |k, v| {
            let mut e: Entry = serde_json::from_value(v)?;
            if let Some(p) = by_key.get(k) {
                p.apply(&mut e, now);
            }
            let out = serde_json::to_value(&e)?;
            updated.push(e);
            Ok::<_, FilestoreError>(out)
        })?;
        if !all_present {
            let absent = patches.iter().find(|(id, _)| kv.get(&Keys::entry(id)).is_none());
            return Err(match absent {
                Some((id, _)) => self.missing(id, owner),
                None => FilestoreError::Inconsistent { id: owner.to_string(), reason: "batch update raced a removal" },
            });
        }
        Ok(updated)
    }

    pub fn remove(&self, id: &Uuid, owner: &str) -> FilestoreResult<Entry> {
        let key = Keys::entry(id);
        let mut removed = self.owner_kv(owner).remove_where(&key, |k, _| k == key);
        match removed.pop() {
            Some((_, v)) => {
                self.index().delete(&Keys::owner_of(id));
                debug!(target: "echofiles::store", "remove {}", id);
                decode(v, id)
            }
            None => Err(self.missing(id, owner)),
        }
    }

    /// Remove every entry of `owner` matching `pred` under one write lock. Rows that fail
    /// to decode are kept.
    pub fn remove_where<P>(&self, owner: &str, mut pred: P) -> FilestoreResult<usize>
    where
        P: FnMut(&Entry) -> bool,
    {
        let removed = self.owner_kv(owner).remove_where(Keys::entry_prefix(), |_, v| match v {
            KvValue::Json(j) => serde_json::from_value::<Entry>(j.clone()).map(|e| pred(&e)).unwrap_or(false),
            _ => false,
        });
        self.drop_index(removed.iter().map(|(k, _)| k.as_str()));
        Ok(removed.len())
    }

    /// Let `select` see the owner's whole entry set and name the ids to drop; selection and
    /// removal happen under the same write lock.
    pub fn remove_selected<F>(&self, owner: &str, select: F) -> FilestoreResult<Vec<Entry>>
    where
        F: FnOnce(&[Entry]) -> Vec<Uuid>,
    {
        let removed = self.owner_kv(owner).remove_selected(Keys::entry_prefix(), |view| {
            let entries: Vec<Entry> = view
                .iter()
                .filter_map(|(k, v)| match v {
                    KvValue::Json(j) => match serde_json::from_value::<Entry>((*j).clone()) {
                        Ok(e) => Some(e),
                        Err(err) => {
                            warn!(target: "echofiles::store", "skipping undecodable row {}: {}", k, err);
                            None
                        }
                    },
                    _ => None,
                })
                .collect();
            select(&entries).iter().map(Keys::entry).collect()
        });
        self.drop_index(removed.iter().map(|(k, _)| k.as_str()));
        let mut out = Vec::with_capacity(removed.len());
        for (k, v) in removed {
            let id = Keys::entry_id(&k).unwrap_or_else(Uuid::nil);
            out.push(decode(v, &id)?);
        }
        Ok(out)
    }

    fn drop_index<'a>(&self, keys: impl Iterator<Item = &'a str>) {
        let index = self.index();
        for id in keys.filter_map(Keys::entry_id) {
            index.delete(&Keys::owner_of(&id));
        }
    }

    /// Reserve `token` for `id`. Returns the id already holding the token, if any.
    pub fn claim_dedup(&self, owner: &str, token: &str, id: Uuid, ttl: Duration) -> Option<Uuid> {
        let ttl = (!ttl.is_zero()).then_some(ttl);
        match self.owner_kv(owner).set_if_absent(Keys::dedup(token), KvValue::Str(id.to_string()), ttl)? {
            KvValue::Str(prior) => Uuid::parse_str(&prior).ok(),
            _ => None,
        }
    }

    pub fn release_dedup(&self, owner: &str, token: &str) {
        self.owner_kv(owner).delete(&Keys::dedup(token));
    }

    /// Overwrite a raw row. Only used to stage damaged hierarchies in tests.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, entry: &Entry) {
        if let Ok(json) = serde_json::to_value(entry) {
            self.owner_kv(&entry.owner_id).set(Keys::entry(&entry.id), KvValue::Json(json), None, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::types::FileMetadata;

    fn es() -> EntityStore { EntityStore::new(SharedStore::in_memory(), "echofiles") }

    fn folder(owner: &str, parent: Option<Uuid>, name: &str, path: &str) -> NewEntry {
        NewEntry { owner_id: owner.into(), parent_id: parent, name: name.into(), path: path.into(), file: None }
    }

    fn file(owner: &str, parent: Option<Uuid>, name: &str, path: &str, size: u64) -> NewEntry {
        NewEntry {
            owner_id: owner.into(),
            parent_id: parent,
            name: name.into(),
            path: path.into(),
            file: Some(FileMetadata { size, content_type: "text/plain".into(), content_ref: None, thumbnail_ref: None }),
        }
    }

    #[test]
    fn insert_assigns_identity_and_folder_size() {
        let s = es();
        let f = s.insert(folder("u1", None, "Docs", "/Docs")).unwrap();
        assert!(f.is_folder);
        assert_eq!(f.size, 0);
        assert!(f.content_type.is_none());
        assert_eq!(f.created_at, f.updated_at);
        assert_eq!(s.get(&f.id, "u1").unwrap(), f);
    }

    #[test]
    fn cross_owner_reads_are_ownership_errors() {
        let s = es();
        let f = s.insert(folder("alice", None, "Docs", "/Docs")).unwrap();
        assert!(matches!(s.get(&f.id, "bob"), Err(FilestoreError::OwnershipMismatch { .. })));
        assert!(matches!(s.update(&f.id, "bob", &EntryPatch::toggle_star()), Err(FilestoreError::OwnershipMismatch { .. })));
        assert!(matches!(s.remove(&f.id, "bob"), Err(FilestoreError::OwnershipMismatch { .. })));
        assert!(matches!(s.get(&Uuid::new_v4(), "bob"), Err(FilestoreError::NotFound { .. })));
        assert!(matches!(s.list_children(Some(&f.id), "bob"), Err(FilestoreError::OwnershipMismatch { .. })));
    }

    #[test]
    fn children_are_ordered_folders_first() {
        let s = es();
        let root = s.insert(folder("u", None, "root", "/root")).unwrap();
        let p = Some(root.id);
        s.insert(file("u", p, "b.txt", "/root/b.txt", 1)).unwrap();
        s.insert(file("u", p, "A.txt", "/root/A.txt", 1)).unwrap();
        s.insert(folder("u", p, "zeta", "/root/zeta")).unwrap();
        let names: Vec<String> = s.list_children(p.as_ref(), "u").unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["zeta", "A.txt", "b.txt"]);
        assert_eq!(s.list_children(None, "u").unwrap().len(), 1);
    }

    #[test]
    fn update_many_is_all_or_nothing() {
        let s = es();
        let a = s.insert(folder("u", None, "a", "/a")).unwrap();
        let ghost = Uuid::new_v4();
        let res = s.update_many("u", &[(a.id, EntryPatch::set_path("/x".into())), (ghost, EntryPatch::default())]);
        assert!(matches!(res, Err(FilestoreError::NotFound { .. })));
        assert_eq!(s.get(&a.id, "u").unwrap().path, "/a");
    }

    #[test]
    fn remove_where_and_index_cleanup() {
        let s = es();
        let a = s.insert(file("u", None, "a", "/a", 1)).unwrap();
        let b = s.insert(file("u", None, "b", "/b", 1)).unwrap();
        s.update(&a.id, "u", &EntryPatch::set_trash(true)).unwrap();
        assert_eq!(s.remove_where("u", |e| e.is_trash).unwrap(), 1);
        assert!(matches!(s.get(&a.id, "other"), Err(FilestoreError::NotFound { .. })));
        assert!(s.get(&b.id, "u").is_ok());
    }

    #[test]
    fn dedup_tokens_are_claimed_once() {
        let s = es();
        let first = Uuid::new_v4();
        assert_eq!(s.claim_dedup("u", "tok", first, Duration::from_secs(60)), None);
        assert_eq!(s.claim_dedup("u", "tok", Uuid::new_v4(), Duration::from_secs(60)), Some(first));
        assert_eq!(s.claim_dedup("v", "tok", Uuid::new_v4(), Duration::from_secs(60)), None);
        s.release_dedup("u", "tok");
        assert_eq!(s.claim_dedup("u", "tok", Uuid::new_v4(), Duration::from_secs(60)), None);
    }
}
