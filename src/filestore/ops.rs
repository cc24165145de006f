//! Mutation API: validated create/star/trash/delete/rename/move plus listings.
//! Every successful mutation publishes a `ListingStale` signal for the owner.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage::SharedStore;

use super::config::EffectiveConfig;
use super::content::{ContentStorage, KvContentStorage};
use super::correlation::RequestContext;
use super::error::{FilestoreError, FilestoreResult};
use super::events::{ChangeFeed, StaleReason};
use super::hierarchy::{rebased_paths, subtree_height, Validator};
use super::lifecycle::Lifecycle;
use super::store::EntityStore;
use super::types::{Crumb, Entry, EntryPatch, FileMetadata, NewEntry, View, ViewCounts};
use super::views::{self, Scope};

/// Database name under which all filestore KV stores live.
pub const DEFAULT_DB: &str = "echofiles";

#[derive(Clone)]
pub struct Filestore {
    entities: EntityStore,
    content: Arc<dyn ContentStorage>,
    config: EffectiveConfig,
    feed: ChangeFeed,
}

impl Filestore {
    pub fn new(store: SharedStore, config: EffectiveConfig, content: Arc<dyn ContentStorage>) -> Self {
        Self { entities: EntityStore::new(store, DEFAULT_DB), content, config, feed: ChangeFeed::default() }
    }

    /// Filestore whose content lives in the same shared store.
    pub fn with_kv_content(store: SharedStore, config: EffectiveConfig) -> Self {
        let content = Arc::new(KvContentStorage::new(store.clone(), DEFAULT_DB));
        Self::new(store, config, content)
    }

    pub fn in_memory(config: EffectiveConfig) -> Self {
        Self::with_kv_content(SharedStore::in_memory(), config)
    }

    pub fn config(&self) -> &EffectiveConfig { &self.config }

    pub fn feed(&self) -> &ChangeFeed { &self.feed }

    pub fn entities(&self) -> &EntityStore { &self.entities }

    fn validator(&self) -> Validator<'_> { Validator::new(&self.entities, self.config.max_depth) }

    fn lifecycle(&self) -> Lifecycle<'_> { Lifecycle::new(&self.entities, self.config.cascade_trash) }

    fn dedup_ttl(&self) -> Duration { Duration::from_secs(self.config.dedup_ttl_secs) }

    fn check_file_metadata(file: &FileMetadata) -> FilestoreResult<()> {
        let ct = file.content_type.trim();
        if ct.is_empty() {
            return Err(FilestoreError::InvalidContent { reason: "content type is required for files".into() });
        }
        if ct.eq_ignore_ascii_case("folder") {
            return Err(FilestoreError::InvalidContent { reason: "'folder' is not a content type".into() });
        }
        Ok(())
    }

    /// Validate and insert under the owner's structural lock with a reserved id.
    fn insert_validated(
        &self,
        owner: &str,
        id: Uuid,
        parent_id: Option<&Uuid>,
        name: &str,
        file: Option<FileMetadata>,
    ) -> FilestoreResult<Entry> {
        let lock = self.entities.structural_lock(owner);
        let _guard = lock.lock();
        let placement = self.validator().validate_new(owner, parent_id, name)?;
        self.entities.insert_with_id(
            id,
            NewEntry { owner_id: owner.to_string(), parent_id: placement.parent_id, name: placement.name, path: placement.path, file },
        )
    }

    /// Reserve `token` for `id`; `Some` carries the entry created by an earlier request.
    /// A token whose entry is not written yet belongs to a create still in flight.
    fn dedup_hit(&self, ctx: &RequestContext, token: Option<&str>, id: Uuid) -> FilestoreResult<Option<Entry>> {
        let Some(tok) = token else { return Ok(None) };
        match self.entities.claim_dedup(ctx.owner(), tok, id, self.dedup_ttl()) {
            Some(prior) => {
                info!(target: "echofiles::ops", request_id = %ctx.request_id, "dedup token '{}' already produced {}", tok, prior);
                match self.entities.get(&prior, ctx.owner()) {
                    Ok(e) => Ok(Some(e)),
                    Err(FilestoreError::NotFound { .. }) => Err(FilestoreError::CreateInProgress { token: tok.to_string() }),
                    Err(e) => Err(e),
                }
            }
            None => Ok(None),
        }
    }

    fn created(&self, ctx: &RequestContext, entry: &Entry) {
        info!(target: "echofiles::ops", request_id = %ctx.request_id, owner = %ctx.owner(), "created {} '{}' folder={}", entry.id, entry.path, entry.is_folder);
        self.feed.publish(ctx.owner(), StaleReason::Created, Some(entry.id));
    }

    /// Create a folder (`file == None`) or a file record whose content was stored elsewhere.
    /// A repeated `dedup_token` within the TTL returns the originally created entry.
    pub fn create_entry(
        &self,
        ctx: &RequestContext,
        parent_id: Option<Uuid>,
        name: &str,
        file: Option<FileMetadata>,
        dedup_token: Option<&str>,
    ) -> FilestoreResult<Entry> {
        if let Some(f) = &file {
            Self::check_file_metadata(f)?;
        }
        let id = Uuid::new_v4();
        if let Some(prior) = self.dedup_hit(ctx, dedup_token, id)? {
            return Ok(prior);
        }
        match self.insert_validated(ctx.owner(), id, parent_id.as_ref(), name, file) {
            Ok(entry) => {
                self.created(ctx, &entry);
                Ok(entry)
            }
            Err(e) => {
                if let Some(tok) = dedup_token {
                    self.entities.release_dedup(ctx.owner(), tok);
                }
                debug!(target: "echofiles::ops", request_id = %ctx.request_id, "create '{}' rejected: {}", name, e);
                Err(e)
            }
        }
    }

    pub fn create_folder(&self, ctx: &RequestContext, parent_id: Option<Uuid>, name: &str, dedup_token: Option<&str>) -> FilestoreResult<Entry> {
        self.create_entry(ctx, parent_id, name, None, dedup_token)
    }

    /// Check limits, hand the bytes to the content collaborator, then record the entry.
    /// Nothing is written when the collaborator fails or validation rejects the request.
    pub async fn upload_file(
        &self,
        ctx: &RequestContext,
        parent_id: Option<Uuid>,
        name: &str,
        bytes: &[u8],
        content_type: &str,
        dedup_token: Option<&str>,
    ) -> FilestoreResult<Entry> {
        let owner = ctx.owner();
        let size = bytes.len() as u64;
        if size > self.config.max_upload_bytes {
            return Err(FilestoreError::InvalidContent {
                reason: format!("file is {} bytes, the limit is {}", size, self.config.max_upload_bytes),
            });
        }
        if !self.config.allows_content_type(content_type) {
            return Err(FilestoreError::InvalidContent { reason: format!("content type '{}' is not accepted", content_type) });
        }
        // fail fast before any bytes are stored; the insert re-validates under the lock
        self.validator().validate_new(owner, parent_id.as_ref(), name)?;

        let id = Uuid::new_v4();
        if let Some(prior) = self.dedup_hit(ctx, dedup_token, id)? {
            return Ok(prior);
        }
        let release = || {
            if let Some(tok) = dedup_token {
                self.entities.release_dedup(owner, tok);
            }
        };

        let stored = match self.content.put(owner, name, bytes, content_type).await {
            Ok(s) => s,
            Err(e) => {
                release();
                warn!(target: "echofiles::ops", request_id = %ctx.request_id, "content storage failed for '{}': {}", name, e);
                return Err(match e {
                    FilestoreError::StorageUnavailable(msg) => FilestoreError::StorageUnavailable(msg),
                    other => FilestoreError::StorageUnavailable(other.to_string()),
                });
            }
        };
        let file = FileMetadata {
            size,
            content_type: content_type.to_string(),
            content_ref: Some(stored.content_ref.clone()),
            thumbnail_ref: stored.thumbnail_ref,
        };
        match self.insert_validated(owner, id, parent_id.as_ref(), name, Some(file)) {
            Ok(entry) => {
                self.created(ctx, &entry);
                Ok(entry)
            }
            Err(e) => {
                release();
                if let Err(rm) = self.content.remove(&stored.content_ref).await {
                    warn!(target: "echofiles::ops", request_id = %ctx.request_id, "orphaned content {}: {}", stored.content_ref, rm);
                }
                Err(e)
            }
        }
    }

    /// Toggle the star flag; returns the entry as stored afterwards.
    pub fn set_star(&self, ctx: &RequestContext, id: &Uuid) -> FilestoreResult<Entry> {
        let entry = self.lifecycle().toggle_star(id, ctx.owner())?;
        info!(target: "echofiles::ops", request_id = %ctx.request_id, "{} starred={}", id, entry.is_starred);
        self.feed.publish(ctx.owner(), StaleReason::Starred, Some(entry.id));
        Ok(entry)
    }

    /// Toggle the trash flag; `is_trash` on the result tells trashed from restored.
    pub fn set_trash(&self, ctx: &RequestContext, id: &Uuid) -> FilestoreResult<Entry> {
        let entry = self.lifecycle().toggle_trash(id, ctx.owner())?;
        info!(target: "echofiles::ops", request_id = %ctx.request_id, "{} trash={}", id, entry.is_trash);
        self.feed.publish(ctx.owner(), StaleReason::Trashed, Some(entry.id));
        Ok(entry)
    }

    async fn purge_content(&self, ctx: &RequestContext, removed: &[Entry]) {
        for r in removed.iter().filter_map(|e| e.content_ref.as_deref()) {
            if let Err(e) = self.content.remove(r).await {
                warn!(target: "echofiles::ops", request_id = %ctx.request_id, "could not drop content {}: {}", r, e);
            }
        }
    }

    /// Permanently remove a trashed entry with its subtree. Returns the number of rows removed.
    pub async fn delete_permanently(&self, ctx: &RequestContext, id: &Uuid) -> FilestoreResult<usize> {
        let removed = self.lifecycle().delete_permanently(id, ctx.owner())?;
        self.purge_content(ctx, &removed).await;
        info!(target: "echofiles::ops", request_id = %ctx.request_id, "deleted {} ({} rows)", id, removed.len());
        self.feed.publish(ctx.owner(), StaleReason::Deleted, Some(*id));
        Ok(removed.len())
    }

    /// Remove every trashed entry of the caller. Returns the number of rows removed.
    pub async fn empty_trash(&self, ctx: &RequestContext) -> FilestoreResult<usize> {
        let removed = self.lifecycle().empty_trash(ctx.owner())?;
        self.purge_content(ctx, &removed).await;
        info!(target: "echofiles::ops", request_id = %ctx.request_id, owner = %ctx.owner(), "emptied trash ({} rows)", removed.len());
        if !removed.is_empty() {
            self.feed.publish(ctx.owner(), StaleReason::TrashEmptied, None);
        }
        Ok(removed.len())
    }

    /// Rename in place; the entry's path and every descendant path are rewritten together.
    pub fn rename_entry(&self, ctx: &RequestContext, id: &Uuid, new_name: &str) -> FilestoreResult<Entry> {
        let owner = ctx.owner();
        let lock = self.entities.structural_lock(owner);
        let _guard = lock.lock();
        let entry = self.entities.get(id, owner)?;
        let placement = self.validator().validate_rename(&entry, new_name)?;
        let snapshot = self.entities.snapshot(owner)?;
        let mut patches = vec![(
            entry.id,
            EntryPatch { name: Some(placement.name), path: Some(placement.path.clone()), ..EntryPatch::default() },
        )];
        patches.extend(rebased_paths(&snapshot, &entry.id, &placement.path).into_iter().map(|(d, p)| (d, EntryPatch::set_path(p))));
        let renamed = self.rewrite(owner, id, &patches)?;
        info!(target: "echofiles::ops", request_id = %ctx.request_id, "renamed {} to '{}' ({} rows)", id, renamed.path, patches.len());
        self.feed.publish(owner, StaleReason::Renamed, Some(entry.id));
        Ok(renamed)
    }

    /// Re-parent under `new_parent` (root for `None`), rewriting the subtree's paths.
    pub fn move_entry(&self, ctx: &RequestContext, id: &Uuid, new_parent: Option<Uuid>) -> FilestoreResult<Entry> {
        let owner = ctx.owner();
        let lock = self.entities.structural_lock(owner);
        let _guard = lock.lock();
        let entry = self.entities.get(id, owner)?;
        let snapshot = self.entities.snapshot(owner)?;
        let height = subtree_height(&snapshot, &entry.id);
        let placement = self.validator().validate_move(&entry, new_parent.as_ref(), height)?;
        let mut patches = vec![(
            entry.id,
            EntryPatch { parent_id: Some(placement.parent_id), path: Some(placement.path.clone()), ..EntryPatch::default() },
        )];
        patches.extend(rebased_paths(&snapshot, &entry.id, &placement.path).into_iter().map(|(d, p)| (d, EntryPatch::set_path(p))));
        let moved = self.rewrite(owner, id, &patches)?;
        info!(target: "echofiles::ops", request_id = %ctx.request_id, "moved {} to '{}' ({} rows)", id, moved.path, patches.len());
        self.feed.publish(owner, StaleReason::Moved, Some(entry.id));
        Ok(moved)
    }

    fn rewrite(&self, owner: &str, id: &Uuid, patches: &[(Uuid, EntryPatch)]) -> FilestoreResult<Entry> {
        self.entities
            .update_many(owner, patches)?
            .into_iter()
            .find(|e| e.id == *id)
            .ok_or_else(|| FilestoreError::Inconsistent { id: id.to_string(), reason: "rewrite lost its target" })
    }

    pub fn get_entry(&self, ctx: &RequestContext, id: &Uuid) -> FilestoreResult<Entry> {
        self.entities.get(id, ctx.owner())
    }

    pub fn breadcrumbs(&self, ctx: &RequestContext, id: &Uuid) -> FilestoreResult<Vec<Crumb>> {
        self.validator().breadcrumbs(id, ctx.owner())
    }

    /// Non-trashed children of `parent_id`, or root-level entries for `None`.
    pub fn list_entries(&self, ctx: &RequestContext, parent_id: Option<Uuid>) -> FilestoreResult<Vec<Entry>> {
        self.list_view(ctx, View::All, Scope::Children(parent_id))
    }

    pub fn list_view(&self, ctx: &RequestContext, view: View, scope: Scope) -> FilestoreResult<Vec<Entry>> {
        let owner = ctx.owner();
        if let (View::All, Scope::Children(Some(parent))) = (view, scope) {
            self.entities.get(&parent, owner)?;
        }
        let snapshot = self.entities.snapshot(owner)?;
        Ok(views::project(&snapshot, view, scope))
    }

    pub fn counts(&self, ctx: &RequestContext) -> FilestoreResult<ViewCounts> {
        Ok(views::counts(&self.entities.snapshot(ctx.owner())?))
    }
}

#[cfg(test)]
#[path = "ops_tests.rs"]
mod ops_tests;
