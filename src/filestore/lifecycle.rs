//! Trash, star, permanent delete and empty-trash over the entity store.
//!
//! Trashing flips only the target unless `cascade_trash` is set. Permanent removal always
//! takes the whole subtree with it so no surviving entry points at a missing parent.

use std::collections::HashSet;

use tracing::debug;
use uuid::Uuid;

use super::error::{FilestoreError, FilestoreResult};
use super::hierarchy::descendants;
use super::store::EntityStore;
use super::types::{Entry, EntryPatch};

pub struct Lifecycle<'a> {
    store: &'a EntityStore,
    cascade_trash: bool,
}

enum DeleteOutcome {
    Removed,
    Missing,
    NotTrashed,
}

impl<'a> Lifecycle<'a> {
    pub fn new(store: &'a EntityStore, cascade_trash: bool) -> Self {
        Self { store, cascade_trash }
    }

    pub fn toggle_star(&self, id: &Uuid, owner: &str) -> FilestoreResult<Entry> {
        self.store.update(id, owner, &EntryPatch::toggle_star())
    }

    /// Flip `is_trash` on `id`; with cascade on, descendants take the target's new value.
    pub fn toggle_trash(&self, id: &Uuid, owner: &str) -> FilestoreResult<Entry> {
        if !self.cascade_trash {
            return self.store.update(id, owner, &EntryPatch::toggle_trash());
        }
        let lock = self.store.structural_lock(owner);
        let _guard = lock.lock();
        let target = self.store.get(id, owner)?;
        let next = !target.is_trash;
        let snapshot = self.store.snapshot(owner)?;
        let mut patches = vec![(target.id, EntryPatch::set_trash(next))];
        if target.is_folder {
            patches.extend(descendants(&snapshot, &target.id).into_iter().map(|d| (d.id, EntryPatch::set_trash(next))));
        }
        debug!(target: "echofiles::ops", "cascade trash={} over {} rows from {}", next, patches.len(), id);
        let updated = self.store.update_many(owner, &patches)?;
        updated
            .into_iter()
            .find(|e| e.id == *id)
            .ok_or_else(|| FilestoreError::Inconsistent { id: id.to_string(), reason: "cascade lost its target" })
    }

    /// Remove a trashed entry and everything beneath it. Returns the removed rows.
    pub fn delete_permanently(&self, id: &Uuid, owner: &str) -> FilestoreResult<Vec<Entry>> {
        let lock = self.store.structural_lock(owner);
        let _guard = lock.lock();
        let mut outcome = DeleteOutcome::Missing;
        let removed = self.store.remove_selected(owner, |entries| {
            let Some(target) = entries.iter().find(|e| e.id == *id) else { return Vec::new() };
            if !target.is_trash {
                outcome = DeleteOutcome::NotTrashed;
                return Vec::new();
            }
            outcome = DeleteOutcome::Removed;
            std::iter::once(target.id).chain(descendants(entries, &target.id).into_iter().map(|d| d.id)).collect()
        })?;
        match outcome {
            DeleteOutcome::Removed => Ok(removed),
            DeleteOutcome::NotTrashed => Err(FilestoreError::NotTrashed { id: id.to_string() }),
            // no row for this owner: let the store tell a plain miss from someone else's id
            DeleteOutcome::Missing => match self.store.get(id, owner) {
                Err(e) => Err(e),
                Ok(_) => Err(FilestoreError::Inconsistent { id: id.to_string(), reason: "entry appeared during delete" }),
            },
        }
    }

    /// Remove every trashed entry of `owner`, plus the subtrees of trashed folders, in one
    /// atomic step. Other owners live in other stores and are never visited.
    pub fn empty_trash(&self, owner: &str) -> FilestoreResult<Vec<Entry>> {
        let lock = self.store.structural_lock(owner);
        let _guard = lock.lock();
        self.store.remove_selected(owner, |entries| {
            let mut doomed: HashSet<Uuid> = HashSet::new();
            for e in entries.iter().filter(|e| e.is_trash) {
                doomed.insert(e.id);
                if e.is_folder {
                    doomed.extend(descendants(entries, &e.id).into_iter().map(|d| d.id));
                }
            }
            doomed.into_iter().collect()
        })
    }
}
