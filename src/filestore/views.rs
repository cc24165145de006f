//! Read-side projections over one owner's snapshot. Nothing here touches the store.

use uuid::Uuid;

use super::store::sort_entries;
use super::types::{Entry, View, ViewCounts};

/// Which part of the tree the all-files view covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Direct children of a folder, or root-level entries for `None`.
    Children(Option<Uuid>),
    /// Every entry regardless of depth.
    Flat,
}

pub fn all_files(entries: &[Entry], scope: Scope) -> Vec<Entry> {
    select(entries, |e| {
        e.is_listed()
            && match scope {
                Scope::Children(parent) => e.parent_id == parent,
                Scope::Flat => true,
            }
    })
}

pub fn starred(entries: &[Entry]) -> Vec<Entry> {
    select(entries, Entry::is_visibly_starred)
}

pub fn trash(entries: &[Entry]) -> Vec<Entry> {
    select(entries, |e| e.is_trash)
}

/// Project `view`. Starred and trash are always flat; `scope` only narrows the all-files view.
pub fn project(entries: &[Entry], view: View, scope: Scope) -> Vec<Entry> {
    match view {
        View::All => all_files(entries, scope),
        View::Starred => starred(entries),
        View::Trash => trash(entries),
    }
}

pub fn counts(entries: &[Entry]) -> ViewCounts {
    entries.iter().fold(ViewCounts::default(), |mut c, e| {
        if e.is_trash {
            c.trash += 1;
        } else {
            c.all += 1;
        }
        if e.is_visibly_starred() {
            c.starred += 1;
        }
        c
    })
}

fn select<P>(entries: &[Entry], pred: P) -> Vec<Entry>
where
    P: Fn(&Entry) -> bool,
{
    let mut out: Vec<Entry> = entries.iter().filter(|e| pred(*e)).cloned().collect();
    sort_entries(&mut out);
    out
}
