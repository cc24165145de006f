//! Tree invariants: name rules, parent validity, acyclicity, depth, and path derivation.

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use super::error::{FilestoreError, FilestoreResult};
use super::paths::{join_path, path_from_names, validate_name};
use super::store::EntityStore;
use super::types::{Crumb, Entry};

/// Where a created, renamed or moved entry lands once validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub path: String,
    /// Root-level entries have depth 1.
    pub depth: usize,
}

/// Hard ceiling on ancestor hops, independent of the configured `max_depth` so that data
/// created under a larger limit still resolves after the limit is lowered.
pub const MAX_ANCESTOR_HOPS: usize = 4096;

pub struct Validator<'a> {
    store: &'a EntityStore,
    max_depth: usize,
}

impl<'a> Validator<'a> {
    pub fn new(store: &'a EntityStore, max_depth: usize) -> Self {
        Self { store, max_depth }
    }

    /// Ancestor chain of `entry` ordered root-to-self. The walk gives up after
    /// `MAX_ANCESTOR_HOPS` hops or on a revisit and reports the hierarchy as inconsistent.
    /// Depth policy is left to `place`.
    pub fn chain(&self, entry: &Entry, owner: &str) -> FilestoreResult<Vec<Entry>> {
        let mut chain = vec![entry.clone()];
        let mut seen = HashSet::from([entry.id]);
        let mut cur = entry.parent_id;
        while let Some(pid) = cur {
            if chain.len() > MAX_ANCESTOR_HOPS {
                return Err(FilestoreError::Inconsistent { id: entry.id.to_string(), reason: "ancestor walk did not reach the root" });
            }
            if !seen.insert(pid) {
                return Err(FilestoreError::Inconsistent { id: entry.id.to_string(), reason: "parent links form a loop" });
            }
            let parent = match self.store.get(&pid, owner) {
                Ok(p) => p,
                Err(FilestoreError::NotFound { .. }) | Err(FilestoreError::OwnershipMismatch { .. }) => {
                    return Err(FilestoreError::Inconsistent { id: entry.id.to_string(), reason: "ancestor is missing" });
                }
                Err(e) => return Err(e),
            };
            cur = parent.parent_id;
            chain.push(parent);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Resolve a prospective parent: it must exist for `owner` and be a folder.
    fn resolve_parent(&self, parent_id: &Uuid, owner: &str) -> FilestoreResult<Vec<Entry>> {
        let invalid = |reason: &'static str| FilestoreError::InvalidParent { parent_id: parent_id.to_string(), reason };
        let parent = match self.store.get(parent_id, owner) {
            Ok(p) => p,
            Err(FilestoreError::NotFound { .. }) => return Err(invalid("parent does not exist")),
            Err(FilestoreError::OwnershipMismatch { .. }) => return Err(invalid("parent belongs to another owner")),
            Err(e) => return Err(e),
        };
        if !parent.is_folder {
            return Err(invalid("parent is not a folder"));
        }
        self.chain(&parent, owner)
    }

    fn place(&self, name: String, parent_chain: &[Entry], subtree_height: usize) -> FilestoreResult<Placement> {
        let depth = parent_chain.len() + 1;
        if depth + subtree_height > self.max_depth {
            return Err(FilestoreError::DepthExceeded { depth: depth + subtree_height, max: self.max_depth });
        }
        Ok(Self::placement(name, parent_chain))
    }

    fn placement(name: String, parent_chain: &[Entry]) -> Placement {
        let depth = parent_chain.len() + 1;
        let parent_path = path_from_names(parent_chain.iter().map(|e| e.name.as_str()));
        Placement {
            path: join_path(&parent_path, &name),
            parent_id: parent_chain.last().map(|p| p.id),
            name,
            depth,
        }
    }

    /// Checks for a new entry, in order: name, parent, depth.
    pub fn validate_new(&self, owner: &str, parent_id: Option<&Uuid>, raw_name: &str) -> FilestoreResult<Placement> {
        let name = validate_name(raw_name)?;
        let parent_chain = match parent_id {
            Some(p) => self.resolve_parent(p, owner)?,
            None => Vec::new(),
        };
        self.place(name, &parent_chain, 0)
    }

    /// Checks for renaming `entry` in place. Depth is unchanged, so only the name is checked.
    pub fn validate_rename(&self, entry: &Entry, raw_name: &str) -> FilestoreResult<Placement> {
        let name = validate_name(raw_name)?;
        let mut chain = self.chain(entry, &entry.owner_id)?;
        chain.pop();
        Ok(Self::placement(name, &chain))
    }

    /// Checks for re-parenting `entry` under `new_parent`, in order: parent, cycle, depth.
    /// A folder moved under itself shows up in its own resolved chain; a file never
    /// resolves as a parent. `subtree_height` is how many levels hang below `entry`.
    pub fn validate_move(&self, entry: &Entry, new_parent: Option<&Uuid>, subtree_height: usize) -> FilestoreResult<Placement> {
        let cycle = || FilestoreError::CycleDetected {
            id: entry.id.to_string(),
            parent_id: new_parent.map(Uuid::to_string).unwrap_or_default(),
        };
        let parent_chain = match new_parent {
            Some(p) => self.resolve_parent(p, &entry.owner_id)?,
            None => Vec::new(),
        };
        if parent_chain.iter().any(|a| a.id == entry.id) {
            return Err(cycle());
        }
        self.place(entry.name.clone(), &parent_chain, subtree_height)
    }

    /// Path of `entry` derived from its ancestors.
    pub fn compute_path(&self, entry: &Entry, owner: &str) -> FilestoreResult<String> {
        let chain = self.chain(entry, owner)?;
        Ok(path_from_names(chain.iter().map(|e| e.name.as_str())))
    }

    /// Root-to-self navigation trail for `id`.
    pub fn breadcrumbs(&self, id: &Uuid, owner: &str) -> FilestoreResult<Vec<Crumb>> {
        let entry = self.store.get(id, owner)?;
        Ok(self
            .chain(&entry, owner)?
            .into_iter()
            .map(|e| Crumb { id: e.id, name: e.name })
            .collect())
    }
}

fn children_index(entries: &[Entry]) -> HashMap<Uuid, Vec<&Entry>> {
    let mut by_parent: HashMap<Uuid, Vec<&Entry>> = HashMap::new();
    for e in entries {
        if let Some(p) = e.parent_id {
            by_parent.entry(p).or_default().push(e);
        }
    }
    by_parent
}

/// Every descendant of `root` in breadth-first order, `root` itself excluded.
pub fn descendants<'e>(entries: &'e [Entry], root: &Uuid) -> Vec<&'e Entry> {
    let by_parent = children_index(entries);
    let mut out = Vec::new();
    let mut seen = HashSet::from([*root]);
    let mut queue = VecDeque::from([*root]);
    while let Some(cur) = queue.pop_front() {
        for child in by_parent.get(&cur).into_iter().flatten() {
            if seen.insert(child.id) {
                out.push(*child);
                queue.push_back(child.id);
            }
        }
    }
    out
}

/// Number of levels below `root` (0 for a leaf).
pub fn subtree_height(entries: &[Entry], root: &Uuid) -> usize {
    let by_parent = children_index(entries);
    let mut height = 0;
    let mut seen = HashSet::from([*root]);
    let mut level = vec![*root];
    while !level.is_empty() {
        let next: Vec<Uuid> = level
            .iter()
            .flat_map(|id| by_parent.get(id).into_iter().flatten())
            .filter(|c| seen.insert(c.id))
            .map(|c| c.id)
            .collect();
        if next.is_empty() {
            break;
        }
        height += 1;
        level = next;
    }
    height
}

/// New paths for every descendant of `root` once `root` sits at `root_path`.
pub fn rebased_paths(entries: &[Entry], root: &Uuid, root_path: &str) -> Vec<(Uuid, String)> {
    let mut paths: HashMap<Uuid, String> = HashMap::from([(*root, root_path.to_string())]);
    let mut out = Vec::new();
    for d in descendants(entries, root) {
        let Some(parent_path) = d.parent_id.and_then(|p| paths.get(&p).cloned()) else { continue };
        let path = join_path(&parent_path, &d.name);
        paths.insert(d.id, path.clone());
        out.push((d.id, path));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::types::{EntryPatch, NewEntry};
    use crate::storage::SharedStore;

    fn es() -> EntityStore { EntityStore::new(SharedStore::in_memory(), "echofiles") }

    fn mk(s: &EntityStore, v: &Validator<'_>, parent: Option<Uuid>, name: &str) -> Entry {
        let p = v.validate_new("u", parent.as_ref(), name).unwrap();
        s.insert(NewEntry { owner_id: "u".into(), parent_id: p.parent_id, name: p.name, path: p.path, file: None }).unwrap()
    }

    #[test]
    fn nested_paths_and_breadcrumbs() {
        let s = es();
        let v = Validator::new(&s, 8);
        let docs = mk(&s, &v, None, "Docs");
        let specs = mk(&s, &v, Some(docs.id), " specs ");
        assert_eq!(docs.path, "/Docs");
        assert_eq!(specs.path, "/Docs/specs");
        let crumbs = v.breadcrumbs(&specs.id, "u").unwrap();
        assert_eq!(crumbs.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), vec!["Docs", "specs"]);
        assert_eq!(v.compute_path(&specs, "u").unwrap(), "/Docs/specs");
    }

    #[test]
    fn parent_must_be_an_owned_folder() {
        let s = es();
        let v = Validator::new(&s, 8);
        let file = s
            .insert(NewEntry {
                owner_id: "u".into(),
                parent_id: None,
                name: "a.txt".into(),
                path: "/a.txt".into(),
                file: Some(Default::default()),
            })
            .unwrap();
        assert!(matches!(v.validate_new("u", Some(&file.id), "x"), Err(FilestoreError::InvalidParent { .. })));
        assert!(matches!(v.validate_new("u", Some(&Uuid::new_v4()), "x"), Err(FilestoreError::InvalidParent { .. })));
        let theirs = mk(&s, &v, None, "Shared");
        let other = Validator::new(&s, 8);
        assert!(matches!(other.validate_new("intruder", Some(&theirs.id), "x"), Err(FilestoreError::InvalidParent { .. })));
        assert!(matches!(v.validate_new("u", None, "a/b"), Err(FilestoreError::InvalidName { .. })));
    }

    #[test]
    fn moves_under_self_or_descendant_are_cycles() {
        let s = es();
        let v = Validator::new(&s, 8);
        let a = mk(&s, &v, None, "a");
        let b = mk(&s, &v, Some(a.id), "b");
        let c = mk(&s, &v, Some(b.id), "c");
        assert!(matches!(v.validate_move(&a, Some(&a.id), 2), Err(FilestoreError::CycleDetected { .. })));
        assert!(matches!(v.validate_move(&a, Some(&c.id), 2), Err(FilestoreError::CycleDetected { .. })));
        let ok = v.validate_move(&c, None, 0).unwrap();
        assert_eq!(ok.path, "/c");
        assert_eq!(ok.depth, 1);
    }

    #[test]
    fn file_moved_under_itself_is_an_invalid_parent() {
        let s = es();
        let v = Validator::new(&s, 8);
        let file = s
            .insert(NewEntry {
                owner_id: "u".into(),
                parent_id: None,
                name: "a.txt".into(),
                path: "/a.txt".into(),
                file: Some(Default::default()),
            })
            .unwrap();
        assert!(matches!(v.validate_move(&file, Some(&file.id), 0), Err(FilestoreError::InvalidParent { .. })));
    }

    #[test]
    fn lowering_max_depth_keeps_deep_data_readable() {
        let s = es();
        let wide = Validator::new(&s, 32);
        let mut parent = None;
        let mut chain = Vec::new();
        for i in 0..6 {
            let f = mk(&s, &wide, parent, &format!("d{i}"));
            parent = Some(f.id);
            chain.push(f);
        }
        let deepest = chain.last().unwrap().clone();
        let narrow = Validator::new(&s, 3);
        assert_eq!(narrow.breadcrumbs(&deepest.id, "u").unwrap().len(), 6);
        assert_eq!(narrow.compute_path(&deepest, "u").unwrap(), "/d0/d1/d2/d3/d4/d5");
        assert!(matches!(
            narrow.validate_new("u", Some(&deepest.id), "more"),
            Err(FilestoreError::DepthExceeded { depth: 7, max: 3 })
        ));
        assert_eq!(narrow.validate_rename(&deepest, "renamed").unwrap().path, "/d0/d1/d2/d3/d4/renamed");
        assert!(narrow.validate_new("u", Some(&chain[1].id), "ok").is_ok());
    }

    #[test]
    fn depth_limit_counts_the_moved_subtree() {
        let s = es();
        let v = Validator::new(&s, 3);
        let a = mk(&s, &v, None, "a");
        let b = mk(&s, &v, Some(a.id), "b");
        let c = mk(&s, &v, Some(b.id), "c");
        assert!(matches!(v.validate_new("u", Some(&c.id), "d"), Err(FilestoreError::DepthExceeded { depth: 4, max: 3 })));
        let x = mk(&s, &v, None, "x");
        let _y = mk(&s, &v, Some(x.id), "y");
        let snapshot = s.snapshot("u").unwrap();
        let h = subtree_height(&snapshot, &x.id);
        assert_eq!(h, 1);
        assert!(matches!(v.validate_move(&x, Some(&b.id), h), Err(FilestoreError::DepthExceeded { .. })));
        assert!(v.validate_move(&x, Some(&a.id), h).is_ok());
    }

    #[test]
    fn parent_loops_surface_as_inconsistent() {
        let s = es();
        let v = Validator::new(&s, 8);
        let a = mk(&s, &v, None, "a");
        let b = mk(&s, &v, Some(a.id), "b");
        let mut looped = s.get(&a.id, "u").unwrap();
        looped.parent_id = Some(b.id);
        s.put_raw(&looped);
        assert!(matches!(v.compute_path(&b, "u"), Err(FilestoreError::Inconsistent { .. })));
        assert!(matches!(v.breadcrumbs(&b.id, "u"), Err(FilestoreError::Inconsistent { .. })));
    }

    #[test]
    fn rebased_paths_follow_the_new_root() {
        let s = es();
        let v = Validator::new(&s, 8);
        let a = mk(&s, &v, None, "a");
        let b = mk(&s, &v, Some(a.id), "b");
        let c = mk(&s, &v, Some(b.id), "c.txt");
        s.update(&c.id, "u", &EntryPatch::set_trash(true)).unwrap();
        let snap = s.snapshot("u").unwrap();
        let mut got = rebased_paths(&snap, &a.id, "/z");
        got.sort_by(|x, y| x.1.cmp(&y.1));
        assert_eq!(got, vec![(b.id, "/z/b".to_string()), (c.id, "/z/b/c.txt".to_string())]);
        assert_eq!(descendants(&snap, &a.id).len(), 2);
        assert!(descendants(&snap, &c.id).is_empty());
    }
}
