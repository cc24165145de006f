//! Core FILESTORE data contracts (entries persisted in KV)
//! Keep this module purely about types/serde and light helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single file or folder node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: Uuid,
    pub owner_id: String,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content_ref: Option<String>,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
    pub is_folder: bool,
    #[serde(default)]
    pub is_starred: bool,
    #[serde(default)]
    pub is_trash: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entry {
    pub fn is_image(&self) -> bool {
        !self.is_folder && self.content_type.as_deref().map(|ct| ct.starts_with("image/")).unwrap_or(false)
    }

    /// Membership in the all-files view.
    pub fn is_listed(&self) -> bool { !self.is_trash }

    /// Membership in the starred view; the star flag is ignored while trashed.
    pub fn is_visibly_starred(&self) -> bool { self.is_starred && !self.is_trash }
}

/// Content metadata for a file entry, as returned by the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub size: u64,
    pub content_type: String,
    #[serde(default)]
    pub content_ref: Option<String>,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
}

/// A validated entry ready for insertion; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub owner_id: String,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub path: String,
    pub file: Option<FileMetadata>,
}

impl NewEntry {
    pub fn is_folder(&self) -> bool { self.file.is_none() }
}

/// How a boolean flag changes in a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagChange {
    Set(bool),
    Toggle,
}

impl FlagChange {
    fn apply(self, cur: bool) -> bool {
        match self {
            FlagChange::Set(v) => v,
            FlagChange::Toggle => !cur,
        }
    }
}

/// Field changes applied to one row under its lock. Immutable fields (id, owner, kind, size,
/// content refs, created_at) are not representable here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryPatch {
    pub name: Option<String>,
    pub parent_id: Option<Option<Uuid>>,
    pub path: Option<String>,
    pub starred: Option<FlagChange>,
    pub trash: Option<FlagChange>,
}

impl EntryPatch {
    pub fn toggle_star() -> Self { Self { starred: Some(FlagChange::Toggle), ..Self::default() } }
    pub fn toggle_trash() -> Self { Self { trash: Some(FlagChange::Toggle), ..Self::default() } }
    pub fn set_trash(v: bool) -> Self { Self { trash: Some(FlagChange::Set(v)), ..Self::default() } }
    pub fn set_path(path: String) -> Self { Self { path: Some(path), ..Self::default() } }

    pub fn is_empty(&self) -> bool { *self == Self::default() }

    /// Apply to `entry` and bump `updated_at`.
    pub fn apply(&self, entry: &mut Entry, now: DateTime<Utc>) {
        if let Some(n) = &self.name { entry.name = n.clone(); }
        if let Some(p) = self.parent_id { entry.parent_id = p; }
        if let Some(p) = &self.path { entry.path = p.clone(); }
        if let Some(c) = self.starred { entry.is_starred = c.apply(entry.is_starred); }
        if let Some(c) = self.trash { entry.is_trash = c.apply(entry.is_trash); }
        entry.updated_at = now;
    }
}

/// One step of a root-to-self breadcrumb trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Crumb {
    pub id: Uuid,
    pub name: String,
}

/// The three projections of an owner's entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum View {
    #[default]
    All,
    Starred,
    Trash,
}

impl std::str::FromStr for View {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "all" | "files" => Ok(View::All),
            "starred" => Ok(View::Starred),
            "trash" => Ok(View::Trash),
            other => Err(format!("unknown view '{other}'")),
        }
    }
}

/// Per-view entry counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ViewCounts {
    pub all: usize,
    pub starred: usize,
    pub trash: usize,
}
