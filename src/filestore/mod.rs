//! Per-owner file and folder metadata hierarchy.
//!
//! `store` keeps the rows, `hierarchy` enforces tree invariants, `lifecycle` handles
//! trash/star/delete, `views` projects listings and `ops` is the validated operation surface
//! used by the HTTP layer.

pub mod config;
pub mod content;
pub mod correlation;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod kv;
pub mod lifecycle;
pub mod ops;
pub mod paths;
pub mod store;
pub mod types;
pub mod views;

pub use config::{EffectiveConfig, FilestoreConfig, GlobalFilestoreConfig};
pub use content::{ContentStorage, KvContentStorage, StoredContent};
pub use correlation::{CorrelationId, RequestContext};
pub use error::{FilestoreError, FilestoreResult};
pub use events::{ChangeFeed, ListingStale, StaleReason};
pub use hierarchy::{descendants, Placement, Validator};
pub use lifecycle::Lifecycle;
pub use ops::{Filestore, DEFAULT_DB};
pub use paths::{normalize_nfc, validate_name};
pub use store::EntityStore;
pub use types::{Crumb, Entry, EntryPatch, FileMetadata, FlagChange, NewEntry, View, ViewCounts};
pub use views::Scope;
