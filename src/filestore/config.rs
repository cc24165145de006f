use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::hierarchy::MAX_ANCESTOR_HOPS;

/// Built-in FILESTORE settings applied unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalFilestoreConfig {
    /// Largest accepted upload in bytes
    pub max_upload_bytes: u64,
    /// MIME types accepted by `upload_file`; empty means any
    pub allowed_content_types: Vec<String>,
    /// Deepest allowed folder nesting (root-level entries have depth 1)
    pub max_depth: usize,
    /// Whether trashing/restoring a folder also flips its descendants
    pub cascade_trash: bool,
    /// How long a create dedup token is remembered
    pub dedup_ttl_secs: u64,
}

impl Default for GlobalFilestoreConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 5 * 1024 * 1024,
            allowed_content_types: [
                "image/jpeg",
                "image/png",
                "image/gif",
                "image/webp",
                "application/pdf",
                "text/plain",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_depth: 32,
            cascade_trash: false,
            dedup_ttl_secs: 86_400,
        }
    }
}

/// Deployment overrides. Unspecified values inherit from Global.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FilestoreConfig {
    #[serde(default)]
    pub max_upload_bytes: Option<u64>,
    #[serde(default)]
    pub allowed_content_types: Option<Vec<String>>,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default)]
    pub cascade_trash: Option<bool>,
    #[serde(default)]
    pub dedup_ttl_secs: Option<u64>,
}

impl FilestoreConfig {
    /// Read overrides from a JSON file.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading filestore config '{}'", path.display()))?;
        serde_json::from_slice(&bytes).with_context(|| format!("parsing filestore config '{}'", path.display()))
    }

    /// Read overrides from `ECHOFILES_*` environment variables through `lookup`.
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(target: "startup", "ignoring {}='{}': not a valid value", key, raw);
                    None
                }
            }
        }
        let allowed = lookup("ECHOFILES_ALLOWED_TYPES").map(|s| {
            s.split([',', ';']).map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect::<Vec<_>>()
        });
        Self {
            max_upload_bytes: parsed("ECHOFILES_MAX_UPLOAD_BYTES", lookup("ECHOFILES_MAX_UPLOAD_BYTES")),
            allowed_content_types: allowed,
            max_depth: parsed("ECHOFILES_MAX_DEPTH", lookup("ECHOFILES_MAX_DEPTH")),
            cascade_trash: parsed("ECHOFILES_CASCADE_TRASH", lookup("ECHOFILES_CASCADE_TRASH")),
            dedup_ttl_secs: parsed("ECHOFILES_DEDUP_TTL_SECS", lookup("ECHOFILES_DEDUP_TTL_SECS")),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Overlay `other` on top of `self`; values set in `other` win.
    pub fn overlay(self, other: FilestoreConfig) -> Self {
        Self {
            max_upload_bytes: other.max_upload_bytes.or(self.max_upload_bytes),
            allowed_content_types: other.allowed_content_types.or(self.allowed_content_types),
            max_depth: other.max_depth.or(self.max_depth),
            cascade_trash: other.cascade_trash.or(self.cascade_trash),
            dedup_ttl_secs: other.dedup_ttl_secs.or(self.dedup_ttl_secs),
        }
    }
}

/// Fully resolved effective config used during execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveConfig {
    pub max_upload_bytes: u64,
    pub allowed_content_types: Vec<String>,
    pub max_depth: usize,
    pub cascade_trash: bool,
    pub dedup_ttl_secs: u64,
}

impl EffectiveConfig {
    /// Build an effective config from Global + overrides.
    pub fn from_layers(global: &GlobalFilestoreConfig, fs: &FilestoreConfig) -> Self {
        Self {
            max_upload_bytes: fs.max_upload_bytes.unwrap_or(global.max_upload_bytes),
            allowed_content_types: fs.allowed_content_types.clone().unwrap_or_else(|| global.allowed_content_types.clone()),
            max_depth: fs.max_depth.unwrap_or(global.max_depth).clamp(1, MAX_ANCESTOR_HOPS),
            cascade_trash: fs.cascade_trash.unwrap_or(global.cascade_trash),
            dedup_ttl_secs: fs.dedup_ttl_secs.unwrap_or(global.dedup_ttl_secs),
        }
    }

    pub fn allows_content_type(&self, content_type: &str) -> bool {
        self.allowed_content_types.is_empty()
            || self.allowed_content_types.iter().any(|t| t.eq_ignore_ascii_case(content_type))
    }
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self::from_layers(&GlobalFilestoreConfig::default(), &FilestoreConfig::default())
    }
}
