use std::collections::HashMap as StdHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

/// Value variants supported by the in-memory KV store.
#[derive(Clone, Debug, PartialEq)]
pub enum KvValue {
    Str(String),
    Int(i64),
    Json(JsonValue),
    /// Raw binary value (content blobs, thumbnails)
    Bytes(Vec<u8>),
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct StoreSettings {
    pub name: String,
    /// If true, a GET will reset the TTL for keys that were inserted with a TTL.
    #[serde(default)]
    pub reset_on_access_default: bool,
}

/// Periodic snapshotting for a whole registry; one loop flushes every open store.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct PersistenceSettings {
    /// Interval in milliseconds between snapshots
    #[serde(default = "PersistenceSettings::default_interval_ms")]
    pub interval_ms: u64,
}

impl PersistenceSettings {
    fn default_interval_ms() -> u64 { 5_000 }

    pub fn interval(&self) -> Duration { Duration::from_millis(self.interval_ms.max(1)) }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self { interval_ms: Self::default_interval_ms() }
    }
}

#[derive(Clone)]
struct Slot {
    value: KvValue,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
    reset_on_access: bool,
}

impl Slot {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize)]
enum SnapVal { Str(String), Int(i64), Json(Vec<u8>), Bytes(Vec<u8>) }

#[derive(Serialize, Deserialize)]
struct SnapEntry { key: String, val: SnapVal, ttl_ms: Option<u64>, remaining_ms: Option<u64>, reset_on_access: bool }

#[derive(Serialize, Deserialize)]
struct Snapshot { version: u32, created_ms: i64, entries: Vec<SnapEntry> }

/// A single named in-memory KV store.
///
/// Every public method takes the map lock exactly once, so a single call is atomic with
/// respect to every other call on the same store. `update_json` and `remove_where` rely on
/// this to give row-level read-modify-write and all-or-nothing bulk removal.
#[derive(Clone)]
pub struct KvStore {
    pub(crate) settings: StoreSettings,
    dir: Option<PathBuf>,
    map: Arc<parking_lot::RwLock<StdHashMap<String, Slot>>>,
}

impl KvStore {
    pub(crate) fn new(dir: Option<PathBuf>, settings: StoreSettings) -> Self {
        if let Some(d) = dir.as_ref() { std::fs::create_dir_all(d).ok(); }
        Self { settings, dir, map: Arc::new(parking_lot::RwLock::new(StdHashMap::new())) }
    }

    /// A store with no backing directory; snapshots are unavailable.
    pub fn in_memory(name: &str) -> Self {
        let settings = StoreSettings { name: name.to_string(), ..StoreSettings::default() };
        Self::new(None, settings)
    }

    fn config_path(dir: &Path) -> PathBuf { dir.join("store.json") }
    fn snapshot_path(dir: &Path) -> PathBuf { dir.join("snapshot.bin") }

    /// Open a store under `dir`, reading `store.json` if present and loading any snapshot.
    pub fn load_or_default(dir: PathBuf, name: &str) -> Self {
        let mut settings = StoreSettings { name: name.to_string(), ..StoreSettings::default() };
        if let Ok(bytes) = std::fs::read(Self::config_path(&dir)) {
            match serde_json::from_slice::<StoreSettings>(&bytes) {
                Ok(s) => settings = s,
                Err(e) => warn!(target: "echofiles::store", "ignoring unreadable store.json for '{}': {}", name, e),
            }
        }
        let kv = Self::new(Some(dir), settings);
        if let Err(e) = kv.load_snapshot() {
            warn!(target: "echofiles::store", "snapshot load failed for '{}': {}", name, e);
        }
        kv
    }

    /// Write all live keys to `snapshot.bin` (via a temp file and rename).
    pub fn save_snapshot(&self) -> anyhow::Result<()> {
        let Some(dir) = self.dir.as_ref() else { anyhow::bail!("store '{}' has no directory", self.settings.name) };
        let created_ms = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0);
        let now = Instant::now();
        let entries: Vec<SnapEntry> = {
            let r = self.map.read();
            r.iter()
                .filter(|(_, slot)| !slot.expired(now))
                .map(|(k, slot)| {
                    let val = match &slot.value {
                        KvValue::Str(s) => SnapVal::Str(s.clone()),
                        KvValue::Int(i) => SnapVal::Int(*i),
                        KvValue::Json(j) => SnapVal::Json(serde_json::to_vec(j).unwrap_or_default()),
                        KvValue::Bytes(b) => SnapVal::Bytes(b.clone()),
                    };
                    SnapEntry {
                        key: k.clone(),
                        val,
                        ttl_ms: slot.ttl.map(|d| d.as_millis() as u64),
                        remaining_ms: slot.expires_at.map(|e| e.saturating_duration_since(now).as_millis() as u64),
                        reset_on_access: slot.reset_on_access,
                    }
                })
                .collect()
        };
        let count = entries.len();
        let bytes = bincode::serialize(&Snapshot { version: 1, created_ms, entries })?;
        let path = Self::snapshot_path(dir);
        let tmp = path.with_extension("bin.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(tmp, &path)?;
        debug!(target: "echofiles::store", "snapshot saved store='{}' keys={}", self.settings.name, count);
        Ok(())
    }

    /// Replace the in-memory contents with `snapshot.bin`, if it exists.
    pub fn load_snapshot(&self) -> anyhow::Result<()> {
        let Some(dir) = self.dir.as_ref() else { return Ok(()) };
        let path = Self::snapshot_path(dir);
        if !path.exists() { return Ok(()); }
        let bytes = std::fs::read(&path)?;
        let snap: Snapshot = bincode::deserialize(&bytes)?;
        let now = Instant::now();
        let mut w = self.map.write();
        w.clear();
        for e in snap.entries.into_iter() {
            let value = match e.val {
                SnapVal::Str(s) => KvValue::Str(s),
                SnapVal::Int(i) => KvValue::Int(i),
                SnapVal::Json(b) => KvValue::Json(serde_json::from_slice(&b)?),
                SnapVal::Bytes(b) => KvValue::Bytes(b),
            };
            let ttl = e.ttl_ms.map(Duration::from_millis);
            let expires_at = match (ttl, e.remaining_ms) {
                (Some(_), Some(rem)) => Some(now + Duration::from_millis(rem)),
                (Some(d), None) => Some(now + d),
                _ => None,
            };
            w.insert(e.key, Slot { value, ttl, expires_at, reset_on_access: e.reset_on_access });
        }
        debug!(target: "echofiles::store", "snapshot loaded store='{}' keys={}", self.settings.name, w.len());
        Ok(())
    }

    /// Set a key with optional TTL and per-key reset-on-access flag (defaults from store settings).
    pub fn set(&self, key: impl Into<String>, value: KvValue, ttl: Option<Duration>, reset_on_access: Option<bool>) {
        let reset = reset_on_access.unwrap_or(self.settings.reset_on_access_default);
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.map.write().insert(key.into(), Slot { value, ttl, expires_at, reset_on_access: reset });
    }

    /// Insert only when the key is absent (or expired). Returns the value already present otherwise.
    pub fn set_if_absent(&self, key: impl Into<String>, value: KvValue, ttl: Option<Duration>) -> Option<KvValue> {
        let key = key.into();
        let now = Instant::now();
        let mut w = self.map.write();
        if let Some(slot) = w.get(&key) {
            if !slot.expired(now) { return Some(slot.value.clone()); }
        }
        let reset = self.settings.reset_on_access_default;
        w.insert(key, Slot { value, ttl, expires_at: ttl.map(|d| now + d), reset_on_access: reset });
        None
    }

    pub fn set_bytes(&self, key: impl Into<String>, bytes: &[u8], ttl: Option<Duration>, reset_on_access: Option<bool>) {
        self.set(key, KvValue::Bytes(bytes.to_vec()), ttl, reset_on_access);
    }

    /// Get a key. Expired keys are removed and read as absent; reset-on-access keys get a new expiry.
    pub fn get(&self, key: &str) -> Option<KvValue> {
        let now = Instant::now();
        {
            let r = self.map.read();
            let slot = r.get(key)?;
            if !slot.expired(now) && !(slot.reset_on_access && slot.ttl.is_some()) {
                return Some(slot.value.clone());
            }
        }
        let mut w = self.map.write();
        let slot = w.get_mut(key)?;
        if slot.expired(now) {
            w.remove(key);
            return None;
        }
        if let Some(ttl) = slot.ttl { slot.expires_at = Some(now + ttl); }
        Some(slot.value.clone())
    }

    pub fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        match self.get(key) {
            Some(KvValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    /// Atomically read-modify-write one JSON value. The closure sees the current value and
    /// returns the replacement; returning `Err` leaves the stored value untouched.
    /// Returns `Ok(None)` when the key does not hold a live JSON value.
    pub fn update_json<E, F>(&self, key: &str, f: F) -> Result<Option<JsonValue>, E>
    where
        F: FnOnce(JsonValue) -> Result<JsonValue, E>,
    {
        let now = Instant::now();
        let mut w = self.map.write();
        let Some(slot) = w.get_mut(key) else { return Ok(None) };
        if slot.expired(now) { return Ok(None); }
        let KvValue::Json(cur) = &slot.value else { return Ok(None) };
        let next = f(cur.clone())?;
        slot.value = KvValue::Json(next.clone());
        Ok(Some(next))
    }

    pub fn delete(&self, key: &str) -> bool { self.map.write().remove(key).is_some() }
    pub fn len(&self) -> usize { self.map.read().len() }
    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }

    /// Snapshot of all live keys in this store.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.map.read().iter().filter(|(_, s)| !s.expired(now)).map(|(k, _)| k.clone()).collect()
    }

    /// Snapshot of all live `(key, value)` pairs whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, KvValue)> {
        let now = Instant::now();
        self.map
            .read()
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && !s.expired(now))
            .map(|(k, s)| (k.clone(), s.value.clone()))
            .collect()
    }

    /// Delete keys that start with the provided prefix. Returns number of removed keys.
    pub fn delete_prefix(&self, prefix: &str) -> usize {
        self.remove_where(prefix, |_, _| true).len()
    }

    /// Atomically remove every key under `prefix` for which `pred` holds, under a single write
    /// lock. Returns the removed `(key, value)` pairs.
    pub fn remove_where<F>(&self, prefix: &str, mut pred: F) -> Vec<(String, KvValue)>
    where
        F: FnMut(&str, &KvValue) -> bool,
    {
        let mut w = self.map.write();
        let doomed: Vec<String> = w
            .iter()
            .filter(|(k, s)| k.starts_with(prefix) && pred(k, &s.value))
            .map(|(k, _)| k.clone())
            .collect();
        doomed.into_iter().filter_map(|k| w.remove(&k).map(|s| (k, s.value))).collect()
    }

    /// Atomically choose and remove keys under `prefix`. `select` sees every live pair under
    /// the prefix and returns the keys to drop; selection and removal share one write lock.
    pub fn remove_selected<F>(&self, prefix: &str, select: F) -> Vec<(String, KvValue)>
    where
        F: FnOnce(&[(&str, &KvValue)]) -> Vec<String>,
    {
        let now = Instant::now();
        let mut w = self.map.write();
        let doomed = {
            let view: Vec<(&str, &KvValue)> = w
                .iter()
                .filter(|(k, s)| k.starts_with(prefix) && !s.expired(now))
                .map(|(k, s)| (k.as_str(), &s.value))
                .collect();
            select(&view)
        };
        doomed.into_iter().filter_map(|k| w.remove(&k).map(|s| (k, s.value))).collect()
    }

    /// Apply `f` to each listed JSON value under one write lock. Either every listed key is
    /// rewritten or, when `f` fails or a key is missing, none is.
    pub fn update_json_many<E, F>(&self, keys: &[String], mut f: F) -> Result<bool, E>
    where
        F: FnMut(&str, JsonValue) -> Result<JsonValue, E>,
    {
        let now = Instant::now();
        let mut w = self.map.write();
        let mut staged: Vec<(String, JsonValue)> = Vec::with_capacity(keys.len());
        for k in keys {
            let Some(slot) = w.get(k) else { return Ok(false) };
            if slot.expired(now) { return Ok(false); }
            let KvValue::Json(cur) = &slot.value else { return Ok(false) };
            staged.push((k.clone(), f(k, cur.clone())?));
        }
        for (k, v) in staged {
            if let Some(slot) = w.get_mut(&k) { slot.value = KvValue::Json(v); }
        }
        Ok(true)
    }

    /// Remove expired keys. Returns number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut w = self.map.write();
        let before = w.len();
        w.retain(|_, s| !s.expired(now));
        before - w.len()
    }
}

/// Registry of KV stores per database under the root path.
#[derive(Clone)]
pub struct KvStoresRegistry {
    root: Option<PathBuf>,
    persist: bool,
    /// db_name -> (store_name -> KvStore)
    inner: Arc<parking_lot::RwLock<StdHashMap<String, StdHashMap<String, KvStore>>>>,
}

impl KvStoresRegistry {
    pub(crate) fn new(root: Option<PathBuf>, persist: bool) -> Self {
        Self { root, persist, inner: Arc::new(parking_lot::RwLock::new(StdHashMap::new())) }
    }

    fn stores_dir_for_db(&self, db: &str) -> Option<PathBuf> { self.root.as_ref().map(|r| r.join(db).join("stores")) }

    pub fn get_store(&self, database: &str, store_name: &str) -> KvStore {
        if let Some(st) = self.inner.read().get(database).and_then(|m| m.get(store_name)).cloned() {
            return st;
        }
        let mut w = self.inner.write();
        let by_db = w.entry(database.to_string()).or_default();
        if let Some(st) = by_db.get(store_name) { return st.clone(); }
        let kv = match self.stores_dir_for_db(database) {
            Some(base) => KvStore::load_or_default(base.join(store_name), store_name),
            None => KvStore::in_memory(store_name),
        };
        by_db.insert(store_name.to_string(), kv.clone());
        kv
    }

    /// Snapshot every open store. Returns the number of stores written.
    pub fn save_all(&self) -> anyhow::Result<usize> {
        if self.root.is_none() { return Ok(0); }
        let stores: Vec<KvStore> = self.inner.read().values().flat_map(|m| m.values().cloned()).collect();
        for kv in stores.iter() { kv.save_snapshot()?; }
        Ok(stores.len())
    }

    /// Snapshot cadence when this registry persists to disk; `None` for in-memory or
    /// non-persisting registries.
    pub fn persistence(&self) -> Option<PersistenceSettings> {
        (self.persist && self.root.is_some()).then(PersistenceSettings::default)
    }

    /// Number of stores opened so far across all databases.
    pub fn store_count(&self) -> usize { self.inner.read().values().map(|m| m.len()).sum() }

    /// Sweep all stores, return total removed count
    pub fn sweep_all(&self) -> usize {
        self.inner.read().values().flat_map(|m| m.values()).map(|kv| kv.sweep()).sum()
    }
}

static REGISTRIES: Lazy<parking_lot::RwLock<StdHashMap<PathBuf, Arc<KvStoresRegistry>>>> =
    Lazy::new(|| parking_lot::RwLock::new(StdHashMap::new()));

pub(crate) fn kv_registry_for_root(root: &Path, persist: bool) -> Arc<KvStoresRegistry> {
    let root_key = root.to_path_buf();
    if let Some(reg) = REGISTRIES.read().get(&root_key).cloned() { return reg; }
    REGISTRIES
        .write()
        .entry(root_key.clone())
        .or_insert_with(|| Arc::new(KvStoresRegistry::new(Some(root_key), persist)))
        .clone()
}
