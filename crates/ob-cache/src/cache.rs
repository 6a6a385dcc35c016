use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ob_types::CacheError;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::key::{fingerprint, CacheKey};

/// Environment variable overriding the default cache directory.
pub const CACHE_DIR_ENV: &str = "OPTIBENCH_CACHE_DIR";

/// How a lookup interacts with stored entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Return the stored value if present, else compute and store it.
    #[default]
    Normal,
    /// Always compute, overwriting any stored value.
    Force,
    /// Only read stored values, never compute.
    Collect,
}

/// Result of [`RunCache::get_or_compute`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOutcome<V> {
    Hit(V),
    Computed(V),
    /// Collect mode and nothing stored under the key.
    Unavailable,
}

impl<V> CacheOutcome<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Hit(v) | Self::Computed(v) => Some(v),
            Self::Unavailable => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// On-disk layout of one entry. The key material is stored next to the
/// value so a reader can check the entry still matches its address.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    fingerprint: String,
    namespace: String,
    material: Value,
    created_at: DateTime<Utc>,
    value: Value,
}

/// In-memory copy of an entry already read from or written to disk
#[derive(Debug, Clone)]
struct MemoEntry {
    value: Value,
    last_accessed: DateTime<Utc>,
    access_count: u64,
}

impl MemoEntry {
    fn new(value: Value) -> Self {
        Self {
            value,
            last_accessed: Utc::now(),
            access_count: 0,
        }
    }

    fn access(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }
}

/// Disk-backed, content-addressed memoization of trial results.
///
/// Entries are write-once per key and written through a temporary file and
/// an atomic rename, so concurrent readers never observe partial entries and
/// writers to different keys never collide. Writers to the same key inside
/// one process are serialized by a per-key lock.
#[derive(Debug)]
pub struct RunCache {
    root: PathBuf,
    memo: DashMap<String, RwLock<MemoEntry>>,
    key_locks: DashMap<String, Arc<Mutex<()>>>,
    max_memo_entries: usize,
    stats: RwLock<CacheStats>,
}

impl RunCache {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, CacheError> {
        Self::with_limits(root, 10_000)
    }

    pub fn with_limits<P: AsRef<Path>>(
        root: P,
        max_memo_entries: usize,
    ) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| io_error(&root, source))?;

        Ok(Self {
            root,
            memo: DashMap::new(),
            key_locks: DashMap::new(),
            max_memo_entries: max_memo_entries.max(1),
            stats: RwLock::new(CacheStats::default()),
        })
    }

    /// Open the cache in [`RunCache::default_dir`].
    pub fn open_default() -> Result<Self, CacheError> {
        Self::open(Self::default_dir())
    }

    /// `$OPTIBENCH_CACHE_DIR`, else the platform cache directory.
    pub fn default_dir() -> PathBuf {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            return PathBuf::from(dir);
        }
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("optibench")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look `key` up according to `mode`, running `compute` on a miss (or
    /// always, in force mode). Failed computations are not stored.
    pub fn get_or_compute<V, E, F>(
        &self,
        key: &CacheKey,
        mode: CacheMode,
        compute: F,
    ) -> Result<CacheOutcome<V>, E>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<V, E>,
    {
        let lock = self.key_lock(key);
        let outcome = {
            let _guard = lock.lock();
            self.locked_get_or_compute(key, mode, compute)
        };
        drop(lock);
        self.key_locks
            .remove_if(key.fingerprint(), |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    fn locked_get_or_compute<V, E, F>(
        &self,
        key: &CacheKey,
        mode: CacheMode,
        compute: F,
    ) -> Result<CacheOutcome<V>, E>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<V, E>,
    {
        if mode != CacheMode::Force {
            if let Some(value) = self.lookup(key) {
                return Ok(CacheOutcome::Hit(value));
            }
            if mode == CacheMode::Collect {
                return Ok(CacheOutcome::Unavailable);
            }
        }

        let value = compute()?;
        self.stats.write().computations += 1;

        if let Err(e) = self.store(key, &value) {
            warn!(key = %key, error = %e, "failed to persist cache entry");
        }
        Ok(CacheOutcome::Computed(value))
    }

    /// Read a stored value. Entries that no longer match their address or
    /// fail to decode are discarded and reported as misses.
    pub fn lookup<V: DeserializeOwned>(&self, key: &CacheKey) -> Option<V> {
        let fp = key.fingerprint();

        let memo_value = self.memo.get(fp).map(|entry| {
            let mut guard = entry.write();
            guard.access();
            guard.value.clone()
        });
        if let Some(raw) = memo_value {
            if let Ok(value) = serde_json::from_value(raw) {
                self.stats.write().hits += 1;
                return Some(value);
            }
            self.memo.remove(fp);
        }

        match self.read_entry(key) {
            Ok(Some(raw)) => match serde_json::from_value::<V>(raw.clone()) {
                Ok(value) => {
                    self.remember(fp, raw);
                    self.stats.write().hits += 1;
                    Some(value)
                }
                Err(e) => {
                    self.discard(key, &format!("value does not decode: {e}"));
                    None
                }
            },
            Ok(None) => {
                self.stats.write().misses += 1;
                None
            }
            Err(reason) => {
                self.discard(key, &reason);
                None
            }
        }
    }

    /// Write `value` under `key`, replacing any previous entry.
    pub fn store<V: Serialize>(&self, key: &CacheKey, value: &V) -> Result<(), CacheError> {
        let value = serde_json::to_value(value)?;
        let entry = StoredEntry {
            fingerprint: key.fingerprint().to_string(),
            namespace: key.namespace().to_string(),
            material: key.material().clone(),
            created_at: Utc::now(),
            value,
        };
        let bytes = serde_json::to_vec(&entry)?;
        atomic_write(&self.entry_path(key.fingerprint()), &bytes)?;

        self.remember(key.fingerprint(), entry.value);
        self.stats.write().stores += 1;
        debug!(key = %key, "stored cache entry");
        Ok(())
    }

    /// Drop the entry stored under `key`, if any.
    pub fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.memo.remove(key.fingerprint());
        let path = self.entry_path(key.fingerprint());
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    /// Remove every entry, on disk and in memory.
    pub fn clear(&self) -> Result<(), CacheError> {
        self.memo.clear();
        let entries = fs::read_dir(&self.root).map_err(|e| io_error(&self.root, e))?;
        for entry in entries {
            let path = entry.map_err(|e| io_error(&self.root, e))?.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| io_error(&path, e))?;
        }

        *self.stats.write() = CacheStats::default();
        Ok(())
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Entries are sharded by the first two hex digits of their fingerprint.
    fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.root
            .join(&fingerprint[..2])
            .join(format!("{fingerprint}.json"))
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.fingerprint().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_entry(&self, key: &CacheKey) -> Result<Option<Value>, String> {
        let path = self.entry_path(key.fingerprint());
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("unreadable: {e}")),
        };

        let stored: StoredEntry =
            serde_json::from_slice(&bytes).map_err(|e| format!("unparsable: {e}"))?;

        let recomputed = fingerprint(&stored.namespace, &stored.material)
            .map_err(|e| format!("material does not encode: {e}"))?;
        if stored.fingerprint != key.fingerprint() || recomputed != key.fingerprint() {
            return Err("fingerprint does not match its inputs".to_string());
        }

        Ok(Some(stored.value))
    }

    fn discard(&self, key: &CacheKey, reason: &str) {
        warn!(key = %key, reason, "discarding corrupted cache entry");
        {
            let mut stats = self.stats.write();
            stats.invalidations += 1;
            stats.misses += 1;
        }
        if let Err(e) = self.invalidate(key) {
            warn!(key = %key, error = %e, "failed to remove corrupted cache entry");
        }
    }

    fn remember(&self, fingerprint: &str, value: Value) {
        if self.memo.len() >= self.max_memo_entries && !self.memo.contains_key(fingerprint) {
            self.evict_lru();
        }
        self.memo
            .insert(fingerprint.to_string(), RwLock::new(MemoEntry::new(value)));
    }

    /// Evict least recently used in-memory copies. Disk entries are kept.
    fn evict_lru(&self) {
        let entries_to_remove = (self.memo.len() / 10).max(1);
        let mut candidates: Vec<(String, DateTime<Utc>)> = self
            .memo
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().read().last_accessed))
            .collect();

        candidates.sort_by(|a, b| a.1.cmp(&b.1));

        let mut evicted = 0;
        for (key, _) in candidates.into_iter().take(entries_to_remove) {
            if self.memo.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.stats.write().evictions += evicted;
    }
}

fn io_error(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Write through a uniquely named sibling file and rename it into place.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("entry");
    let tmp = path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4()));

    let written = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(io_error(&tmp, e));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_error(path, e)
    })
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub computations: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }

    pub fn miss_rate(&self) -> f64 {
        1.0 - self.hit_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use std::convert::Infallible;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        value: f64,
        time: f64,
    }

    fn key(solver: &str, stop_val: u64) -> CacheKey {
        CacheKey::new("point", &json!({"solver": solver, "stop_val": stop_val, "rep": 0})).unwrap()
    }

    fn point(value: f64) -> Point {
        Point {
            value,
            time: 0.1 + value / 3.0,
        }
    }

    #[test]
    fn test_normal_mode_computes_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RunCache::open(dir.path()).unwrap();
        let calls = Cell::new(0);
        let compute = || {
            calls.set(calls.get() + 1);
            Ok::<_, Infallible>(point(0.7))
        };

        let first = cache.get_or_compute(&key("gd", 3), CacheMode::Normal, compute).unwrap();
        let second = cache
            .get_or_compute(&key("gd", 3), CacheMode::Normal, || {
                calls.set(calls.get() + 1);
                Ok::<_, Infallible>(point(9.0))
            })
            .unwrap();

        assert_eq!(calls.get(), 1);
        assert!(matches!(first, CacheOutcome::Computed(_)));
        assert!(second.is_hit());
        assert_eq!(first.into_value(), second.into_value());

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
    }

    #[test]
    fn test_force_mode_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RunCache::open(dir.path()).unwrap();
        let k = key("gd", 5);

        cache
            .get_or_compute(&k, CacheMode::Normal, || Ok::<_, Infallible>(point(1.0)))
            .unwrap();

        let calls = Cell::new(0);
        let forced = cache
            .get_or_compute(&k, CacheMode::Force, || {
                calls.set(calls.get() + 1);
                Ok::<_, Infallible>(point(2.0))
            })
            .unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(forced, CacheOutcome::Computed(point(2.0)));

        let after = cache
            .get_or_compute(&k, CacheMode::Normal, || Ok::<_, Infallible>(point(3.0)))
            .unwrap();
        assert_eq!(after, CacheOutcome::Hit(point(2.0)));
    }

    #[test]
    fn test_collect_never_computes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RunCache::open(dir.path()).unwrap();
        let calls = Cell::new(0);

        let outcome: CacheOutcome<Point> = cache
            .get_or_compute(&key("cd", 1), CacheMode::Collect, || {
                calls.set(calls.get() + 1);
                Ok::<_, Infallible>(point(1.0))
            })
            .unwrap();

        assert_eq!(outcome, CacheOutcome::Unavailable);
        assert_eq!(calls.get(), 0);
        assert!(!cache.entry_path(key("cd", 1).fingerprint()).exists());
    }

    #[test]
    fn test_failed_computation_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RunCache::open(dir.path()).unwrap();
        let k = key("newton", 2);

        let err = cache
            .get_or_compute::<Point, _, _>(&k, CacheMode::Normal, || Err("singular hessian"))
            .unwrap_err();
        assert_eq!(err, "singular hessian");
        assert!(cache.lookup::<Point>(&k).is_none());
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = RunCache::open(dir.path()).unwrap();
            cache.store(&key("gd", 8), &point(0.25)).unwrap();
        }

        let reopened = RunCache::open(dir.path()).unwrap();
        assert_eq!(reopened.lookup::<Point>(&key("gd", 8)), Some(point(0.25)));
    }

    #[test]
    fn test_corrupted_entry_is_recomputed() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("gd", 13);
        {
            let cache = RunCache::open(dir.path()).unwrap();
            cache.store(&k, &point(4.0)).unwrap();
        }
        let cache = RunCache::open(dir.path()).unwrap();
        fs::write(cache.entry_path(k.fingerprint()), b"{not json").unwrap();

        let outcome = cache
            .get_or_compute(&k, CacheMode::Normal, || Ok::<_, Infallible>(point(5.0)))
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Computed(point(5.0)));
        assert_eq!(cache.get_stats().invalidations, 1);
    }

    #[test]
    fn test_mismatched_material_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let k = key("gd", 21);
        {
            let cache = RunCache::open(dir.path()).unwrap();
            cache.store(&k, &point(4.0)).unwrap();
        }
        let cache = RunCache::open(dir.path()).unwrap();
        let path = cache.entry_path(k.fingerprint());
        let mut stored: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        stored["material"]["stop_val"] = json!(34);
        fs::write(&path, serde_json::to_vec(&stored).unwrap()).unwrap();

        assert!(cache.lookup::<Point>(&k).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_disjoint_keys_written_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RunCache::open(dir.path()).unwrap();

        std::thread::scope(|scope| {
            for i in 0..8u64 {
                let cache = &cache;
                scope.spawn(move || {
                    cache
                        .get_or_compute(&key("pool", i), CacheMode::Normal, || {
                            Ok::<_, Infallible>(point(i as f64))
                        })
                        .unwrap();
                });
            }
        });

        for i in 0..8u64 {
            assert_eq!(cache.lookup::<Point>(&key("pool", i)), Some(point(i as f64)));
        }
    }

    #[test]
    fn test_memo_eviction_keeps_disk_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RunCache::with_limits(dir.path(), 2).unwrap();
        for i in 0..4u64 {
            cache.store(&key("evict", i), &point(i as f64)).unwrap();
        }

        assert!(cache.get_stats().evictions >= 2);
        assert_eq!(cache.lookup::<Point>(&key("evict", 0)), Some(point(0.0)));
    }

    #[test]
    fn test_clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RunCache::open(dir.path()).unwrap();
        cache.store(&key("gd", 1), &point(1.0)).unwrap();

        cache.clear().unwrap();
        assert!(cache.lookup::<Point>(&key("gd", 1)).is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
