use eyre::Context as _;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tracing::{debug, warn};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    /// Epoch milliseconds; `None` never expires.
    expires_at_ms: Option<i64>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|at| now_ms >= at)
    }
}

/// On-disk row: `(value, expires_at_epoch_seconds)`, where `0` means no expiry.
type DiskRow<V> = (V, i64);

/// Key/value cache with optional per-entry expiry, persisted as one JSON document.
///
/// Every `set` flushes the whole map through [`crate::fsutil::write_atomic`], so a crash mid-write
/// leaves the previous file intact. Expired entries are dropped on load and lazily on read.
#[derive(Debug)]
pub struct TtlCache<V> {
    name: String,
    path: PathBuf,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V> TtlCache<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// Open `<dir>/<file_name>`. A missing, unreadable or corrupt file yields an empty cache.
    pub fn open(dir: &Path, file_name: &str) -> Self {
        Self::open_at(dir, file_name, now_ms())
    }

    pub fn open_at(dir: &Path, file_name: &str, now_ms: i64) -> Self {
        let path = dir.join(file_name);
        let entries = match load_rows::<V>(&path) {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|(k, (value, expires_s))| {
                    let entry = Entry {
                        value,
                        expires_at_ms: (expires_s > 0).then(|| expires_s.saturating_mul(1000)),
                    };
                    (!entry.is_expired(now_ms)).then_some((k, entry))
                })
                .collect(),
            Err(e) => {
                warn!(cache = file_name, error = %e, "cache file unreadable; starting empty");
                HashMap::new()
            }
        };
        debug!(cache = file_name, entries = entries.len(), "cache loaded");
        Self {
            name: file_name.to_owned(),
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, now_ms())
    }

    /// Read `key` as of `now_ms`, evicting it if it has expired.
    pub fn get_at(&self, key: &str, now_ms: i64) -> Option<V> {
        let mut map = self.lock();
        let expired = map.get(key)?.is_expired(now_ms);
        if expired {
            map.remove(key);
            return None;
        }
        map.get(key).map(|e| e.value.clone())
    }

    /// Insert or overwrite `key`. `ttl = None` keeps the entry until it is invalidated.
    ///
    /// The in-memory value is always updated; the error reports a failed flush to disk.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) -> eyre::Result<()> {
        self.set_at(key, value, ttl, now_ms())
    }

    pub fn set_at(
        &self,
        key: &str,
        value: V,
        ttl: Option<Duration>,
        now_ms: i64,
    ) -> eyre::Result<()> {
        let expires_at_ms = ttl.map(|d| {
            let ms = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
            now_ms.saturating_add(ms)
        });
        let mut map = self.lock();
        map.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at_ms,
            },
        );
        self.flush_locked(&map)
    }

    pub fn invalidate(&self, key: &str) -> eyre::Result<()> {
        let mut map = self.lock();
        if map.remove(key).is_some() {
            self.flush_locked(&map)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn flush_locked(&self, map: &HashMap<String, Entry<V>>) -> eyre::Result<()> {
        let rows: BTreeMap<&str, DiskRow<&V>> = map
            .iter()
            .map(|(k, e)| {
                // Round down to whole seconds so a reload never extends an entry's life.
                let expires_s = e
                    .expires_at_ms
                    .map_or(0, |ms| ms.div_euclid(1000).max(1));
                (k.as_str(), (&e.value, expires_s))
            })
            .collect();
        let json = serde_json::to_vec(&rows).context("serialize cache")?;
        crate::fsutil::write_atomic(&self.path, &json)
            .with_context(|| format!("persist cache {}", self.name))
    }
}

fn load_rows<V: DeserializeOwned>(path: &Path) -> eyre::Result<HashMap<String, DiskRow<V>>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(HashMap::new());
    }
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn entry_is_served_until_ttl_and_absent_from_then_on() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let cache: TtlCache<String> = TtlCache::open_at(td.path(), "c.json", T0);

        cache.set_at("k", "v".into(), Some(Duration::from_secs(60)), T0)?;
        assert_eq!(cache.get_at("k", T0).as_deref(), Some("v"));
        assert_eq!(cache.get_at("k", T0 + 59_999).as_deref(), Some("v"));
        assert_eq!(cache.get_at("k", T0 + 60_000), None, "expired at exactly T");
        assert!(cache.is_empty(), "expired read evicts the entry");
        Ok(())
    }

    #[test]
    fn no_ttl_never_expires() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let cache: TtlCache<u64> = TtlCache::open_at(td.path(), "c.json", T0);
        cache.set_at("forever", 7, None, T0)?;
        assert_eq!(cache.get_at("forever", i64::MAX), Some(7));
        Ok(())
    }

    #[test]
    fn reload_yields_the_same_live_entries() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let now = now_ms();
        {
            let cache: TtlCache<Decimal> = TtlCache::open(td.path(), "price_cache.json");
            for i in 0..5_u32 {
                cache.set_at(
                    &format!("token-{i}"),
                    Decimal::from(i),
                    Some(Duration::from_secs(3600)),
                    now,
                )?;
            }
            cache.set_at("pinned", Decimal::ONE, None, now)?;
            cache.set_at(
                "stale",
                Decimal::TEN,
                Some(Duration::from_secs(1)),
                now - 10_000,
            )?;
        }

        let reloaded: TtlCache<Decimal> = TtlCache::open(td.path(), "price_cache.json");
        assert_eq!(reloaded.len(), 6, "expired entry is dropped on load");
        for i in 0..5_u32 {
            assert_eq!(reloaded.get(&format!("token-{i}")), Some(Decimal::from(i)));
        }
        assert_eq!(reloaded.get("pinned"), Some(Decimal::ONE));
        assert_eq!(reloaded.get("stale"), None);
        Ok(())
    }

    #[test]
    fn disk_format_is_value_and_epoch_seconds() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let cache: TtlCache<String> = TtlCache::open_at(td.path(), "c.json", T0);
        cache.set_at("a", "x".into(), Some(Duration::from_millis(1_500)), T0)?;
        cache.set_at("b", "y".into(), None, T0)?;

        let raw = fs::read_to_string(td.path().join("c.json")).context("read cache file")?;
        let v: serde_json::Value = serde_json::from_str(&raw)?;
        assert_eq!(v["a"], serde_json::json!(["x", 1_700_000_001_i64]));
        assert_eq!(v["b"], serde_json::json!(["y", 0]));
        Ok(())
    }

    #[test]
    fn corrupt_file_degrades_to_empty_cache() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        fs::write(td.path().join("c.json"), b"{ not json").context("write garbage")?;
        let cache: TtlCache<String> = TtlCache::open(td.path(), "c.json");
        assert!(cache.is_empty());

        cache.set("k", "v".into(), None)?;
        let reloaded: TtlCache<String> = TtlCache::open(td.path(), "c.json");
        assert_eq!(reloaded.get("k").as_deref(), Some("v"), "store recovers on next write");
        Ok(())
    }

    #[test]
    fn invalidate_removes_entry_from_disk() -> eyre::Result<()> {
        let td = tempfile::tempdir().context("create tempdir")?;
        let cache: TtlCache<String> = TtlCache::open(td.path(), "c.json");
        cache.set("k", "v".into(), None)?;
        cache.invalidate("k")?;
        let reloaded: TtlCache<String> = TtlCache::open(td.path(), "c.json");
        assert!(reloaded.get("k").is_none());
        Ok(())
    }
}
