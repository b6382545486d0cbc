use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Bucket holding per-probe measurements, keyed by
/// [`probe_key`](crate::target_quality::probe_key)
pub const PROBES: &str = "probes";
/// Bucket holding per-chunk target quality decisions, keyed by chunk name and
/// search settings
pub const DECISIONS: &str = "target_quality";

/// Key/value store of previously computed results.
///
/// Reads and writes may come from any number of threads. With a backing file
/// every `set` is written through, so a later run can pick up where this one
/// stopped. Keys are derived from deterministic inputs, so concurrent writers
/// of the same key store the same value and the last one wins.
#[derive(Debug, Default)]
pub struct ProbeCache {
    entries: DashMap<String, DashMap<String, Value>>,
    path:    Option<PathBuf>,
    flush:   Mutex<()>,
}

impl ProbeCache {
    #[inline]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the cache persisted at `path`. A missing file starts an empty
    /// cache; an unreadable or corrupt one is treated as a full cache miss.
    #[inline]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match load(&path) {
            Ok(Some(entries)) => {
                debug!(
                    "loaded {} cache buckets from {}",
                    entries.len(),
                    path.display()
                );
                entries
            },
            Ok(None) => DashMap::new(),
            Err(e) => {
                warn!("ignoring unreadable cache {}: {e:#}", path.display());
                DashMap::new()
            },
        };

        Self {
            entries,
            path: Some(path),
            flush: Mutex::new(()),
        }
    }

    #[inline]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the cached value, or `None` if absent or not decodable as `T`.
    #[inline]
    pub fn get<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Option<T> {
        let value = self.entries.get(bucket)?.get(key)?.value().clone();
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("discarding cache entry {bucket}/{key}: {e}");
                None
            },
        }
    }

    #[inline]
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.entries.get(bucket).is_some_and(|entries| entries.contains_key(key))
    }

    #[inline]
    pub fn set<T: Serialize>(&self, bucket: &str, key: &str, value: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to serialize cache entry {bucket}/{key}"))?;
        self.entries.entry(bucket.to_owned()).or_default().insert(key.to_owned(), value);
        self.persist()
    }

    #[inline]
    pub fn remove(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        let removed =
            self.entries.get(bucket).and_then(|entries| entries.remove(key)).is_some();
        if removed {
            self.persist()?;
        }
        Ok(())
    }

    /// Removes every key in `bucket` starting with `prefix`.
    #[inline]
    pub fn remove_prefix(&self, bucket: &str, prefix: &str) -> anyhow::Result<()> {
        if let Some(entries) = self.entries.get(bucket) {
            entries.retain(|key, _| !key.starts_with(prefix));
        }
        self.persist()
    }

    #[inline]
    pub fn len(&self, bucket: &str) -> usize {
        self.entries.get(bucket).map_or(0, |entries| entries.len())
    }

    fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        // Serialize writers so the temp file is never shared
        let _guard = self.flush.lock().expect("cache flush mutex poisoned");
        let snapshot: BTreeMap<String, BTreeMap<String, Value>> = self
            .entries
            .iter()
            .map(|bucket| {
                let entries = bucket
                    .value()
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect();
                (bucket.key().clone(), entries)
            })
            .collect();

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create cache directory {parent:?}"))?;
        }
        let temp_path = path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create {temp_path:?}"))?;
        file.write_all(serde_json::to_string(&snapshot)?.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path).with_context(|| format!("Failed to replace {path:?}"))?;

        Ok(())
    }
}

fn load(path: &Path) -> anyhow::Result<Option<DashMap<String, DashMap<String, Value>>>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    let entries: DashMap<String, DashMap<String, Value>> =
        serde_json::from_reader(BufReader::new(file))?;
    Ok(Some(entries))
}
