//! Persisted port/PID leases shared by concurrent runs on one machine.
//!
//! The store is a best-effort hint, not a hard reservation: access is
//! read-modify-write on a whole YAML file with last-writer-wins semantics,
//! and the port allocator's bind probe remains the source of truth for
//! whether a port is actually free. Corruption or read failure degrades to
//! "no leases known" rather than blocking a run.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::process::reaper;

/// Run entries untouched for longer than this are reclaimed by any cleanup
/// pass, even one triggered by an unrelated run.
pub const LEASE_EXPIRY_MS: i64 = 2 * 60 * 60 * 1000;

/// One leased resource within a run: a named port and, once the owning
/// process has been spawned, its PID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseItem {
    /// Lease name, namespaced per stage (e.g. `proxy`, `mock-server`).
    pub name: String,
    /// The leased port. Set at acquisition time and never changed.
    pub port: u16,
    /// PID of the process using the port, recorded after spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// All leases held by one run identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLeases {
    /// Last-touched timestamp, epoch milliseconds.
    pub t: i64,
    /// The owning checkout's base path. Diagnostic only.
    #[serde(rename = "basePath")]
    pub base_path: String,
    /// Leases in acquisition order.
    pub list: Vec<LeaseItem>,
}

/// Cross-run memory of the most recent port a named shared service ran on,
/// independent of the per-run lease lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUsedPort {
    /// When the slot was written, epoch milliseconds.
    pub t: i64,
    /// The port the service was last reachable on.
    pub port: u16,
}

/// A single entry in the lease file: either a run's leases (keyed by run
/// identifier) or a `lastUsed<Name>` singleton slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheEntry {
    /// Leases held by a run.
    Run(RunLeases),
    /// A `lastUsed<Name>` slot.
    LastUsed(LastUsedPort),
}

/// The full persisted mapping. `BTreeMap` keeps key order deterministic so
/// the file stays diffable.
pub type CacheData = BTreeMap<String, CacheEntry>;

/// Handle to the persisted lease file.
#[derive(Debug, Clone)]
pub struct LeaseStore {
    path: PathBuf,
}

impl Default for LeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseStore {
    /// Opens the store at the fixed per-user location
    /// (`~/.webtestflow/leases.yml`).
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: default_lease_path(),
        }
    }

    /// Opens the store at an explicit path. Used by tests and by callers
    /// that isolate runs into their own store.
    #[must_use]
    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the full persisted mapping.
    ///
    /// Returns `None` when the file is missing, empty or corrupt; that is
    /// logged, never raised, so a damaged store degrades to "no leases
    /// known".
    #[must_use]
    pub fn load(&self) -> Option<CacheData> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::debug!(path = %self.path.display(), error = %err, "lease file not readable");
                return None;
            }
        };

        if raw.trim().is_empty() {
            return None;
        }

        match serde_yaml::from_str(&raw) {
            Ok(data) => Some(data),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "lease file corrupt, ignoring");
                None
            }
        }
    }

    /// Atomically overwrites the persisted mapping.
    pub fn save(&self, data: &CacheData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let serialized = serde_yaml::to_string(data)?;
        let tmp = self.path.with_extension("yml.tmp");
        std::fs::write(&tmp, serialized)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Appends a `{name, port}` lease to the run's list, creating the run
    /// entry if absent, and refreshes the run's timestamp.
    pub fn acquire_port(
        &self,
        name: &str,
        port: u16,
        run_id: &str,
        base_path: &Path,
    ) -> Result<()> {
        let mut data = self.load().unwrap_or_default();
        let now = now_ms();

        let item = LeaseItem {
            name: name.to_string(),
            port,
            pid: None,
        };

        match data.get_mut(run_id) {
            Some(CacheEntry::Run(entry)) => {
                entry.list.push(item);
                entry.t = now;
                entry.base_path = base_path.display().to_string();
            }
            _ => {
                data.insert(
                    run_id.to_string(),
                    CacheEntry::Run(RunLeases {
                        t: now,
                        base_path: base_path.display().to_string(),
                        list: vec![item],
                    }),
                );
            }
        }

        self.save(&data)
    }

    /// Records the PID for the run's first lease item matching `name`.
    ///
    /// A no-op when the run entry or a matching item does not exist. If two
    /// leases share a name only the first is updated.
    pub fn record_pid(&self, name: &str, pid: u32, run_id: &str) -> Result<()> {
        let Some(mut data) = self.load() else {
            return Ok(());
        };
        let Some(CacheEntry::Run(entry)) = data.get_mut(run_id) else {
            return Ok(());
        };
        let Some(item) = entry.list.iter_mut().find(|item| item.name == name) else {
            return Ok(());
        };

        item.pid = Some(pid);
        entry.t = now_ms();
        self.save(&data)
    }

    /// The union of every leased port across all run entries, used to seed
    /// the port allocator's exclusion set.
    #[must_use]
    pub fn used_ports(&self) -> BTreeSet<u16> {
        let Some(data) = self.load() else {
            return BTreeSet::new();
        };

        data.values()
            .filter_map(|entry| match entry {
                CacheEntry::Run(run) => Some(&run.list),
                CacheEntry::LastUsed(_) => None,
            })
            .flatten()
            .map(|item| item.port)
            .collect()
    }

    /// Cleans the given run's leases and sweeps expired entries.
    ///
    /// Every PID recorded in a cleaned entry is killed best-effort (errors
    /// logged, never raised), then the entry is removed. The expiry sweep
    /// reclaims entries abandoned by crashed prior runs regardless of which
    /// run triggered the pass. Idempotent: a second call is a no-op.
    pub async fn cleanup(&self, run_id: &str) -> Result<()> {
        let Some(mut data) = self.load() else {
            return Ok(());
        };

        let mut removed = false;

        if data.contains_key(run_id) {
            tracing::info!(run_id, "cleaning leases for run");
            Self::clean_entry(&mut data, run_id).await;
            removed = true;
        }

        let now = now_ms();
        let expired: Vec<String> = data
            .iter()
            .filter(|(_, entry)| now - entry_timestamp(entry) > LEASE_EXPIRY_MS)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            tracing::info!(key, "cleaning expired lease entry");
            Self::clean_entry(&mut data, &key).await;
            removed = true;
        }

        if removed {
            self.save(&data)?;
        }
        Ok(())
    }

    /// Kills the entry's PIDs and removes it from the map.
    async fn clean_entry(data: &mut CacheData, key: &str) {
        if let Some(CacheEntry::Run(entry)) = data.get(key) {
            let pids: Vec<u32> = entry.list.iter().filter_map(|item| item.pid).collect();
            if !pids.is_empty() {
                if let Err(err) = reaper::kill_by_pids(&pids).await {
                    tracing::warn!(key, ?pids, error = %err, "lease cleanup kill failed");
                }
            }
        }

        data.remove(key);
    }

    /// Remembers the most recent working port for a named shared service.
    pub fn save_last_used_port(&self, name: &str, port: u16) -> Result<()> {
        let mut data = self.load().unwrap_or_default();
        data.insert(
            last_used_key(name),
            CacheEntry::LastUsed(LastUsedPort { t: now_ms(), port }),
        );
        self.save(&data)
    }

    /// Returns the remembered port for a named shared service, if any.
    #[must_use]
    pub fn last_used_port(&self, name: &str) -> Option<u16> {
        match self.load()?.get(&last_used_key(name)) {
            Some(CacheEntry::LastUsed(slot)) if slot.port != 0 => Some(slot.port),
            _ => None,
        }
    }

    /// Forgets the remembered port for a named shared service.
    pub fn clear_last_used_port(&self, name: &str) -> Result<()> {
        let Some(mut data) = self.load() else {
            return Ok(());
        };
        if data.remove(&last_used_key(name)).is_some() {
            self.save(&data)?;
        }
        Ok(())
    }
}

fn last_used_key(name: &str) -> String {
    format!("lastUsed{name}")
}

fn entry_timestamp(entry: &CacheEntry) -> i64 {
    match entry {
        CacheEntry::Run(run) => run.t,
        CacheEntry::LastUsed(slot) => slot.t,
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The fixed per-user lease file location.
#[must_use]
pub fn default_lease_path() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".webtestflow")
        .join("leases.yml")
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store_in(dir: &tempfile::TempDir) -> LeaseStore {
        LeaseStore::at_path(dir.path().join("leases.yml"))
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store_in(&dir).load().is_none());
    }

    #[test]
    fn test_load_corrupt_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), ": not { valid yaml [").unwrap();

        assert!(store.load().is_none());
    }

    #[test]
    fn test_acquire_port_creates_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .acquire_port("proxy", 9529, "run1", Path::new("/checkout"))
            .unwrap();
        store
            .acquire_port("mock-server", 9530, "run1", Path::new("/checkout"))
            .unwrap();

        let data = store.load().unwrap();
        let Some(CacheEntry::Run(entry)) = data.get("run1") else {
            panic!("run entry missing");
        };
        assert_eq!(entry.list.len(), 2);
        assert_eq!(entry.list[0].name, "proxy");
        assert_eq!(entry.list[0].port, 9529);
        assert_eq!(entry.list[1].port, 9530);
        assert_eq!(entry.base_path, "/checkout");
    }

    #[test]
    fn test_used_ports_is_union_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .acquire_port("proxy", 9529, "run1", Path::new("/a"))
            .unwrap();
        store
            .acquire_port("proxy", 9530, "run2", Path::new("/b"))
            .unwrap();
        store
            .acquire_port("mock-server", 9531, "run2", Path::new("/b"))
            .unwrap();
        store.save_last_used_port("Proxy", 9600).unwrap();

        // lastUsed slots are memory, not leases: they do not reserve ports.
        let used = store.used_ports();
        assert_eq!(used, BTreeSet::from([9529, 9530, 9531]));
    }

    #[test]
    fn test_record_pid_updates_first_match_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .acquire_port("proxy", 9529, "run1", Path::new("/a"))
            .unwrap();
        store
            .acquire_port("proxy", 9530, "run1", Path::new("/a"))
            .unwrap();

        store.record_pid("proxy", 4242, "run1").unwrap();

        let data = store.load().unwrap();
        let Some(CacheEntry::Run(entry)) = data.get("run1") else {
            panic!("run entry missing");
        };
        assert_eq!(entry.list[0].pid, Some(4242));
        assert_eq!(entry.list[1].pid, None);
    }

    #[test]
    fn test_record_pid_without_entry_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.record_pid("proxy", 4242, "missing-run").unwrap();

        assert!(store.load().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .acquire_port("proxy", 9529, "run1", Path::new("/a"))
            .unwrap();

        store.cleanup("run1").await.unwrap();
        assert!(store.load().map_or(true, |data| !data.contains_key("run1")));

        // Second pass sees nothing to do and does not error.
        store.cleanup("run1").await.unwrap();
        assert!(store.load().map_or(true, |data| !data.contains_key("run1")));
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_expired_unrelated_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut data = CacheData::new();
        data.insert(
            "stale-run".to_string(),
            CacheEntry::Run(RunLeases {
                t: now_ms() - LEASE_EXPIRY_MS - 1000,
                base_path: "/old".to_string(),
                list: vec![LeaseItem {
                    name: "proxy".to_string(),
                    port: 9700,
                    pid: None,
                }],
            }),
        );
        data.insert(
            "fresh-run".to_string(),
            CacheEntry::Run(RunLeases {
                t: now_ms(),
                base_path: "/new".to_string(),
                list: vec![LeaseItem {
                    name: "proxy".to_string(),
                    port: 9701,
                    pid: None,
                }],
            }),
        );
        store.save(&data).unwrap();

        store.cleanup("some-other-run").await.unwrap();

        let remaining = store.load().unwrap();
        assert!(!remaining.contains_key("stale-run"));
        assert!(remaining.contains_key("fresh-run"));
    }

    #[test]
    fn test_last_used_port_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert_eq!(store.last_used_port("Proxy"), None);

        store.save_last_used_port("Proxy", 9600).unwrap();
        assert_eq!(store.last_used_port("Proxy"), Some(9600));

        store.clear_last_used_port("Proxy").unwrap();
        assert_eq!(store.last_used_port("Proxy"), None);
    }

    #[test]
    fn test_save_writes_sorted_human_readable_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .acquire_port("proxy", 9529, "zrun", Path::new("/z"))
            .unwrap();
        store
            .acquire_port("proxy", 9530, "arun", Path::new("/a"))
            .unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let a_pos = raw.find("arun").unwrap();
        let z_pos = raw.find("zrun").unwrap();
        assert!(a_pos < z_pos);
        assert!(raw.contains("basePath"));
    }
}
