//! Persistence of the [`Status`] document.
//!
//! The store is the single owner of the authoritative state. Saves are
//! crash-safe (write temp, fsync, rename) and optionally coalesced so a
//! burst of mutations produces a single disk write.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::model::{Info, Status};

/// Owns the authoritative [`Status`] document and its on-disk snapshot.
///
/// All mutation goes through the controller; the store only hands out deep
/// copies and commits whole replacement documents.
pub struct Store {
    path: PathBuf,
    status: RwLock<Status>,
    delay_saves: bool,
    save_delay: Duration,
    /// Set while a coalesced save timer is pending.
    save_pending: AtomicBool,
    /// Last save failure, surfaced once on the next response.
    save_warning: Mutex<Option<String>>,
}

impl Store {
    /// Loads the snapshot at `path`, falling back to the factory default
    /// when the file is missing or unparsable. The returned store holds a
    /// legal document either way; an initial save is scheduled for the
    /// default case by the caller's first commit.
    pub fn load(path: &Path, units: usize, info: Info, delay_saves: bool) -> Arc<Store> {
        let status = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Status>(&contents) {
                Ok(mut status) => {
                    status.info = info;
                    status.warning = None;
                    log::info!(
                        "[Store] Loaded config from {} ({} zones, {} streams, {} presets)",
                        path.display(),
                        status.zones.len(),
                        status.streams.len(),
                        status.presets.len()
                    );
                    status
                }
                Err(e) => {
                    log::warn!(
                        "[Store] Config at {} is unparsable ({}), using factory default",
                        path.display(),
                        e
                    );
                    Status::factory_default(units, info)
                }
            },
            Err(_) => {
                log::info!(
                    "[Store] No config at {}, using factory default",
                    path.display()
                );
                Status::factory_default(units, info)
            }
        };
        Arc::new(Store {
            path: path.to_path_buf(),
            status: RwLock::new(status),
            delay_saves,
            save_delay: Duration::from_secs(1),
            save_pending: AtomicBool::new(false),
            save_warning: Mutex::new(None),
        })
    }

    /// Creates a store around an explicit document, used by tests.
    pub fn with_status(path: &Path, status: Status, delay_saves: bool) -> Arc<Store> {
        Arc::new(Store {
            path: path.to_path_buf(),
            status: RwLock::new(status),
            delay_saves,
            save_delay: Duration::from_secs(1),
            save_pending: AtomicBool::new(false),
            save_warning: Mutex::new(None),
        })
    }

    /// Returns a deep copy of the current document, safe for concurrent
    /// reads; never blocks writers for longer than the copy.
    pub fn snapshot(&self) -> Status {
        self.status.read().clone()
    }

    /// Replaces the authoritative document. Called by the controller only,
    /// after effects have succeeded and invariants have been re-checked.
    pub fn commit(&self, status: Status) {
        *self.status.write() = status;
    }

    /// Schedules a snapshot save according to the coalescing policy: with
    /// `delay_saves` a single timer fires after the latest mutation burst,
    /// otherwise the save happens synchronously.
    pub fn schedule_save(self: &Arc<Self>) {
        if !self.delay_saves {
            self.save_now();
            return;
        }
        if self.save_pending.swap(true, Ordering::SeqCst) {
            return; // timer already pending
        }
        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(store.save_delay).await;
            store.save_pending.store(false, Ordering::SeqCst);
            store.save_now();
        });
    }

    /// Flushes any pending coalesced save; called on shutdown.
    pub fn flush(&self) {
        if self.save_pending.swap(false, Ordering::SeqCst) {
            self.save_now();
        }
    }

    /// Takes the warning left by the most recent failed save, if any.
    pub fn take_warning(&self) -> Option<String> {
        self.save_warning.lock().take()
    }

    /// Serializes the current document and writes it out atomically.
    /// A failed write is retried once; a persistent failure is recorded as
    /// a warning but does not roll back in-memory state.
    pub fn save_now(&self) {
        let mut doc = self.snapshot();
        // Derived group fields and response warnings are never stored.
        doc.warning = None;
        for group in &mut doc.groups {
            group.source_id = None;
            group.mute = None;
            group.vol_delta = None;
        }
        let result = write_atomic(&self.path, &doc).or_else(|e| {
            log::warn!(
                "[Store] Save to {} failed ({}), retrying",
                self.path.display(),
                e
            );
            write_atomic(&self.path, &doc)
        });
        match result {
            Ok(()) => log::debug!("[Store] Saved config to {}", self.path.display()),
            Err(e) => {
                log::error!("[Store] Save to {} failed: {}", self.path.display(), e);
                *self.save_warning.lock() =
                    Some(format!("failed to save config to {}: {}", self.path.display(), e));
            }
        }
    }
}

/// Writes `status` as pretty JSON via temp file, fsync, and rename so a
/// crash mid-save never leaves a torn snapshot.
fn write_atomic(path: &Path, status: &Status) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_json::to_string_pretty(status)?;
    let temp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Status, ZONES_PER_UNIT};

    fn temp_config() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("house.json");
        (dir, path)
    }

    #[test]
    fn missing_file_yields_factory_default() {
        let (_dir, path) = temp_config();
        let store = Store::load(&path, 1, Info::default(), false);
        let status = store.snapshot();
        assert_eq!(status.zones.len(), ZONES_PER_UNIT);
        assert_eq!(status.sources.len(), 4);
    }

    #[test]
    fn corrupt_file_yields_factory_default() {
        let (_dir, path) = temp_config();
        std::fs::write(&path, "{not json").unwrap();
        let store = Store::load(&path, 1, Info::default(), false);
        assert_eq!(store.snapshot().sources.len(), 4);
    }

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, path) = temp_config();
        let store = Store::load(&path, 1, Info::default(), false);
        let mut status = store.snapshot();
        status.zones[2].vol = -42;
        status.zones[2].name = "Kitchen".to_string();
        store.commit(status.clone());
        store.save_now();

        let reloaded = Store::load(&path, 1, Info::default(), false);
        let back = reloaded.snapshot();
        assert_eq!(back.zones[2].vol, -42);
        assert_eq!(back.zones[2].name, "Kitchen");
        assert_eq!(back, status);
    }

    #[test]
    fn save_is_deterministic() {
        let (_dir, path) = temp_config();
        let store = Store::load(&path, 1, Info::default(), false);
        store.save_now();
        let first = std::fs::read_to_string(&path).unwrap();
        store.save_now();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn derived_group_fields_are_not_persisted() {
        let (_dir, path) = temp_config();
        let store = Store::load(&path, 1, Info::default(), false);
        let mut status = store.snapshot();
        status.derive_groups();
        store.commit(status);
        store.save_now();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["groups"][0].get("vol_delta").is_none());
    }

    #[test]
    fn failed_save_surfaces_warning_once() {
        let dir = tempfile::tempdir().unwrap();
        // A directory path cannot be renamed over, so the save fails.
        let path = dir.path().to_path_buf();
        let store = Store::with_status(&path, Status::factory_default(1, Info::default()), false);
        store.save_now();
        assert!(store.take_warning().is_some());
        assert!(store.take_warning().is_none());
    }

    #[tokio::test]
    async fn delayed_saves_coalesce() {
        let (_dir, path) = temp_config();
        let store = Store::load(&path, 1, Info::default(), true);
        store.schedule_save();
        store.schedule_save();
        store.schedule_save();
        assert!(!path.exists());
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn flush_writes_pending_save() {
        let (_dir, path) = temp_config();
        let store = Store::load(&path, 1, Info::default(), true);
        store.schedule_save();
        assert!(!path.exists());
        store.flush();
        assert!(path.exists());
    }
}
