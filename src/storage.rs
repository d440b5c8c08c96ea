//! Durable JSON storage: the access cache, the master-card table, and the
//! two ring-capped log files. Each document gets an advisory exclusive file
//! lock (`fs2`) around its read-modify-write so a concurrently running
//! migration tool can't tear a write.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StorageError;
use crate::events::{AccessLogEntry, DoorEventEntry, ring_push};

const CACHE_FRESHNESS: Duration = Duration::from_secs(86_400);
const ACCESS_LOG_CAP: usize = 1000;
const DOOR_EVENT_CAP: usize = 500;

/// A card entry in the access cache, keyed by `"{facility},{user_id}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCard {
    pub card_id: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub doors: String,
    pub active: bool,
    pub schedule_id: Option<i64>,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
    /// Carried for schema compatibility; no component consumes it.
    pub group_id: Option<i64>,
}

impl CachedCard {
    pub fn display_name(&self, user_id: &str) -> String {
        let name = format!(
            "{} {}",
            self.firstname.as_deref().unwrap_or(""),
            self.lastname.as_deref().unwrap_or("")
        );
        let trimmed = name.trim();
        if trimmed.is_empty() {
            user_id.to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// A single weekday's access window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayWindow {
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub is_24_7: bool,
    pub monday: DayWindow,
    pub tuesday: DayWindow,
    pub wednesday: DayWindow,
    pub thursday: DayWindow,
    pub friday: DayWindow,
    pub saturday: DayWindow,
    pub sunday: DayWindow,
}

impl Schedule {
    pub fn window_for(&self, weekday: chrono::Weekday) -> DayWindow {
        use chrono::Weekday::*;
        match weekday {
            Mon => self.monday,
            Tue => self.tuesday,
            Wed => self.wednesday,
            Thu => self.thursday,
            Fri => self.friday,
            Sat => self.saturday,
            Sun => self.sunday,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holiday {
    pub date: NaiveDate,
    pub recurring: bool,
    pub access_denied: bool,
    pub name: String,
}

impl Holiday {
    pub fn matches(&self, today: NaiveDate) -> bool {
        if self.recurring {
            self.date.month() == today.month() && self.date.day() == today.day()
        } else {
            self.date == today
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoorSettings {
    pub status: Option<String>,
    pub locked: Option<bool>,
}

/// Whole-document snapshot of the access cache. Replaced atomically by the
/// Synchronizer; readers always see one complete generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessCache {
    pub zone: String,
    pub sync_time: i64,
    pub cards: HashMap<String, CachedCard>,
    pub schedules: HashMap<String, Schedule>,
    pub holidays: Vec<Holiday>,
    pub door_settings: DoorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterCard {
    pub card_id: String,
    pub facility: String,
    pub user_id: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterCards {
    pub last_sync: i64,
    pub cards: HashMap<String, MasterCard>,
}

/// Durable store for one zone's cache directory.
pub struct CacheStore {
    dir: PathBuf,
    zone: String,
}

impl CacheStore {
    pub fn new(dir: PathBuf, zone: String) -> Result<Self, StorageError> {
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(CacheStore { dir, zone })
    }

    fn access_cache_path(&self) -> PathBuf {
        self.dir.join(format!("{}_access_cache.json", self.zone))
    }

    fn master_cards_path(&self) -> PathBuf {
        self.dir.join("master_cards.json")
    }

    fn access_log_path(&self) -> PathBuf {
        self.dir.join(format!("{}_access_log.json", self.zone))
    }

    fn door_events_path(&self) -> PathBuf {
        self.dir.join(format!("{}_door_events.json", self.zone))
    }

    pub fn load_access_cache(&self) -> AccessCache {
        load_document_or_default(&self.access_cache_path())
    }

    pub fn save_access_cache(&self, snapshot: &AccessCache) -> Result<(), StorageError> {
        save_document(&self.access_cache_path(), snapshot)
    }

    pub fn load_master_cards(&self) -> MasterCards {
        load_document_or_default(&self.master_cards_path())
    }

    pub fn save_master_cards(&self, table: &MasterCards) -> Result<(), StorageError> {
        save_document(&self.master_cards_path(), table)
    }

    pub fn is_access_cache_fresh(&self, cache: &AccessCache, now: DateTime<Utc>) -> bool {
        let age = now.timestamp() - cache.sync_time;
        age >= 0 && Duration::from_secs(age as u64) < CACHE_FRESHNESS
    }

    pub fn append_access_log(&self, entry: AccessLogEntry) -> Result<(), StorageError> {
        append_ring(&self.access_log_path(), entry, ACCESS_LOG_CAP)
    }

    pub fn append_door_event(&self, entry: DoorEventEntry) -> Result<(), StorageError> {
        append_ring(&self.door_events_path(), entry, DOOR_EVENT_CAP)
    }
}

/// Load a JSON document, locking it shared while reading. Missing file or
/// corrupt JSON both fall back to `T::default()` rather than failing.
/// Corruption must never block the decision path.
fn load_document_or_default<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> T {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return T::default(),
    };
    if file.lock_shared().is_err() {
        return T::default();
    }
    let result = serde_json::from_reader(&file).unwrap_or_else(|e| {
        log::warn!("storage: corrupt document {}: {}", path.display(), e);
        T::default()
    });
    let _ = file.unlock();
    result
}

/// Whole-document replace: write to a sibling temp file under the same lock,
/// then rename over the original so readers never observe a partial write.
fn save_document<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|source| StorageError::Io {
            path: tmp_path.display().to_string(),
            source,
        })?;
    tmp.lock_exclusive().map_err(|source| StorageError::Lock {
        path: tmp_path.display().to_string(),
        source,
    })?;
    serde_json::to_writer_pretty(&tmp, value).map_err(|e| StorageError::Io {
        path: tmp_path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    })?;
    tmp.sync_all().map_err(|source| StorageError::Io {
        path: tmp_path.display().to_string(),
        source,
    })?;
    fs::rename(&tmp_path, path).map_err(|source| StorageError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

/// Append one entry to a JSON-array ring file, capped at `cap`. A corrupt
/// file is truncated and reset to hold just the new entry, per spec.md §4.3.
fn append_ring<T: Serialize + for<'de> Deserialize<'de>>(
    path: &Path,
    entry: T,
    cap: usize,
) -> Result<(), StorageError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| StorageError::Io {
            path: path.display().to_string(),
            source,
        })?;
    file.lock_exclusive().map_err(|source| StorageError::Lock {
        path: path.display().to_string(),
        source,
    })?;

    let mut contents = String::new();
    file.read_to_string(&mut contents).map_err(|source| StorageError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut ring: Vec<T> = if contents.trim().is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            log::warn!("storage: resetting corrupt ring {}: {}", path.display(), e);
            Vec::new()
        })
    };

    ring_push(&mut ring, entry, cap);

    file.set_len(0).map_err(|source| StorageError::Io {
        path: path.display().to_string(),
        source,
    })?;
    file.seek(SeekFrom::Start(0)).map_err(|source| StorageError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::to_writer_pretty(&file, &ring).map_err(|e| StorageError::Io {
        path: path.display().to_string(),
        source: std::io::Error::new(std::io::ErrorKind::Other, e),
    })?;
    file.flush().ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DoorEventType;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"), "front".into()).unwrap();
        (dir, store)
    }

    #[test]
    fn missing_access_cache_loads_as_default() {
        let (_dir, store) = store();
        let cache = store.load_access_cache();
        assert_eq!(cache.sync_time, 0);
        assert!(cache.cards.is_empty());
    }

    #[test]
    fn access_cache_round_trips() {
        let (_dir, store) = store();
        let mut cache = AccessCache {
            zone: "front".into(),
            sync_time: 100,
            ..Default::default()
        };
        cache.cards.insert(
            "123,45678".into(),
            CachedCard {
                card_id: "abc".into(),
                firstname: Some("Ada".into()),
                lastname: None,
                doors: "front,*".into(),
                active: true,
                schedule_id: None,
                valid_from: None,
                valid_until: None,
                group_id: None,
            },
        );
        store.save_access_cache(&cache).unwrap();

        let loaded = store.load_access_cache();
        assert_eq!(loaded.sync_time, 100);
        assert_eq!(loaded.cards["123,45678"].card_id, "abc");
    }

    #[test]
    fn corrupt_access_cache_falls_back_to_default() {
        let (_dir, store) = store();
        fs::create_dir_all(store.dir.clone()).unwrap();
        fs::write(store.access_cache_path(), b"{ not json at all").unwrap();
        let loaded = store.load_access_cache();
        assert!(loaded.cards.is_empty());
    }

    #[test]
    fn cache_freshness_respects_24h_window() {
        let (_dir, store) = store();
        let now = Utc::now();
        let fresh = AccessCache {
            sync_time: now.timestamp() - 3600,
            ..Default::default()
        };
        let stale = AccessCache {
            sync_time: now.timestamp() - 90_000,
            ..Default::default()
        };
        assert!(store.is_access_cache_fresh(&fresh, now));
        assert!(!store.is_access_cache_fresh(&stale, now));
    }

    fn log_entry(user: &str) -> AccessLogEntry {
        AccessLogEntry {
            timestamp: Utc::now(),
            user_id: user.into(),
            card_id: "abc".into(),
            facility: "1".into(),
            granted: true,
            reason: String::new(),
            zone: "front".into(),
            ip: "127.0.0.1".into(),
        }
    }

    #[test]
    fn access_log_ring_caps_at_1000() {
        let (_dir, store) = store();
        for i in 0..1001 {
            store.append_access_log(log_entry(&i.to_string())).unwrap();
        }
        let contents = fs::read_to_string(store.access_log_path()).unwrap();
        let ring: Vec<AccessLogEntry> = serde_json::from_str(&contents).unwrap();
        assert_eq!(ring.len(), 1000);
        assert_eq!(ring[0].user_id, "1");
        assert_eq!(ring[999].user_id, "1000");
    }

    #[test]
    fn garbage_access_log_resets_to_single_new_entry() {
        let (_dir, store) = store();
        fs::create_dir_all(&store.dir).unwrap();
        fs::write(store.access_log_path(), b"\xff\xff not json").unwrap();
        store.append_access_log(log_entry("42")).unwrap();

        let contents = fs::read_to_string(store.access_log_path()).unwrap();
        let ring: Vec<AccessLogEntry> = serde_json::from_str(&contents).expect("well-formed JSON");
        assert_eq!(ring.len(), 1);
        assert_eq!(ring[0].user_id, "42");
    }

    #[test]
    fn door_event_ring_caps_at_500() {
        let (_dir, store) = store();
        for _ in 0..501 {
            store
                .append_door_event(DoorEventEntry {
                    timestamp: Utc::now(),
                    event_type: DoorEventType::DoorOpened,
                    details: String::new(),
                    zone: "front".into(),
                })
                .unwrap();
        }
        let contents = fs::read_to_string(store.door_events_path()).unwrap();
        let ring: Vec<DoorEventEntry> = serde_json::from_str(&contents).unwrap();
        assert_eq!(ring.len(), 500);
    }
}
