use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::clock::{Clock, SystemClock};
use crate::note::{Note, NoteId};

pub const DEFAULT_NAMESPACE: &str = "noteai";
pub const DEFAULT_TTL_MS: u64 = 5 * 60 * 1000;

/// Local copy of notes shared by every view of the same account.
///
/// Implementations must treat an entry older than their time-to-live as
/// absent. Writes are best-effort and never fail the caller.
pub trait CacheSink: Send + Sync {
    fn read(&self, id: &NoteId) -> Option<Note>;

    /// Every live entry, newest first.
    fn read_all(&self) -> Vec<Note>;

    /// Upsert by id: replace in place, or prepend if new.
    fn write(&self, note: &Note);

    /// Replace the whole list and restart the time-to-live.
    fn write_all(&self, notes: &[Note]);

    fn remove(&self, id: &NoteId);
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheInfo {
    pub has_cache: bool,
    pub age: Duration,
    pub notes_count: usize,
    pub is_expired: bool,
}

/// Note list persisted under two namespaced keys: the list itself and the
/// time it was last written.
pub struct NotesCache {
    cache_dir: PathBuf,
    list_key: String,
    timestamp_key: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl NotesCache {
    pub fn new(cache_dir: impl Into<PathBuf>, namespace: &str, ttl_ms: u64) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let ttl = i64::try_from(ttl_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .with_context(|| format!("Cache TTL of {}ms is out of range", ttl_ms))?;
        std::fs::create_dir_all(&cache_dir)
            .context("Failed to create notes cache directory")?;

        Ok(Self {
            cache_dir,
            list_key: format!("{}_notes_cache", namespace),
            timestamp_key: format!("{}_notes_cache_timestamp", namespace),
            ttl,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_dir() -> Result<PathBuf> {
        Ok(dirs::cache_dir()
            .context("Failed to get cache directory")?
            .join("noteai"))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// All cached notes, or nothing if the list is missing or expired.
    /// An expired list is purged from disk.
    pub fn get_notes(&self) -> Vec<Note> {
        let Some(cached_at) = self.load_timestamp() else {
            tracing::debug!("notes cache empty");
            return Vec::new();
        };

        if !self.is_valid(cached_at) {
            tracing::debug!(
                age_secs = (self.clock.now() - cached_at).num_seconds(),
                "notes cache expired"
            );
            self.clear();
            return Vec::new();
        }

        self.load_list().unwrap_or_default()
    }

    pub fn get_note(&self, id: &NoteId) -> Option<Note> {
        let note = self.get_notes().into_iter().find(|n| &n.note_id == id);
        tracing::debug!(note_id = %id, hit = note.is_some(), "notes cache lookup");
        note
    }

    pub fn save_notes(&self, notes: &[Note]) {
        // Cache is best-effort
        if let Err(e) = self.save_to_disk(notes) {
            tracing::warn!("Could not write notes cache: {:#}", e);
        }
    }

    pub fn update_note(&self, note: &Note) {
        let mut notes = self.get_notes();
        match notes.iter().position(|n| n.note_id == note.note_id) {
            Some(index) => notes[index] = note.clone(),
            None => notes.insert(0, note.clone()),
        }
        self.save_notes(&notes);
    }

    pub fn delete_note(&self, id: &NoteId) {
        let notes = self.get_notes();
        let before = notes.len();
        let remaining: Vec<Note> = notes.into_iter().filter(|n| &n.note_id != id).collect();
        if remaining.len() != before {
            self.save_notes(&remaining);
        }
    }

    pub fn clear(&self) {
        for key in [&self.list_key, &self.timestamp_key] {
            if let Err(e) = remove_if_exists(&self.key_path(key)) {
                tracing::warn!("Could not remove cache key {}: {}", key, e);
            }
        }
    }

    pub fn info(&self) -> CacheInfo {
        let cached_at = self.load_timestamp();
        let age = cached_at
            .map(|at| self.clock.now() - at)
            .unwrap_or_else(Duration::zero);
        let is_expired = cached_at.map(|at| !self.is_valid(at)).unwrap_or(true);

        CacheInfo {
            has_cache: cached_at.is_some(),
            age,
            notes_count: self.get_notes().len(),
            is_expired,
        }
    }

    fn is_valid(&self, cached_at: DateTime<Utc>) -> bool {
        let age = self.clock.now() - cached_at;
        age >= Duration::zero() && age <= self.ttl
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key)
    }

    fn load_timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = std::fs::read_to_string(self.key_path(&self.timestamp_key)).ok()?;
        let millis: i64 = raw.trim().parse().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    fn load_list(&self) -> Option<Vec<Note>> {
        let contents = std::fs::read_to_string(self.key_path(&self.list_key)).ok()?;
        match serde_json::from_str(&contents) {
            Ok(notes) => Some(notes),
            Err(e) => {
                tracing::warn!("Notes cache corrupt, ignoring: {}", e);
                None
            }
        }
    }

    fn save_to_disk(&self, notes: &[Note]) -> Result<()> {
        let contents = serde_json::to_string(notes)?;
        std::fs::write(self.key_path(&self.list_key), contents)
            .context("Failed to write notes list")?;
        std::fs::write(
            self.key_path(&self.timestamp_key),
            self.clock.now().timestamp_millis().to_string(),
        )
        .context("Failed to write notes timestamp")?;
        tracing::debug!(count = notes.len(), "notes cache saved");
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// The mutex serializes read-modify-write cycles so concurrent writers are
// last-write-wins per note instead of clobbering each other's lists.
impl CacheSink for Mutex<NotesCache> {
    fn read(&self, id: &NoteId) -> Option<Note> {
        self.lock().unwrap_or_else(|e| e.into_inner()).get_note(id)
    }

    fn read_all(&self) -> Vec<Note> {
        self.lock().unwrap_or_else(|e| e.into_inner()).get_notes()
    }

    fn write(&self, note: &Note) {
        self.lock().unwrap_or_else(|e| e.into_inner()).update_note(note)
    }

    fn write_all(&self, notes: &[Note]) {
        self.lock().unwrap_or_else(|e| e.into_inner()).save_notes(notes)
    }

    fn remove(&self, id: &NoteId) {
        self.lock().unwrap_or_else(|e| e.into_inner()).delete_note(id)
    }
}
