//! The signed-in member's notes, kept in step with the local cache.

use anyhow::Result;
use chrono::Duration;
use futures_util::stream::{self, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::ApiClient;
use crate::clock::{Clock, SystemClock};
use crate::error::FetchError;
use crate::note::{Note, NoteId};
use crate::notes_cache::CacheSink;

/// Detail requests in flight at once during a sync.
const SYNC_CONCURRENCY: usize = 4;

/// How far back a note still counts as recent.
const RECENT_DAYS: i64 = 7;

/// Dashboard counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LibraryStats {
    pub total: usize,
    /// Notes with at least one recognized image
    pub treasured: usize,
    /// Notes created within the last week
    pub recent: usize,
}

pub struct NoteLibrary {
    api: Arc<ApiClient>,
    cache: Arc<dyn CacheSink>,
    clock: Arc<dyn Clock>,
}

impl NoteLibrary {
    pub fn new(api: Arc<ApiClient>, cache: Arc<dyn CacheSink>) -> Self {
        Self {
            api,
            cache,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache(&self) -> &Arc<dyn CacheSink> {
        &self.cache
    }

    /// Cached notes when there are any, otherwise a fresh sync.
    pub async fn notes(&self, refresh: bool) -> Result<Vec<Note>, FetchError> {
        if !refresh {
            let cached = self.cache.read_all();
            if !cached.is_empty() {
                tracing::debug!(count = cached.len(), "serving notes from cache");
                return Ok(cached);
            }
        }
        self.sync().await
    }

    /// Notes whose title, content or recognized text contains `query`.
    pub async fn search(&self, query: &str, refresh: bool) -> Result<Vec<Note>, FetchError> {
        let notes = self.notes(refresh).await?;
        Ok(notes.into_iter().filter(|n| n.matches(query)).collect())
    }

    pub fn stats(&self, notes: &[Note]) -> LibraryStats {
        let since = self.clock.now() - Duration::days(RECENT_DAYS);
        LibraryStats {
            total: notes.len(),
            treasured: notes.iter().filter(|n| n.done_count() > 0).count(),
            recent: notes.iter().filter(|n| n.created_at > since).count(),
        }
    }

    /// Fetch the list, then every note's detail, and replace the cache.
    ///
    /// The list endpoint omits images, so each entry is fetched on its own.
    /// A note whose detail fails to load is left out; an auth failure aborts
    /// the whole sync.
    pub async fn sync(&self) -> Result<Vec<Note>, FetchError> {
        let summaries = self.api.list_notes().await?;
        tracing::debug!(count = summaries.len(), "syncing notes");

        let results: Vec<_> = stream::iter(summaries.iter())
            .map(|summary| async move { (summary, self.api.get_note(&summary.note_id).await) })
            .buffered(SYNC_CONCURRENCY)
            .collect()
            .await;

        let mut notes = Vec::with_capacity(results.len());
        for (summary, result) in results {
            match result {
                Ok(note) => notes.push(note),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => tracing::warn!(note_id = %summary.note_id, "Skipping note: {}", e),
            }
        }

        self.cache.write_all(&notes);
        tracing::info!(count = notes.len(), "notes synced");
        Ok(notes)
    }

    /// Upload a new note and cache it if its detail can be read back.
    pub async fn create(&self, title: &str, content: &str, images: &[PathBuf]) -> Result<NoteId> {
        let id = self.api.create_note(title, content, images).await?;
        match self.api.get_note(&id).await {
            Ok(note) => self.cache.write(&note),
            Err(e) => tracing::warn!(note_id = %id, "Created note not readable yet: {}", e),
        }
        Ok(id)
    }

    pub async fn delete(&self, id: &NoteId) -> Result<(), FetchError> {
        self.api.delete_note(id).await?;
        self.cache.remove(id);
        Ok(())
    }
}
