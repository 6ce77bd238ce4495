use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::NoteError;
use crate::library::NoteLibrary;
use crate::note::{AnalysisProgress, Note, NoteId, NoteImage};
use crate::reconciler::{Collaborators, PollingReconciler, ReconcilerEvent, ViewState};
use crate::snapshot;

/// One open note: its latest snapshot plus the poller that keeps it fresh.
///
/// Closing (or dropping) the view tears the poller down.
pub struct NoteDetail {
    reconciler: PollingReconciler,
    events: mpsc::UnboundedReceiver<ReconcilerEvent>,
}

impl NoteDetail {
    /// Load `raw_id` from the cache, or from the server on a miss, and start
    /// polling if any image is still waiting for recognition.
    ///
    /// A malformed id fails before any I/O.
    pub async fn open(raw_id: &str, deps: Collaborators, interval: Duration) -> Result<Self, NoteError> {
        let note_id = NoteId::parse(raw_id)?;

        let initial = match deps.cache.read(&note_id) {
            Some(note) => {
                tracing::debug!(note_id = %note_id, "opened from cache");
                note
            }
            None => {
                let body = deps.source.fetch_note(&note_id).await.map_err(|e| {
                    if e.is_auth() {
                        deps.session.invalidate("session expired, please log in again");
                    }
                    NoteError::from(e)
                })?;
                let note = snapshot::build_note(&body, &note_id, Utc::now());
                deps.cache.write(&note);
                note
            }
        };

        let (reconciler, events) = PollingReconciler::new(note_id, deps, interval);
        reconciler.evaluate(&initial);

        Ok(Self { reconciler, events })
    }

    pub fn note_id(&self) -> &NoteId {
        self.reconciler.note_id()
    }

    pub fn note(&self) -> Option<Note> {
        self.reconciler.view().snapshot
    }

    pub fn view(&self) -> ViewState {
        self.reconciler.view()
    }

    pub fn is_polling(&self) -> bool {
        self.reconciler.is_polling()
    }

    pub fn progress(&self) -> AnalysisProgress {
        self.note()
            .map(|n| n.progress())
            .unwrap_or(AnalysisProgress::NoImages)
    }

    pub fn read_images(&self) -> Vec<NoteImage> {
        self.note()
            .map(|n| n.read_images().cloned().collect())
            .unwrap_or_default()
    }

    pub fn unread_images(&self) -> Vec<NoteImage> {
        self.note()
            .map(|n| n.unread_images().cloned().collect())
            .unwrap_or_default()
    }

    /// Wait for the poller's next event. Pends forever once polling is over,
    /// so callers should stop at the first `PollingStopped` or
    /// `SessionEnded`. An auth failure sends `SessionEnded` first.
    pub async fn next_event(&mut self) -> Option<ReconcilerEvent> {
        self.events.recv().await
    }

    /// Delete the note on the server and locally. Polling ends first so no
    /// late snapshot can bring the entry back.
    pub async fn delete(self, library: &NoteLibrary) -> Result<(), NoteError> {
        self.reconciler.teardown();
        let id = self.note_id().clone();
        library.delete(&id).await?;
        Ok(())
    }

    pub fn close(self) {
        self.reconciler.teardown();
    }
}
