//! Polls a note until every attached image has been recognized.
//!
//! A [`PollingReconciler`] belongs to exactly one view of one note. It moves
//! through `Idle -> Polling -> Stopped` and never comes back from `Stopped`;
//! a view that wants to poll again builds a new reconciler.
//!
//! While polling, a single spawned task fetches the note every interval,
//! rebuilds the snapshot, writes it to the shared cache and publishes it as a
//! [`ReconcilerEvent`]. Ticks are serialized: the next interval only starts
//! counting once the previous fetch has settled, so a slow response can never
//! overwrite a newer one.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::FetchError;
use crate::note::{Note, NoteId};
use crate::notes_cache::CacheSink;
use crate::session::SessionInvalidator;
use crate::snapshot;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// Point-in-time fetch of a note's raw representation.
#[async_trait]
pub trait RemoteStatusSource: Send + Sync {
    async fn fetch_note(&self, id: &NoteId) -> Result<Value, FetchError>;
}

/// Everything a reconciler talks to besides its consumer.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn RemoteStatusSource>,
    pub cache: Arc<dyn CacheSink>,
    pub session: Arc<dyn SessionInvalidator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Polling,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every image is recognized.
    Converged,
    /// The note no longer has any images.
    NoImages,
    /// The server rejected our credentials.
    Unauthorized,
    /// The consumer called [`PollingReconciler::stop`].
    Requested,
}

#[derive(Debug, Clone)]
pub enum ReconcilerEvent {
    PollingStarted,
    Snapshot { note: Note, tick: u64 },
    ImagesCompleted { image_ids: Vec<String> },
    PollingStopped { reason: StopReason },
    SessionEnded,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A fresh snapshot was stored.
    Applied,
    /// The fetch failed in a way worth retrying; nothing changed.
    Transient,
    /// The session is gone; polling stopped.
    AuthFailed,
    /// Not polling, torn down while the fetch was in flight, or another
    /// check was already running; result dropped.
    Discarded,
}

/// Consumer-facing copy of the reconciler's indicators.
#[derive(Debug, Clone)]
pub struct ViewState {
    pub phase: PollPhase,
    pub is_polling: bool,
    pub tick_count: u64,
    pub snapshot: Option<Note>,
    pub session_ended: bool,
}

struct LoopState {
    phase: PollPhase,
    mounted: bool,
    tick_count: u64,
    snapshot: Option<Note>,
    session_ended: bool,
    fetching: bool,
    schedule: Option<JoinHandle<()>>,
}

// Clears the in-flight flag however the fetch ends, including cancellation.
struct InFlight<'a>(&'a Shared);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().fetching = false;
    }
}

struct Shared {
    note_id: NoteId,
    deps: Collaborators,
    interval: Duration,
    event_tx: mpsc::UnboundedSender<ReconcilerEvent>,
    state: Mutex<LoopState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Nothing reaches the consumer once it has gone away.
    fn emit(&self, state: &LoopState, event: ReconcilerEvent) {
        if state.mounted {
            let _ = self.event_tx.send(event);
        }
    }

    fn evaluate_locked(self: &Arc<Self>, state: &mut LoopState, snapshot: &Note) {
        let has_items = !snapshot.images.is_empty();
        let has_pending = snapshot.has_pending();

        match state.phase {
            PollPhase::Idle if has_items && has_pending => self.start_locked(state),
            PollPhase::Polling if !has_items => self.stop_locked(state, StopReason::NoImages),
            PollPhase::Polling if !has_pending => self.stop_locked(state, StopReason::Converged),
            _ => {}
        }
    }

    fn start_locked(self: &Arc<Self>, state: &mut LoopState) {
        if !state.mounted || state.schedule.is_some() {
            return;
        }

        state.phase = PollPhase::Polling;
        state.tick_count = 0;
        state.schedule = Some(tokio::spawn(run_schedule(Arc::clone(self))));
        tracing::info!(note_id = %self.note_id, "unrecognized images found, polling started");
        self.emit(state, ReconcilerEvent::PollingStarted);
    }

    fn stop_locked(&self, state: &mut LoopState, reason: StopReason) {
        if let Some(handle) = state.schedule.take() {
            handle.abort();
        }

        let was_polling = state.phase == PollPhase::Polling;
        state.phase = PollPhase::Stopped;

        if was_polling {
            tracing::info!(note_id = %self.note_id, ?reason, ticks = state.tick_count, "polling stopped");
            self.emit(state, ReconcilerEvent::PollingStopped { reason });
        }
    }

    async fn tick(self: &Arc<Self>) -> TickOutcome {
        {
            let mut state = self.lock();
            if !state.mounted || state.phase != PollPhase::Polling {
                return TickOutcome::Discarded;
            }
            if state.fetching {
                tracing::debug!(note_id = %self.note_id, "status check already in flight");
                return TickOutcome::Discarded;
            }
            state.fetching = true;
        }
        let _in_flight = InFlight(self);

        tracing::debug!(note_id = %self.note_id, "checking recognition status");
        let result = self.deps.source.fetch_note(&self.note_id).await;

        let mut state = self.lock();
        if !state.mounted || state.phase != PollPhase::Polling {
            tracing::debug!(note_id = %self.note_id, "dropping status for a stopped poller");
            return TickOutcome::Discarded;
        }

        match result {
            Ok(body) => {
                let note = snapshot::build_note(&body, &self.note_id, Utc::now());
                let completed = newly_completed(state.snapshot.as_ref(), &note);

                self.deps.cache.write(&note);
                state.tick_count += 1;
                state.snapshot = Some(note.clone());

                let tick = state.tick_count;
                self.emit(&state, ReconcilerEvent::Snapshot { note: note.clone(), tick });
                if !completed.is_empty() {
                    tracing::info!(note_id = %self.note_id, images = ?completed, "images recognized");
                    self.emit(&state, ReconcilerEvent::ImagesCompleted { image_ids: completed });
                }

                self.evaluate_locked(&mut state, &note);
                TickOutcome::Applied
            }
            Err(e) if e.is_auth() => {
                tracing::warn!(note_id = %self.note_id, "status check rejected: {}", e);
                state.session_ended = true;
                // Consumers that stop at the first terminal event must see this one
                self.emit(&state, ReconcilerEvent::SessionEnded);
                self.stop_locked(&mut state, StopReason::Unauthorized);
                drop(state);

                self.deps.session.invalidate("session expired, please log in again");
                TickOutcome::AuthFailed
            }
            Err(e) => {
                tracing::warn!(note_id = %self.note_id, "status check failed, retrying next tick: {}", e);
                TickOutcome::Transient
            }
        }
    }

    fn is_polling(&self) -> bool {
        self.lock().phase == PollPhase::Polling
    }
}

async fn run_schedule(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval_at(Instant::now() + shared.interval, shared.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        shared.tick().await;

        let still_polling = shared.is_polling();
        if !still_polling {
            break;
        }
    }
}

/// Ids of images that are `Done` in `next` but were pending in `previous`.
///
/// Images are matched by id; an image whose id is unknown to the previous
/// snapshot is compared with whatever sat at the same position. Positions
/// past the end of the previous list are skipped.
pub fn newly_completed(previous: Option<&Note>, next: &Note) -> Vec<String> {
    let Some(previous) = previous else {
        return Vec::new();
    };

    next.images
        .iter()
        .enumerate()
        .filter(|(_, img)| img.is_done())
        .filter_map(|(index, img)| {
            let before = previous
                .images
                .iter()
                .find(|old| old.image_id == img.image_id)
                .or_else(|| previous.images.get(index));
            match before {
                Some(old) if !old.is_done() => Some(img.image_id.clone()),
                _ => None,
            }
        })
        .collect()
}

/// Drives polling for one note on behalf of one view.
///
/// Dropping the reconciler tears it down.
pub struct PollingReconciler {
    shared: Arc<Shared>,
}

impl PollingReconciler {
    pub fn new(
        note_id: NoteId,
        deps: Collaborators,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ReconcilerEvent>) {
        let interval = if interval.is_zero() {
            tracing::warn!(
                "zero polling interval, using {}ms",
                DEFAULT_POLL_INTERVAL.as_millis()
            );
            DEFAULT_POLL_INTERVAL
        } else {
            interval
        };
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            note_id,
            deps,
            interval,
            event_tx,
            state: Mutex::new(LoopState {
                phase: PollPhase::Idle,
                mounted: true,
                tick_count: 0,
                snapshot: None,
                session_ended: false,
                fetching: false,
                schedule: None,
            }),
        });

        (Self { shared }, event_rx)
    }

    pub fn note_id(&self) -> &NoteId {
        &self.shared.note_id
    }

    /// Record `snapshot` as the latest known state and start or stop polling
    /// to match it. Repeated calls with the same outcome do nothing.
    ///
    /// Starting the loop spawns a task, so this must run inside a Tokio
    /// runtime.
    pub fn evaluate(&self, snapshot: &Note) {
        let mut state = self.shared.lock();
        if !state.mounted || state.phase == PollPhase::Stopped {
            return;
        }
        state.snapshot = Some(snapshot.clone());
        self.shared.evaluate_locked(&mut state, snapshot);
    }

    /// One fetch-and-merge step. The schedule calls this; it is public so a
    /// consumer can force an immediate check. At most one check runs at a
    /// time: a call made while another is in flight returns
    /// [`TickOutcome::Discarded`] without fetching.
    pub async fn tick(&self) -> TickOutcome {
        self.shared.tick().await
    }

    pub fn stop(&self) {
        let mut state = self.shared.lock();
        self.shared.stop_locked(&mut state, StopReason::Requested);
    }

    /// The owning view is gone: stop polling and suppress every later write.
    pub fn teardown(&self) {
        let mut state = self.shared.lock();
        if !state.mounted {
            return;
        }
        state.mounted = false;
        tracing::debug!(note_id = %self.shared.note_id, "reconciler torn down");
        self.shared.stop_locked(&mut state, StopReason::Requested);
    }

    pub fn phase(&self) -> PollPhase {
        self.shared.lock().phase
    }

    pub fn is_polling(&self) -> bool {
        self.shared.is_polling()
    }

    pub fn tick_count(&self) -> u64 {
        self.shared.lock().tick_count
    }

    pub fn view(&self) -> ViewState {
        let state = self.shared.lock();
        ViewState {
            phase: state.phase,
            is_polling: state.phase == PollPhase::Polling,
            tick_count: state.tick_count,
            snapshot: state.snapshot.clone(),
            session_ended: state.session_ended,
        }
    }
}

impl Drop for PollingReconciler {
    fn drop(&mut self) {
        self.teardown();
    }
}
