use std::sync::Arc;
use std::time::Duration;

use notes_sdk::{DocumentContent, DocumentWriter, NotesError, SavedDocument};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::backup::{BackupRecord, BackupStore};
use crate::buffer::EditableDocument;
use crate::config::RetryPolicy;
use crate::status::{SaveNotice, SaveStatus};
use crate::timer::Timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePhase {
    Idle,
    Saving,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveAttempt {
    pub phase: SavePhase,
    pub retry_count: u32,
    pub in_flight: bool,
}

impl Default for SaveAttempt {
    fn default() -> Self {
        Self {
            phase: SavePhase::Idle,
            retry_count: 0,
            in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    Debounce,
    Periodic,
    Retry,
    Manual,
    Teardown,
}

impl SaveTrigger {
    /// Automatic triggers stay quiet once the retry budget is exhausted.
    pub fn is_automatic(self) -> bool {
        matches!(
            self,
            SaveTrigger::Debounce | SaveTrigger::Periodic | SaveTrigger::Retry
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Clean,
    InFlight,
    Errored,
    ShutDown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(SavedDocument),
    Skipped(SkipReason),
    RetryScheduled { attempt: u32, delay: Duration },
    Failed(String),
}

struct CoordinatorState {
    attempt: SaveAttempt,
    save_error: Option<String>,
    shut_down: bool,
}

struct Inner {
    document_id: String,
    buffer: Arc<Mutex<EditableDocument>>,
    writer: Arc<dyn DocumentWriter>,
    backups: Arc<dyn BackupStore>,
    policy: RetryPolicy,
    state: Mutex<CoordinatorState>,
    retry_timer: Timer,
    status: watch::Sender<SaveStatus>,
    in_flight: watch::Sender<bool>,
    notices: broadcast::Sender<SaveNotice>,
}

/// Performs remote writes for one document.
///
/// Every trigger (debounce, periodic guard, backoff retry, manual, teardown)
/// goes through the same instance, so there is one in-flight flag and one
/// retry counter per document. At most one write is outstanding at a time.
#[derive(Clone)]
pub struct SaveCoordinator {
    inner: Arc<Inner>,
}

impl SaveCoordinator {
    pub fn new(
        buffer: Arc<Mutex<EditableDocument>>,
        writer: Arc<dyn DocumentWriter>,
        backups: Arc<dyn BackupStore>,
        policy: RetryPolicy,
    ) -> Self {
        let document_id = buffer.lock().id().to_string();
        let (status, _) = watch::channel(SaveStatus::default());
        let (in_flight, _) = watch::channel(false);
        let (notices, _) = broadcast::channel(32);
        let coordinator = Self {
            inner: Arc::new(Inner {
                document_id,
                buffer,
                writer,
                backups,
                policy,
                state: Mutex::new(CoordinatorState {
                    attempt: SaveAttempt::default(),
                    save_error: None,
                    shut_down: false,
                }),
                retry_timer: Timer::new("save-retry"),
                status,
                in_flight,
                notices,
            }),
        };
        coordinator.publish_status();
        coordinator
    }

    pub fn document_id(&self) -> &str {
        &self.inner.document_id
    }

    pub fn attempt(&self) -> SaveAttempt {
        self.inner.state.lock().attempt.clone()
    }

    pub fn status(&self) -> watch::Receiver<SaveStatus> {
        self.inner.status.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<SaveNotice> {
        self.inner.notices.subscribe()
    }

    pub fn retry_pending(&self) -> bool {
        self.inner.retry_timer.is_pending()
    }

    /// Attempts one remote write of the buffer as it is right now.
    pub async fn save(&self, trigger: SaveTrigger) -> SaveOutcome {
        let snapshot = match self.begin(trigger) {
            Ok(snapshot) => snapshot,
            Err(reason) => {
                debug!(
                    target = "autosave",
                    document_id = %self.inner.document_id,
                    trigger = ?trigger,
                    reason = ?reason,
                    "save skipped"
                );
                return SaveOutcome::Skipped(reason);
            }
        };

        self.inner.retry_timer.cancel();
        self.publish_status();
        debug!(
            target = "autosave",
            document_id = %self.inner.document_id,
            trigger = ?trigger,
            "save started"
        );

        let mut guard = InFlightGuard {
            coordinator: self,
            settled: false,
        };
        let result = self
            .inner
            .writer
            .write_document(&self.inner.document_id, &snapshot)
            .await;

        let outcome = match result {
            Ok(saved) => self.complete(trigger, snapshot, saved),
            Err(err) => self.fail(trigger, err),
        };
        guard.settled = true;
        drop(guard);
        outcome
    }

    /// Teardown flush: waits out any save already in flight, then makes one
    /// final attempt without scheduling retries.
    pub async fn flush(&self) -> SaveOutcome {
        loop {
            self.wait_idle().await;
            match self.save(SaveTrigger::Teardown).await {
                SaveOutcome::Skipped(SkipReason::InFlight) => continue,
                outcome => return outcome,
            }
        }
    }

    pub async fn wait_idle(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    /// A new edit re-arms a coordinator that gave up.
    pub fn note_edit(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.attempt.phase == SavePhase::Error {
                state.attempt.phase = SavePhase::Idle;
                state.attempt.retry_count = 0;
                state.save_error = None;
            }
        }
        self.publish_status();
    }

    pub fn notify(&self, notice: SaveNotice) {
        let _ = self.inner.notices.send(notice);
    }

    /// Stops backoff and refuses every trigger except teardown.
    pub fn shutdown(&self) {
        self.inner.state.lock().shut_down = true;
        self.inner.retry_timer.cancel();
    }

    pub fn publish_status(&self) {
        let status = {
            let state = self.inner.state.lock();
            let dirty = self.inner.buffer.lock().is_dirty();
            SaveStatus {
                is_saving: state.attempt.phase == SavePhase::Saving,
                has_unsaved_changes: dirty,
                save_error: state.save_error.clone(),
            }
        };
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn begin(&self, trigger: SaveTrigger) -> Result<DocumentContent, SkipReason> {
        let mut state = self.inner.state.lock();
        if state.attempt.in_flight {
            return Err(SkipReason::InFlight);
        }
        if state.shut_down && trigger != SaveTrigger::Teardown {
            return Err(SkipReason::ShutDown);
        }
        if trigger == SaveTrigger::Manual && state.attempt.phase == SavePhase::Error {
            state.attempt.phase = SavePhase::Idle;
            state.attempt.retry_count = 0;
            state.save_error = None;
        }
        if state.attempt.phase == SavePhase::Error && trigger.is_automatic() {
            return Err(SkipReason::Errored);
        }

        let snapshot = {
            let buffer = self.inner.buffer.lock();
            if !buffer.is_dirty() {
                return Err(SkipReason::Clean);
            }
            buffer.snapshot()
        };
        state.attempt.in_flight = true;
        state.attempt.phase = SavePhase::Saving;
        self.inner.in_flight.send_replace(true);
        Ok(snapshot)
    }

    fn complete(
        &self,
        trigger: SaveTrigger,
        snapshot: DocumentContent,
        saved: SavedDocument,
    ) -> SaveOutcome {
        let id = &self.inner.document_id;
        {
            // Held across the backup write so a concurrent edit cannot slip
            // its backup in between and lose it to the clear.
            let mut buffer = self.inner.buffer.lock();
            buffer.acknowledge(snapshot);
            if buffer.is_dirty() {
                // Edits landed while the write was in flight; keep them crash-safe.
                if let Err(err) = self.inner.backups.store(&BackupRecord::capture(&buffer)) {
                    warn!(target = "autosave.backup", document_id = %id, error = %err, "failed to rewrite backup");
                }
            } else if let Err(err) = self.inner.backups.remove(id) {
                warn!(target = "autosave.backup", document_id = %id, error = %err, "failed to clear backup");
            }
        }

        let recovered = {
            let mut state = self.inner.state.lock();
            let recovered = state.attempt.retry_count > 0;
            state.attempt = SaveAttempt::default();
            state.save_error = None;
            recovered
        };

        info!(
            target = "autosave",
            document_id = %id,
            trigger = ?trigger,
            recovered,
            "document saved"
        );
        if recovered || trigger == SaveTrigger::Manual {
            let _ = self.inner.notices.send(SaveNotice::Saved {
                document_id: id.clone(),
                recovered,
            });
        }
        SaveOutcome::Saved(saved)
    }

    fn fail(&self, trigger: SaveTrigger, err: NotesError) -> SaveOutcome {
        let id = self.inner.document_id.clone();
        let reason = err.to_string();

        let (retry_count, give_up) = {
            let mut state = self.inner.state.lock();
            state.attempt.in_flight = false;
            state.attempt.retry_count += 1;
            let retry_count = state.attempt.retry_count;
            let give_up = trigger == SaveTrigger::Teardown
                || state.shut_down
                || !self.inner.policy.allows(retry_count);
            if give_up {
                state.attempt.phase = SavePhase::Error;
                state.save_error = Some(reason.clone());
            }
            (retry_count, give_up)
        };

        if give_up {
            warn!(
                target = "autosave",
                document_id = %id,
                trigger = ?trigger,
                attempts = retry_count,
                error = %reason,
                "save failed, giving up"
            );
            let _ = self.inner.notices.send(SaveNotice::Failed {
                document_id: id,
                reason: reason.clone(),
            });
            return SaveOutcome::Failed(reason);
        }

        let delay = self.inner.policy.delay_for(retry_count);
        warn!(
            target = "autosave",
            document_id = %id,
            trigger = ?trigger,
            attempt = retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "save failed, retrying"
        );
        let _ = self.inner.notices.send(SaveNotice::Retrying {
            document_id: id,
            attempt: retry_count,
            delay,
            reason,
        });
        self.schedule_retry(delay);
        SaveOutcome::RetryScheduled {
            attempt: retry_count,
            delay,
        }
    }

    fn schedule_retry(&self, delay: Duration) {
        let coordinator = self.clone();
        self.inner.retry_timer.schedule(delay, async move {
            coordinator.save(SaveTrigger::Retry).await;
        });
    }
}

/// Releases the in-flight flag when a save ends, including when the save
/// future is dropped while the write is still pending.
struct InFlightGuard<'a> {
    coordinator: &'a SaveCoordinator,
    settled: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let inner = &self.coordinator.inner;
        if !self.settled {
            {
                let mut state = inner.state.lock();
                state.attempt.in_flight = false;
                if state.attempt.phase == SavePhase::Saving {
                    state.attempt.phase = SavePhase::Idle;
                }
            }
            debug!(
                target = "autosave",
                document_id = %inner.document_id,
                "save cancelled before the write finished"
            );
        }
        inner.in_flight.send_replace(false);
        self.coordinator.publish_status();
    }
}
