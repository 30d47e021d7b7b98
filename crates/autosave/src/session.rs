use std::sync::Arc;

use chrono::Utc;
use notes_sdk::{DocumentContent, DocumentWriter};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::backup::{BackupRecord, BackupStore};
use crate::buffer::{DocumentField, EditableDocument};
use crate::config::AutosaveConfig;
use crate::coordinator::{SaveCoordinator, SaveOutcome, SaveTrigger};
use crate::status::{SaveNotice, SaveStatus};
use crate::timer::Timer;

/// One open document: its buffer, the write-through backup, and the three
/// save triggers (debounce, periodic guard, teardown flush) feeding a single
/// [`SaveCoordinator`].
///
/// Must be created inside a Tokio runtime. Dropping the session cancels every
/// pending timer; call [`DocumentSession::close`] to also flush unsaved edits.
pub struct DocumentSession {
    document_id: String,
    buffer: Arc<Mutex<EditableDocument>>,
    backups: Arc<dyn BackupStore>,
    coordinator: SaveCoordinator,
    debounce: Timer,
    periodic: Timer,
    config: AutosaveConfig,
    restored: Option<BackupRecord>,
    opening_notices: Mutex<Option<broadcast::Receiver<SaveNotice>>>,
}

impl DocumentSession {
    pub fn open(
        doc: EditableDocument,
        writer: Arc<dyn DocumentWriter>,
        backups: Arc<dyn BackupStore>,
        config: AutosaveConfig,
    ) -> Self {
        let document_id = doc.id().to_string();
        let mut doc = doc;
        let restored = restore_backup(&mut doc, backups.as_ref(), &config);

        let buffer = Arc::new(Mutex::new(doc));
        let coordinator =
            SaveCoordinator::new(buffer.clone(), writer, backups.clone(), config.retry);
        let opening_notices = coordinator.notices();

        let periodic = Timer::new("periodic-save");
        {
            let coordinator = coordinator.clone();
            periodic.repeat(config.periodic_interval, move || {
                let coordinator = coordinator.clone();
                async move {
                    coordinator.save(SaveTrigger::Periodic).await;
                }
            });
        }

        if let Some(record) = &restored {
            info!(
                target = "autosave",
                document_id = %document_id,
                backup_ts = record.timestamp,
                "restored unsaved edits from local backup"
            );
            coordinator.notify(SaveNotice::BackupRestored {
                document_id: document_id.clone(),
                saved_at: record.saved_at(),
            });
        }

        Self {
            document_id,
            buffer,
            backups,
            coordinator,
            debounce: Timer::new("debounce-save"),
            periodic,
            config,
            restored,
            opening_notices: Mutex::new(Some(opening_notices)),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// The backup that was restored into the buffer at open time, if any.
    pub fn restored_backup(&self) -> Option<&BackupRecord> {
        self.restored.as_ref()
    }

    pub fn snapshot(&self) -> DocumentContent {
        self.buffer.lock().snapshot()
    }

    pub fn is_dirty(&self) -> bool {
        self.buffer.lock().is_dirty()
    }

    pub fn status(&self) -> watch::Receiver<SaveStatus> {
        self.coordinator.status()
    }

    /// The first call returns a receiver subscribed when the session opened,
    /// so it also carries [`SaveNotice::BackupRestored`]. Later calls only see
    /// notices sent after they subscribe.
    pub fn notices(&self) -> broadcast::Receiver<SaveNotice> {
        self.opening_notices
            .lock()
            .take()
            .unwrap_or_else(|| self.coordinator.notices())
    }

    pub fn coordinator(&self) -> &SaveCoordinator {
        &self.coordinator
    }

    /// Applies an edit, backs it up immediately, and re-arms the debounce.
    pub fn update(&self, field: DocumentField, value: impl Into<String>) {
        {
            // The backup is written under the buffer lock so it always
            // matches the latest edit, even against a completing save.
            let mut buffer = self.buffer.lock();
            buffer.update(field, value);
            let result = if buffer.is_dirty() {
                self.backups.store(&BackupRecord::capture(&buffer))
            } else {
                self.backups.remove(&self.document_id)
            };
            if let Err(err) = result {
                warn!(
                    target = "autosave.backup",
                    document_id = %self.document_id,
                    error = %err,
                    "backup write failed"
                );
            }
        }

        self.coordinator.note_edit();

        let coordinator = self.coordinator.clone();
        self.debounce.schedule(self.config.debounce, async move {
            coordinator.save(SaveTrigger::Debounce).await;
        });
    }

    /// Explicit user save; also re-arms after a terminal failure.
    pub async fn save_now(&self) -> SaveOutcome {
        self.debounce.cancel();
        self.coordinator.save(SaveTrigger::Manual).await
    }

    /// Teardown: cancels every timer, then makes one final save attempt if
    /// anything is still unsaved.
    pub async fn close(self) -> SaveOutcome {
        self.cancel_timers();
        let outcome = self.coordinator.flush().await;
        debug!(
            target = "autosave",
            document_id = %self.document_id,
            outcome = ?outcome,
            "document session closed"
        );
        outcome
    }

    fn cancel_timers(&self) {
        self.debounce.cancel();
        self.periodic.cancel();
        self.coordinator.shutdown();
    }
}

impl Drop for DocumentSession {
    fn drop(&mut self) {
        self.cancel_timers();
    }
}

/// Restores only into an empty, freshly loaded buffer and only from a backup
/// inside the freshness window. Anything else is silently skipped.
fn restore_backup(
    doc: &mut EditableDocument,
    backups: &dyn BackupStore,
    config: &AutosaveConfig,
) -> Option<BackupRecord> {
    if !doc.is_empty() {
        debug!(target = "autosave.backup", document_id = %doc.id(), "buffer populated, restore skipped");
        return None;
    }
    let record = match backups.load(doc.id()) {
        Ok(Some(record)) => record,
        Ok(None) => return None,
        Err(err) => {
            warn!(
                target = "autosave.backup",
                document_id = %doc.id(),
                error = %err,
                "could not read backup"
            );
            return None;
        }
    };
    if !record.is_fresh(Utc::now(), config.backup_max_age) {
        debug!(target = "autosave.backup", document_id = %doc.id(), "backup too old, ignored");
        return None;
    }
    doc.restore(&record.title, &record.body);
    Some(record)
}
