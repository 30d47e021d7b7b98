use std::time::Duration;

use chrono::{DateTime, Utc};

/// What the presentation layer renders next to the editor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveStatus {
    pub is_saving: bool,
    pub has_unsaved_changes: bool,
    pub save_error: Option<String>,
}

/// User-facing notifications. `Retrying` is transient; `Failed` stays until a
/// new edit or a manual save re-arms the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveNotice {
    Saved {
        document_id: String,
        recovered: bool,
    },
    Retrying {
        document_id: String,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    Failed {
        document_id: String,
        reason: String,
    },
    BackupRestored {
        document_id: String,
        saved_at: Option<DateTime<Utc>>,
    },
}

impl SaveNotice {
    pub fn is_persistent(&self) -> bool {
        matches!(self, SaveNotice::Failed { .. })
    }
}
