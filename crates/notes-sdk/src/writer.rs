use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::{DocumentContent, NotesClient, NotesError, SavedDocument};

/// Remote write seam used by the save coordinator.
#[async_trait]
pub trait DocumentWriter: Send + Sync {
    async fn write_document(
        &self,
        id: &str,
        content: &DocumentContent,
    ) -> Result<SavedDocument, NotesError>;
}

#[async_trait]
impl DocumentWriter for NotesClient {
    async fn write_document(
        &self,
        id: &str,
        content: &DocumentContent,
    ) -> Result<SavedDocument, NotesError> {
        self.update_document(id, content).await
    }
}

/// In-memory adapter for tests and offline wiring.
///
/// Records every write it receives, can be told to fail the next N writes
/// with a 500, and can hold each write for a fixed latency so tests can
/// observe a save while it is in flight.
#[derive(Default)]
pub struct InMemoryDocumentWriter {
    writes: Mutex<Vec<(String, DocumentContent)>>,
    failures_left: Mutex<usize>,
    latency: Mutex<Duration>,
}

impl InMemoryDocumentWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, count: usize) {
        *self.failures_left.lock() = count;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Every write attempt in arrival order, failed ones included.
    pub fn writes(&self) -> Vec<(String, DocumentContent)> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn last_write(&self) -> Option<(String, DocumentContent)> {
        self.writes.lock().last().cloned()
    }
}

#[async_trait]
impl DocumentWriter for InMemoryDocumentWriter {
    async fn write_document(
        &self,
        id: &str,
        content: &DocumentContent,
    ) -> Result<SavedDocument, NotesError> {
        self.writes.lock().push((id.to_string(), content.clone()));

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let fail = {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                true
            } else {
                false
            }
        };
        if fail {
            return Err(NotesError::UnexpectedStatus {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "simulated failure".into(),
            });
        }

        Ok(SavedDocument {
            id: id.to_string(),
            title: content.title.clone(),
            body: content.body.clone(),
            updated_at: Utc::now(),
        })
    }
}
