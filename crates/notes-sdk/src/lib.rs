//! Asynchronous client for the notes API.
//!
//! Consumed by the autosave pipeline and the answer-stream session manager.
//! It wraps the REST and streaming endpoints while abstracting bearer token
//! lookup, so callers never reach for ambient credentials.

pub mod token;
pub mod writer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub use token::{EnvToken, StaticToken, TokenProvider};
pub use writer::{DocumentWriter, InMemoryDocumentWriter};

/// The editable fields sent with every document write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentContent {
    pub title: String,
    pub body: String,
}

/// Server acknowledgement of a document write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedDocument {
    pub id: String,
    pub title: String,
    pub body: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum NotesError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid api url: {0}")]
    InvalidUrl(String),
}

#[derive(Clone)]
pub struct NotesClient {
    http: Client,
    base_url: Url,
    token: Arc<dyn TokenProvider>,
}

impl NotesClient {
    pub fn new(base_url: &str, token: Arc<dyn TokenProvider>) -> Result<Self, NotesError> {
        let base_url =
            Url::parse(base_url).map_err(|err| NotesError::InvalidUrl(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(NotesError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `PUT /documents/{id}` with `{title, body}`.
    ///
    /// Any non-2xx answer comes back as [`NotesError::UnexpectedStatus`]; callers
    /// treat every error from here as retryable.
    pub async fn update_document(
        &self,
        id: &str,
        content: &DocumentContent,
    ) -> Result<SavedDocument, NotesError> {
        let url = self.endpoint(&["documents", id])?;
        let res = self
            .http
            .put(url)
            .bearer_auth(self.token.current())
            .json(content)
            .send()
            .await?;

        if res.status().is_success() {
            let saved = res.json::<SavedDocument>().await?;
            debug!(target = "notes_sdk", document_id = %saved.id, "document write acknowledged");
            Ok(saved)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(NotesError::UnexpectedStatus { status, body })
        }
    }

    /// Builds the server-push request for an answer stream. The caller hands it
    /// to an event-source reader; nothing is sent here.
    pub fn answer_stream_request(
        &self,
        question_id: &str,
        question: &str,
    ) -> Result<RequestBuilder, NotesError> {
        let mut url = self.endpoint(&["answers", "stream"])?;
        url.query_pairs_mut()
            .append_pair("questionId", question_id)
            .append_pair("question", question);
        Ok(self
            .http
            .get(url)
            .bearer_auth(self.token.current())
            .header(ACCEPT, "text/event-stream"))
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, NotesError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| NotesError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}
