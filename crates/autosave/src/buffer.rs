use notes_sdk::DocumentContent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentField {
    Title,
    Body,
}

/// Live in-memory state of one open document.
///
/// Dirtiness is measured against the last snapshot the server acknowledged,
/// never against whatever the server currently holds, so concurrent external
/// updates do not flip the flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditableDocument {
    id: String,
    current: DocumentContent,
    acknowledged: DocumentContent,
}

impl EditableDocument {
    pub fn new(id: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        let content = DocumentContent {
            title: title.into(),
            body: body.into(),
        };
        Self {
            id: id.into(),
            acknowledged: content.clone(),
            current: content,
        }
    }

    /// Replaces the buffer and treats the loaded content as acknowledged.
    pub fn load(&mut self, doc: EditableDocument) {
        self.id = doc.id;
        self.acknowledged = doc.current.clone();
        self.current = doc.current;
    }

    pub fn update(&mut self, field: DocumentField, value: impl Into<String>) {
        match field {
            DocumentField::Title => self.current.title = value.into(),
            DocumentField::Body => self.current.body = value.into(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.current.title != self.acknowledged.title || self.current.body != self.acknowledged.body
    }

    /// Empty means no body text; a default title alone still counts as empty.
    pub fn is_empty(&self) -> bool {
        self.current.body.is_empty()
    }

    pub fn snapshot(&self) -> DocumentContent {
        self.current.clone()
    }

    /// Marks `snapshot` (the content that was actually written) as saved.
    /// Edits made after that snapshot was taken remain dirty.
    pub fn acknowledge(&mut self, snapshot: DocumentContent) {
        self.acknowledged = snapshot;
    }

    /// Puts recovered text into the live fields without acknowledging it.
    pub fn restore(&mut self, title: &str, body: &str) {
        self.current.title = title.to_string();
        self.current.body = body.to_string();
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.current.title
    }

    pub fn body(&self) -> &str {
        &self.current.body
    }
}
