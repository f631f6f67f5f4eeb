//! Relay wire conventions: identifiers, frames, and handshake parsing.
//!
//! The relay has no envelope of its own. Every WebSocket binary message is
//! one opaque yrs v1 update and is forwarded byte-for-byte:
//! ```text
//! ┌───────────────────────────────┐
//! │ yrs update (v1 encoding)      │
//! │ variable, never inspected     │
//! └───────────────────────────────┘
//! ```
//!
//! The only structured input is the upgrade request URI, which names the
//! document the connection binds to:
//! ```text
//! ws://host:1234/?docId=notes-42   → "notes-42"   (query parameter)
//! ws://host:1234/notes-42          → "notes-42"   (y-websocket room path)
//! ws://host:1234/                  → "default"    (configured fallback)
//! ```

use std::fmt;

use bytes::Bytes;
use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::Uri;

/// Query parameter carrying the document identifier.
pub const DOC_ID_PARAM: &str = "docId";

/// Document bound when the upgrade URI names none.
pub const DEFAULT_DOCUMENT_ID: &str = "default";

/// One opaque update frame. Cheap to clone for fan-out.
pub type Frame = Bytes;

/// String key routing connections to a shared document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Stable handle for one live WebSocket session.
///
/// Subscriber maps are keyed by this value, never by socket identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Document identifier is empty")]
    EmptyDocumentId,
}

/// Resolve the document a connection binds to from its upgrade URI.
///
/// Tries the `docId` query parameter, then the last path segment, then
/// `fallback`. Never fails: every identifier is a valid document.
pub fn resolve_document_id(uri: Option<&Uri>, fallback: &DocumentId) -> DocumentId {
    match uri.map(document_id_from_uri) {
        Some(Ok(id)) => id,
        Some(Err(e)) => {
            log::debug!("No document id in upgrade URI ({e}), using {fallback}");
            fallback.clone()
        }
        None => fallback.clone(),
    }
}

/// Extract an explicit document identifier from an upgrade URI.
pub fn document_id_from_uri(uri: &Uri) -> Result<DocumentId, ProtocolError> {
    if let Some(query) = uri.query() {
        let from_query = form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == DOC_ID_PARAM)
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty());
        if let Some(id) = from_query {
            return Ok(DocumentId::new(id));
        }
    }

    let segment = uri
        .path()
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .ok_or(ProtocolError::EmptyDocumentId)?;

    let decoded = percent_decode_str(segment).decode_utf8_lossy().into_owned();

    if decoded.is_empty() {
        Err(ProtocolError::EmptyDocumentId)
    } else {
        Ok(DocumentId::new(decoded))
    }
}
