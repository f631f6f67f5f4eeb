//! # collab-relay — Real-time collaboration relay for shared notes
//!
//! A WebSocket hub that keeps one CRDT document per identifier and
//! forwards update frames between the editors bound to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ?docId=doc1   ┌──────────────────────────────┐
//! │ Editor A    │ ◄─────────────► │ RelayServer                  │
//! │ (yjs / yrs) │  binary frames  │   │                          │
//! └─────────────┘                 │   ▼                          │
//! ┌─────────────┐                 │ DocumentRegistry             │
//! │ Editor B    │ ◄─────────────► │   ├── doc1: yrs Doc + subs   │
//! │ (yjs / yrs) │                 │   └── doc2: yrs Doc + subs   │
//! └─────────────┘                 └──────────────────────────────┘
//! ```
//!
//! 1. A client connects; the server binds it to a document and sends the
//!    full merged state as one snapshot frame.
//! 2. Each inbound frame is merged into the server copy and forwarded
//!    unchanged to every other client on the same document.
//! 3. CRDT merge handles ordering and duplication, so there is no
//!    sequencing, acknowledgement or retry.
//!
//! ## Modules
//!
//! - [`protocol`] — Identifiers, frames, handshake URI parsing
//! - [`document`] — yrs-backed document state
//! - [`registry`] — Document registry and per-document fan-out
//! - [`server`] — WebSocket relay server
//! - [`validate`] — Pre-decode walk over v1 update frames

pub mod document;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod validate;

pub use document::{DocumentError, DocumentState};
pub use protocol::{ConnectionId, DocumentId, Frame, ProtocolError};
pub use registry::{BroadcastOutcome, DocumentRegistry, DocumentRoom, RelayOutcome, Subscriber};
pub use server::{RelayError, RelayServer, ServerConfig, ServerStats};
