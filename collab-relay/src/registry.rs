//! Document registry: identifier → (CRDT state, subscribers).
//!
//! ```text
//! DocumentRegistry
//!   ├── "doc1" ── DocumentRoom ── Mutex { DocumentState, {conn#1 → tx, conn#2 → tx} }
//!   └── "doc2" ── DocumentRoom ── Mutex { DocumentState, {conn#3 → tx} }
//! ```
//!
//! Rooms are created lazily and live for the lifetime of the registry.
//! Each subscriber is a bounded outbound queue owned by its connection
//! task. Fan-out never waits on a queue: a full or closed queue is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::document::{DocumentError, DocumentState};
use crate::protocol::{ConnectionId, DocumentId, Frame};

/// Outbound half of a connection, as seen by the registry.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: ConnectionId,
    pub sender: mpsc::Sender<Frame>,
}

impl Subscriber {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<Frame>) -> Self {
        Self { id, sender }
    }
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Recipients whose queue accepted the frame.
    pub delivered: usize,
    /// Recipients skipped because their queue was full or closed.
    pub skipped: usize,
}

/// Result of applying an inbound frame.
#[derive(Debug)]
pub enum RelayOutcome {
    /// Frame merged and fanned out.
    Relayed(BroadcastOutcome),
    /// Frame rejected by the CRDT library; nothing was broadcast.
    Rejected(DocumentError),
}

struct RoomInner {
    state: DocumentState,
    subscribers: HashMap<ConnectionId, mpsc::Sender<Frame>>,
}

/// One document: its merged state plus the connections bound to it.
///
/// State and subscribers share a lock so that snapshot + subscribe and
/// apply + broadcast are each atomic for the document.
pub struct DocumentRoom {
    id: DocumentId,
    inner: Mutex<RoomInner>,
}

impl DocumentRoom {
    fn new(id: DocumentId) -> Self {
        Self {
            id,
            inner: Mutex::new(RoomInner {
                state: DocumentState::new(),
                subscribers: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Add a subscriber and return the full-state snapshot it must receive
    /// before any broadcast frame.
    pub async fn subscribe(&self, subscriber: Subscriber) -> Vec<u8> {
        let mut inner = self.inner.lock().await;
        let snapshot = inner.state.encode_snapshot();
        inner.subscribers.insert(subscriber.id, subscriber.sender);
        snapshot
    }

    /// Remove a subscriber. Returns whether it was present.
    pub async fn unsubscribe(&self, id: ConnectionId) -> bool {
        self.inner.lock().await.subscribers.remove(&id).is_some()
    }

    /// Send `frame` to every subscriber except `exclude`.
    pub async fn broadcast(&self, frame: &Frame, exclude: Option<ConnectionId>) -> BroadcastOutcome {
        let inner = self.inner.lock().await;
        fan_out(&self.id, &inner.subscribers, frame, exclude)
    }

    /// Merge `frame` into the document, then forward it to everyone but `origin`.
    pub async fn apply_and_broadcast(&self, frame: &Frame, origin: ConnectionId) -> RelayOutcome {
        let inner = self.inner.lock().await;
        if let Err(e) = inner.state.apply_update(frame) {
            return RelayOutcome::Rejected(e);
        }
        RelayOutcome::Relayed(fan_out(&self.id, &inner.subscribers, frame, Some(origin)))
    }

    /// Current full-state snapshot.
    pub async fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().await.state.encode_snapshot()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }

    pub async fn has_subscriber(&self, id: ConnectionId) -> bool {
        self.inner.lock().await.subscribers.contains_key(&id)
    }
}

fn fan_out(
    doc_id: &DocumentId,
    subscribers: &HashMap<ConnectionId, mpsc::Sender<Frame>>,
    frame: &Frame,
    exclude: Option<ConnectionId>,
) -> BroadcastOutcome {
    let mut outcome = BroadcastOutcome::default();
    for (id, sender) in subscribers {
        if Some(*id) == exclude {
            continue;
        }
        match sender.try_send(frame.clone()) {
            Ok(()) => outcome.delivered += 1,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Skipping {id} on doc {doc_id}: outbound queue full");
                outcome.skipped += 1;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Skipping {id} on doc {doc_id}: connection closing");
                outcome.skipped += 1;
            }
        }
    }
    outcome
}

/// Process-wide map of documents.
///
/// Constructed once and shared by reference with every connection task.
pub struct DocumentRegistry {
    rooms: RwLock<HashMap<DocumentId, Arc<DocumentRoom>>>,
    next_connection: AtomicU64,
}

impl DocumentRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh connection handle.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the room for `doc_id`, creating an empty document on first use.
    pub async fn get_or_create(&self, doc_id: &DocumentId) -> Arc<DocumentRoom> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(doc_id.clone())
            .or_insert_with(|| {
                log::info!("Created document {doc_id}");
                Arc::new(DocumentRoom::new(doc_id.clone()))
            })
            .clone()
    }

    /// Look up an existing room.
    pub async fn get(&self, doc_id: &DocumentId) -> Option<Arc<DocumentRoom>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Bind `subscriber` to `doc_id` and return the snapshot to send it.
    pub async fn subscribe(&self, doc_id: &DocumentId, subscriber: Subscriber) -> Vec<u8> {
        self.get_or_create(doc_id).await.subscribe(subscriber).await
    }

    /// Unbind a connection. No-op if the document or connection is unknown.
    pub async fn unsubscribe(&self, doc_id: &DocumentId, id: ConnectionId) -> bool {
        match self.get(doc_id).await {
            Some(room) => room.unsubscribe(id).await,
            None => false,
        }
    }

    /// Send `frame` to every connection on `doc_id` except `exclude`.
    pub async fn broadcast(
        &self,
        doc_id: &DocumentId,
        frame: &Frame,
        exclude: Option<ConnectionId>,
    ) -> BroadcastOutcome {
        match self.get(doc_id).await {
            Some(room) => room.broadcast(frame, exclude).await,
            None => BroadcastOutcome::default(),
        }
    }

    pub async fn document_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn document_ids(&self) -> Vec<DocumentId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

impl Default for DocumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
