//! In-memory CRDT state for one document.
//!
//! Thin wrapper over a yrs `Doc`. The relay never edits the document
//! itself; it only merges updates received from clients and encodes the
//! merged state for late joiners.
//!
//! Merge is commutative, associative and idempotent, so updates may be
//! applied in any order and any number of times.

use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::validate::validate_update_v1;

/// Errors from merging or encoding document state.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// Bytes are not a v1-encoded update.
    #[error("Malformed update: {0}")]
    Decode(#[from] yrs::encoding::read::Error),
    /// Update decoded but could not be integrated.
    #[error("Update rejected: {0}")]
    Apply(String),
}

/// Authoritative merged state of one document.
pub struct DocumentState {
    doc: Doc,
}

impl DocumentState {
    /// Create an empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Merge one v1 update into the document.
    ///
    /// The frame is walked by [`validate_update_v1`] before yrs decodes it;
    /// a frame that fails the walk is [`DocumentError::Decode`] and the
    /// document is untouched. Later failures come from yrs itself, and a
    /// panic during integration is reported as [`DocumentError::Apply`].
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        validate_update_v1(update)?;

        let applied = panic::catch_unwind(AssertUnwindSafe(|| -> Result<(), DocumentError> {
            let update = Update::decode_v1(update)?;
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))
        }));

        applied.unwrap_or_else(|_| Err(DocumentError::Apply("update integration panicked".to_string())))
    }

    /// Encode the full merged state as one update (the late-join snapshot).
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// The underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for DocumentState {
    fn default() -> Self {
        Self::new()
    }
}
