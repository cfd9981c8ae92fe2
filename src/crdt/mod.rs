use loro::{ExportMode, LoroDoc, VersionVector};
use std::borrow::Cow;

use crate::models::ApplyError;

/// Adapter over the CRDT engine. The engine's merge is commutative,
/// associative, and idempotent; this wrapper never inspects or reorders
/// update payloads, it only moves opaque bytes in and out.
pub struct CrdtState {
    doc: LoroDoc,
}

impl CrdtState {
    /// An empty document state.
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// Reconstruct state from a previously encoded snapshot.
    pub fn from_encoded(snapshot: &[u8]) -> Result<Self, ApplyError> {
        let state = Self::new();
        state.apply_update(snapshot)?;
        Ok(state)
    }

    /// Merge a binary update into the authoritative state. Malformed input
    /// is rejected whole; the engine never partially applies it.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), ApplyError> {
        self.doc
            .import(update)
            .map(|_| ())
            .map_err(|e| ApplyError(e.to_string()))
    }

    /// Full encoded state, suitable for persistence and for joining clients.
    pub fn encode_state(&self) -> Vec<u8> {
        // Snapshot export of an importable doc cannot fail
        self.doc
            .export(ExportMode::Snapshot)
            .unwrap_or_default()
    }

    /// Compact summary of which updates this state has incorporated.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// The delta a replica at `vector` is missing.
    pub fn diff_since(&self, vector: &[u8]) -> Result<Vec<u8>, ApplyError> {
        let vv = VersionVector::decode(vector).map_err(|e| ApplyError(e.to_string()))?;
        self.doc
            .export(ExportMode::Updates { from: Cow::Owned(vv) })
            .map_err(|e| ApplyError(e.to_string()))
    }
}

impl Default for CrdtState {
    fn default() -> Self {
        Self::new()
    }
}
