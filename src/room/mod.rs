pub mod registry;
pub mod session;
pub mod timer;
pub mod tracker;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::models::{
    CursorPos, Identity, JoinedMessage, Role, ServerMessage, StoreError, SubmitError,
    SyncReplyMessage,
};

pub use registry::RoomRegistry;
pub use tracker::ConnectionTracker;

/// What the core holds of a live transport connection: its id, who it is,
/// and the outbound channel back to the client. The transport layer owns
/// the socket itself.
#[derive(Clone)]
pub struct ConnHandle {
    pub conn_id: Uuid,
    pub identity: Identity,
    pub tx: mpsc::Sender<ServerMessage>,
}

/// Timing knobs for a room's persistence scheduler.
#[derive(Debug, Clone, Copy)]
pub struct RoomSettings {
    pub save_debounce: Duration,
    pub snapshot_interval: Duration,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_secs(2),
            snapshot_interval: Duration::from_secs(60),
        }
    }
}

/// Typed commands posted to a room task. All room mutation flows through
/// these; the room task is the single active mutator of its state.
pub enum RoomCommand {
    Join {
        conn: ConnHandle,
        role: Role,
        reply: oneshot::Sender<JoinOutcome>,
    },
    Leave {
        conn_id: Uuid,
    },
    Update {
        conn_id: Uuid,
        update: Vec<u8>,
        client_tag: Option<String>,
        timestamp: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<(), SubmitError>>,
    },
    Sync {
        conn_id: Uuid,
        vector: Option<Vec<u8>>,
        reply: oneshot::Sender<Result<SyncReplyMessage, SubmitError>>,
    },
    Cursor {
        conn_id: Uuid,
        cursor: Option<CursorPos>,
    },
    Typing {
        conn_id: Uuid,
        typing: bool,
    },
    /// Posted by a room's own background write task when its durable save
    /// completes. Never sent by the transport layer.
    SaveFinished(SaveOutcome),
}

/// Outcome of one durable write, reported back to the room that started it.
pub struct SaveOutcome {
    pub version: Result<i64, StoreError>,
    pub snapshotted: bool,
}

/// Reply to a join command.
pub enum JoinOutcome {
    Joined(Box<JoinedMessage>),
    /// The room tore down while the join was queued; the caller re-attaches
    /// through the registry, which spawns a fresh room.
    Retry,
    /// The initial load from the durable store failed.
    Failed(String),
}

#[derive(Debug, Error)]
pub enum JoinRoomError {
    #[error("failed to load document: {0}")]
    Load(String),
}

/// Cheap handle to a live room task.
#[derive(Clone)]
pub struct RoomHandle {
    pub tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}
