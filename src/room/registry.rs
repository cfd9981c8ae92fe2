use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use super::session::Room;
use super::{ConnHandle, JoinOutcome, JoinRoomError, RoomCommand, RoomHandle, RoomSettings};
use crate::models::{JoinedMessage, Role};
use crate::store::DocumentStore;

/// Owns the document id → room map and is the only component that creates
/// or deletes rooms. The map lock guards insert/lookup/remove only; document
/// loads and flushes happen inside the room tasks.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<Uuid, RoomHandle>>,
    store: Arc<dyn DocumentStore>,
    settings: RoomSettings,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, settings: RoomSettings) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            store,
            settings,
        })
    }

    /// Attach a connection to the document's room, creating the room on
    /// first join. Create-or-attach is atomic: two simultaneous first
    /// joiners race on the map lock and the loser attaches to the winner's
    /// room. A join that lands on a room mid-teardown is retried against a
    /// freshly spawned room, which reloads the just-flushed state.
    pub async fn join(
        self: &Arc<Self>,
        conn: ConnHandle,
        role: Role,
        document_id: Uuid,
    ) -> Result<(Box<JoinedMessage>, RoomHandle), JoinRoomError> {
        loop {
            let handle = self.get_or_spawn(document_id);
            let (reply_tx, reply_rx) = oneshot::channel();
            let cmd = RoomCommand::Join {
                conn: conn.clone(),
                role,
                reply: reply_tx,
            };

            if handle.tx.send(cmd).await.is_err() {
                // Room task already gone; clear the stale handle and retry
                self.remove_if_same(document_id, &handle);
                continue;
            }

            match reply_rx.await {
                Ok(JoinOutcome::Joined(joined)) => return Ok((joined, handle)),
                Ok(JoinOutcome::Failed(e)) => return Err(JoinRoomError::Load(e)),
                Ok(JoinOutcome::Retry) | Err(_) => {
                    self.remove_if_same(document_id, &handle);
                    continue;
                }
            }
        }
    }

    fn get_or_spawn(self: &Arc<Self>, document_id: Uuid) -> RoomHandle {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(handle) = rooms.get(&document_id) {
            return handle.clone();
        }

        info!("Creating room for document {}", document_id);
        let (tx, rx) = mpsc::channel(256);
        let handle = RoomHandle { tx };
        rooms.insert(document_id, handle.clone());

        let room = Room::new(
            document_id,
            handle.clone(),
            Arc::clone(self),
            Arc::clone(&self.store),
            self.settings,
        );
        tokio::spawn(room.run(rx));
        handle
    }

    /// Remove the registry entry, but only if it still refers to `handle`;
    /// a replacement room spawned in the meantime is left alone.
    pub(crate) fn remove_if_same(&self, document_id: Uuid, handle: &RoomHandle) {
        let mut rooms = self.rooms.lock().unwrap();
        if let Some(current) = rooms.get(&document_id) {
            if current.same_room(handle) {
                rooms.remove(&document_id);
            }
        }
    }

    pub fn is_resident(&self, document_id: Uuid) -> bool {
        self.rooms.lock().unwrap().contains_key(&document_id)
    }

    pub fn resident_count(&self) -> usize {
        self.rooms.lock().unwrap().len()
    }
}
