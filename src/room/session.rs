use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::timer::FireOnce;
use super::{
    ConnHandle, JoinOutcome, RoomCommand, RoomHandle, RoomRegistry, RoomSettings, SaveOutcome,
};
use crate::crdt::CrdtState;
use crate::models::{
    BroadcastUpdateMessage, DocumentInfo, DocumentSavedMessage, Identity, JoinedMessage,
    PermissionError, PresenceCursorMessage, PresenceTypingMessage, RoomMember, ServerMessage,
    SubmitError, SyncReplyMessage,
};
use crate::store::DocumentStore;

struct ConnEntry {
    user_id: String,
    tx: mpsc::Sender<ServerMessage>,
}

enum Flow {
    Continue,
    /// Roster went empty: flush, deregister, drain, exit.
    Teardown,
}

/// The in-memory collaboration context for one document. The room task is
/// the single active mutator of everything in here: authoritative CRDT
/// state, roster, and save scheduling all change only while it processes
/// one command at a time.
pub struct Room {
    document_id: Uuid,
    handle: RoomHandle,
    registry: Arc<RoomRegistry>,
    store: Arc<dyn DocumentStore>,
    settings: RoomSettings,
    state: CrdtState,
    info: DocumentInfo,
    roster: HashMap<String, RoomMember>,
    conns: HashMap<Uuid, ConnEntry>,
    dirty: bool,
    save_in_flight: bool,
    last_editor: Option<String>,
    last_snapshot: Instant,
    save_timer: FireOnce,
}

impl Room {
    pub(super) fn new(
        document_id: Uuid,
        handle: RoomHandle,
        registry: Arc<RoomRegistry>,
        store: Arc<dyn DocumentStore>,
        settings: RoomSettings,
    ) -> Self {
        Self {
            document_id,
            handle,
            registry,
            store,
            settings,
            state: CrdtState::new(),
            info: DocumentInfo {
                id: document_id,
                title: "Untitled".to_string(),
                version: 0,
            },
            roster: HashMap::new(),
            conns: HashMap::new(),
            dirty: false,
            save_in_flight: false,
            last_editor: None,
            last_snapshot: Instant::now(),
            save_timer: FireOnce::new(),
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        // Initial load happens here, after registry insertion but before any
        // command is serviced: concurrent first joiners queue behind it
        // instead of racing it, and the registry lock is long released.
        match self.store.load_document(self.document_id).await {
            Ok(Some(doc)) => {
                let state = if doc.state.is_empty() {
                    Ok(CrdtState::new())
                } else {
                    CrdtState::from_encoded(&doc.state)
                };
                match state {
                    Ok(state) => {
                        info!(
                            "Loaded document {} at version {} ({} bytes)",
                            self.document_id,
                            doc.version,
                            doc.state.len()
                        );
                        self.state = state;
                        self.info.title = doc.title;
                        self.info.version = doc.version;
                    }
                    Err(e) => {
                        error!("Stored state for document {} is corrupt: {}", self.document_id, e);
                        self.abandon(rx, format!("corrupt stored state: {}", e)).await;
                        return;
                    }
                }
            }
            Ok(None) => {
                info!("Document {} has no stored state; starting empty", self.document_id);
            }
            Err(e) => {
                error!("Failed to load document {}: {}", self.document_id, e);
                self.abandon(rx, e.to_string()).await;
                return;
            }
        }
        self.last_snapshot = Instant::now();

        loop {
            let cmd = if let Some(deadline) = self.save_timer.deadline() {
                tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = tokio::time::sleep_until(deadline) => {
                        self.save_timer.cancel();
                        self.begin_save();
                        continue;
                    }
                }
            } else {
                rx.recv().await
            };

            match cmd {
                Some(cmd) => {
                    if let Flow::Teardown = self.handle(cmd) {
                        self.teardown(rx).await;
                        return;
                    }
                }
                // Every handle is gone; nothing can reach this room anymore.
                None => {
                    self.teardown(rx).await;
                    return;
                }
            }
        }
    }

    fn handle(&mut self, cmd: RoomCommand) -> Flow {
        match cmd {
            RoomCommand::Join { conn, role, reply } => {
                self.handle_join(conn, role, reply);
                Flow::Continue
            }
            RoomCommand::Leave { conn_id } => self.handle_leave(conn_id),
            RoomCommand::Update {
                conn_id,
                update,
                client_tag,
                timestamp,
                reply,
            } => {
                match self.apply_submission(conn_id, &update) {
                    Ok(identity) => {
                        self.dirty = true;
                        self.last_editor = Some(identity.user_id.clone());
                        self.save_timer.arm(self.settings.save_debounce);

                        // The submitter already holds the post-edit state;
                        // everyone else gets the same bytes, tagged.
                        let msg = ServerMessage::Update(BroadcastUpdateMessage {
                            document_id: self.document_id,
                            update,
                            client_tag,
                            timestamp: timestamp.unwrap_or_else(Utc::now),
                            identity,
                        });
                        self.broadcast(&msg, Some(conn_id));
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                Flow::Continue
            }
            RoomCommand::Sync {
                conn_id,
                vector,
                reply,
            } => {
                let result = if self.conns.contains_key(&conn_id) {
                    // Always the current in-memory state, never the last
                    // durable write: a reconnecting client converges with
                    // updates that have not been flushed yet.
                    let state = match vector {
                        Some(v) => self.state.diff_since(&v).map_err(SubmitError::from),
                        None => Ok(self.state.encode_state()),
                    };
                    state.map(|state| SyncReplyMessage {
                        state,
                        version: self.info.version,
                    })
                } else {
                    Err(SubmitError::NotInRoom)
                };
                let _ = reply.send(result);
                Flow::Continue
            }
            RoomCommand::Cursor { conn_id, cursor } => {
                if let Some(user_id) = self.conns.get(&conn_id).map(|e| e.user_id.clone()) {
                    if let Some(member) = self.roster.get_mut(&user_id) {
                        member.cursor = cursor;
                        let msg = ServerMessage::Cursor(PresenceCursorMessage {
                            document_id: self.document_id,
                            user_id,
                            cursor,
                            display_name: member.identity.display_name.clone(),
                            color: member.identity.color.clone(),
                        });
                        self.broadcast(&msg, Some(conn_id));
                    }
                }
                Flow::Continue
            }
            RoomCommand::Typing { conn_id, typing } => {
                if let Some(user_id) = self.conns.get(&conn_id).map(|e| e.user_id.clone()) {
                    if let Some(member) = self.roster.get_mut(&user_id) {
                        member.typing = typing;
                        let msg = ServerMessage::Typing(PresenceTypingMessage {
                            document_id: self.document_id,
                            user_id,
                            typing,
                        });
                        self.broadcast(&msg, Some(conn_id));
                    }
                }
                Flow::Continue
            }
            RoomCommand::SaveFinished(outcome) => {
                self.finish_save(outcome);
                Flow::Continue
            }
        }
    }

    fn handle_join(
        &mut self,
        conn: ConnHandle,
        role: crate::models::Role,
        reply: tokio::sync::oneshot::Sender<JoinOutcome>,
    ) {
        let user_id = conn.identity.user_id.clone();
        let is_new = !self.roster.contains_key(&user_id);

        let member = self
            .roster
            .entry(user_id.clone())
            .or_insert_with(|| RoomMember::new(conn.identity.clone(), role, conn.conn_id));
        if !is_new {
            // Second tab or device of an already present identity: merge
            // into the one roster entry, refreshing the cached grant.
            member.connections.insert(conn.conn_id);
            member.role = role;
        }
        let snapshot = member.snapshot();

        self.conns.insert(
            conn.conn_id,
            ConnEntry {
                user_id: user_id.clone(),
                tx: conn.tx.clone(),
            },
        );

        info!(
            "{} joined document {} (connection {})",
            user_id, self.document_id, conn.conn_id
        );

        let joined = JoinedMessage {
            document: self.info.clone(),
            state: self.state.encode_state(),
            members: self.roster.values().map(RoomMember::snapshot).collect(),
            role,
        };
        let _ = reply.send(JoinOutcome::Joined(Box::new(joined)));

        if is_new {
            self.broadcast(
                &ServerMessage::MemberJoined { member: snapshot },
                Some(conn.conn_id),
            );
        }
    }

    fn handle_leave(&mut self, conn_id: Uuid) -> Flow {
        let Some(entry) = self.conns.remove(&conn_id) else {
            // Already left; every disconnect path converges here once.
            return Flow::Continue;
        };

        let mut member_gone = false;
        if let Some(member) = self.roster.get_mut(&entry.user_id) {
            member.connections.remove(&conn_id);
            if member.connections.is_empty() {
                self.roster.remove(&entry.user_id);
                member_gone = true;
            }
        }

        if member_gone {
            info!("{} left document {}", entry.user_id, self.document_id);
            self.broadcast(
                &ServerMessage::MemberLeft {
                    user_id: entry.user_id,
                },
                None,
            );
        }

        if self.roster.is_empty() {
            Flow::Teardown
        } else {
            Flow::Continue
        }
    }

    fn apply_submission(&self, conn_id: Uuid, update: &[u8]) -> Result<Identity, SubmitError> {
        let entry = self.conns.get(&conn_id).ok_or(SubmitError::NotInRoom)?;
        let member = self
            .roster
            .get(&entry.user_id)
            .ok_or(SubmitError::NotInRoom)?;
        if !member.role.can_edit() {
            return Err(PermissionError.into());
        }
        self.state.apply_update(update)?;
        Ok(member.identity.clone())
    }

    /// Best-effort fan-out to every connection except `exclude`. A channel
    /// that is full or mid-disconnect simply misses the message; the client
    /// recovers via resync on reconnect.
    fn broadcast(&self, msg: &ServerMessage, exclude: Option<Uuid>) {
        for (conn_id, entry) in &self.conns {
            if Some(*conn_id) == exclude {
                continue;
            }
            let _ = entry.tx.try_send(msg.clone());
        }
    }

    /// The debounce window elapsed: hand the encoded state to a background
    /// write task and keep servicing commands. Concurrent edits must keep
    /// fanning out while the store call is in flight.
    fn begin_save(&mut self) {
        if !self.dirty || self.save_in_flight {
            // An in-flight write re-arms the window when it reports back.
            return;
        }
        self.dirty = false;
        self.save_in_flight = true;

        let store = Arc::clone(&self.store);
        let document_id = self.document_id;
        let encoded = self.state.encode_state();
        let saved_by = self
            .last_editor
            .clone()
            .unwrap_or_else(|| "system".to_string());
        let snapshot_due = self.last_snapshot.elapsed() >= self.settings.snapshot_interval;
        let tx = self.handle.tx.clone();
        tokio::spawn(async move {
            let outcome = Self::write(&*store, document_id, &encoded, &saved_by, snapshot_due).await;
            // A closed channel means the room already tore down.
            let _ = tx.send(RoomCommand::SaveFinished(outcome)).await;
        });
    }

    fn finish_save(&mut self, outcome: SaveOutcome) {
        self.save_in_flight = false;
        match outcome.version {
            Ok(version) => {
                self.info.version = version;
                if outcome.snapshotted {
                    self.last_snapshot = Instant::now();
                }
                self.broadcast(
                    &ServerMessage::DocumentSaved(DocumentSavedMessage {
                        saved_at: Utc::now(),
                        version,
                    }),
                    None,
                );
            }
            Err(e) => {
                // Not surfaced to clients: the in-memory state stays
                // correct and editable. Retried on the next trigger.
                error!(
                    "Deferred save failed for document {}: {}",
                    self.document_id, e
                );
                self.dirty = true;
            }
        }
        // Edits that arrived during the write, or a failed write, open a
        // fresh window.
        if self.dirty {
            self.save_timer.arm(self.settings.save_debounce);
        }
    }

    /// One durable write: state, operation record, and a snapshot record
    /// when the interval is due. Runs off the room task for debounced saves
    /// and on it for the teardown flush.
    async fn write(
        store: &dyn DocumentStore,
        document_id: Uuid,
        encoded: &[u8],
        saved_by: &str,
        snapshot_due: bool,
    ) -> SaveOutcome {
        let version = match store.save_state(document_id, encoded, saved_by).await {
            Ok(version) => version,
            Err(e) => {
                return SaveOutcome {
                    version: Err(e),
                    snapshotted: false,
                }
            }
        };
        info!(
            "Saved document {} at version {} ({} bytes)",
            document_id,
            version,
            encoded.len()
        );

        if let Err(e) = store
            .append_operation_record(document_id, encoded, version, saved_by)
            .await
        {
            error!(
                "Failed to append operation record for document {}: {}",
                document_id, e
            );
        }

        let mut snapshotted = false;
        if snapshot_due {
            match store.append_snapshot_record(document_id, encoded, version).await {
                Ok(()) => snapshotted = true,
                Err(e) => error!(
                    "Failed to append snapshot record for document {}: {}",
                    document_id, e
                ),
            }
        }

        SaveOutcome {
            version: Ok(version),
            snapshotted,
        }
    }

    /// Roster is empty: flush once, deregister, answer stragglers, exit.
    async fn teardown(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        self.save_timer.cancel();

        // Wait out any background write first so the final flush cannot
        // interleave with it. The write task holds a sender, so recv cannot
        // return None while one is out. Other commands arriving meanwhile
        // are refused after deregistration, same as the drain.
        let mut stragglers = Vec::new();
        while self.save_in_flight {
            match rx.recv().await {
                Some(RoomCommand::SaveFinished(outcome)) => {
                    self.finish_save(outcome);
                    self.save_timer.cancel();
                }
                Some(cmd) => stragglers.push(cmd),
                None => break,
            }
        }

        if self.dirty {
            let saved_by = self
                .last_editor
                .clone()
                .unwrap_or_else(|| "system".to_string());
            let snapshot_due = self.last_snapshot.elapsed() >= self.settings.snapshot_interval;
            let outcome = Self::write(
                &*self.store,
                self.document_id,
                &self.state.encode_state(),
                &saved_by,
                snapshot_due,
            )
            .await;
            if let Err(e) = outcome.version {
                // The previous durable state is at most one debounce window
                // stale; the CRDT engine tolerates re-merging on next load.
                error!(
                    "Final flush failed for document {}: {}",
                    self.document_id, e
                );
            }
        }
        self.registry.remove_if_same(self.document_id, &self.handle);
        rx.close();
        for cmd in stragglers {
            self.refuse(cmd);
        }
        self.drain(&mut rx).await;
        info!("Room for document {} closed", self.document_id);
    }

    /// Initial load failed: deregister and refuse queued commands.
    async fn abandon(self, mut rx: mpsc::Receiver<RoomCommand>, reason: String) {
        self.registry.remove_if_same(self.document_id, &self.handle);
        rx.close();
        while let Some(cmd) = rx.recv().await {
            if let RoomCommand::Join { reply, .. } = cmd {
                let _ = reply.send(JoinOutcome::Failed(reason.clone()));
            }
        }
    }

    async fn drain(&self, rx: &mut mpsc::Receiver<RoomCommand>) {
        rx.close();
        while let Some(cmd) = rx.recv().await {
            self.refuse(cmd);
        }
    }

    fn refuse(&self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join { reply, .. } => {
                // Raced our teardown; the registry re-spawns a fresh
                // room that loads the state we just flushed.
                let _ = reply.send(JoinOutcome::Retry);
            }
            RoomCommand::Update { reply, .. } => {
                let _ = reply.send(Err(SubmitError::NotInRoom));
            }
            RoomCommand::Sync { reply, .. } => {
                let _ = reply.send(Err(SubmitError::NotInRoom));
            }
            RoomCommand::Leave { .. }
            | RoomCommand::Cursor { .. }
            | RoomCommand::Typing { .. }
            | RoomCommand::SaveFinished(_) => {
                warn!(
                    "Dropping stale command for closed room {}",
                    self.document_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, StoreError};
    use crate::store::{MemoryStore, StoredDocument};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    struct TestClient {
        conn: ConnHandle,
        rx: mpsc::Receiver<ServerMessage>,
    }

    fn client(user: &str) -> TestClient {
        let (tx, rx) = mpsc::channel(64);
        TestClient {
            conn: ConnHandle {
                conn_id: Uuid::new_v4(),
                identity: Identity {
                    user_id: user.to_string(),
                    display_name: user.to_string(),
                    color: "#3cb44b".to_string(),
                    avatar: None,
                },
                tx,
            },
            rx,
        }
    }

    fn setup() -> (Arc<MemoryStore>, Arc<RoomRegistry>) {
        let store = Arc::new(MemoryStore::new());
        let registry = RoomRegistry::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            RoomSettings {
                save_debounce: Duration::from_secs(2),
                snapshot_interval: Duration::from_secs(60),
            },
        );
        (store, registry)
    }

    fn text_update(text: &str) -> Vec<u8> {
        let doc = loro::LoroDoc::new();
        doc.get_text("text").insert(0, text).unwrap();
        doc.export(loro::ExportMode::Snapshot).unwrap()
    }

    async fn submit(handle: &RoomHandle, conn_id: Uuid, update: Vec<u8>) -> Result<(), SubmitError> {
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(RoomCommand::Update {
                conn_id,
                update,
                client_tag: None,
                timestamp: None,
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn request_sync(
        handle: &RoomHandle,
        conn_id: Uuid,
    ) -> Result<SyncReplyMessage, SubmitError> {
        let (tx, rx) = oneshot::channel();
        handle
            .tx
            .send(RoomCommand::Sync {
                conn_id,
                vector: None,
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap()
    }

    async fn leave(handle: &RoomHandle, conn_id: Uuid) {
        handle.tx.send(RoomCommand::Leave { conn_id }).await.unwrap();
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..5000 {
            if cond() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    /// Store whose `save_state` blocks until the test releases it, exposing
    /// what the room does while a durable write is in flight.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DocumentStore for GatedStore {
        async fn load_document(
            &self,
            document_id: Uuid,
        ) -> Result<Option<StoredDocument>, StoreError> {
            self.inner.load_document(document_id).await
        }

        async fn save_state(
            &self,
            document_id: Uuid,
            state: &[u8],
            saved_by: &str,
        ) -> Result<i64, StoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.save_state(document_id, state, saved_by).await
        }

        async fn append_operation_record(
            &self,
            document_id: Uuid,
            state: &[u8],
            version: i64,
            saved_by: &str,
        ) -> Result<(), StoreError> {
            self.inner
                .append_operation_record(document_id, state, version, saved_by)
                .await
        }

        async fn append_snapshot_record(
            &self,
            document_id: Uuid,
            state: &[u8],
            version: i64,
        ) -> Result<(), StoreError> {
            self.inner
                .append_snapshot_record(document_id, state, version)
                .await
        }
    }

    fn same_content(a: &[u8], b: &[u8]) -> bool {
        let left = CrdtState::from_encoded(a).unwrap();
        let right = CrdtState::from_encoded(b).unwrap();
        left.encode_state_vector() == right.encode_state_vector()
    }

    #[tokio::test]
    async fn same_identity_twice_is_one_member_with_two_connections() {
        let (_store, registry) = setup();
        let doc = Uuid::new_v4();
        let tab1 = client("alice");
        let mut tab2 = client("alice");
        tab2.conn.identity = tab1.conn.identity.clone();

        registry
            .join(tab1.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        let (joined, _) = registry
            .join(tab2.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();

        assert_eq!(joined.members.len(), 1);
        assert_eq!(joined.members[0].identity.user_id, "alice");
        assert!(joined.members[0].online);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_leave_keeps_member_last_leave_flushes_once() {
        let (store, registry) = setup();
        let doc = Uuid::new_v4();
        let tab1 = client("alice");
        let mut tab2 = client("alice");
        tab2.conn.identity = tab1.conn.identity.clone();
        let mut bob = client("bob");

        let (_, handle) = registry
            .join(tab1.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        registry
            .join(tab2.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        registry
            .join(bob.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();

        submit(&handle, tab1.conn.conn_id, text_update("hello"))
            .await
            .unwrap();

        // First of alice's two tabs closing does not announce a departure
        leave(&handle, tab1.conn.conn_id).await;
        request_sync(&handle, bob.conn.conn_id).await.unwrap();
        assert!(!drain(&mut bob.rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::MemberLeft { .. })));

        // The last tab does
        leave(&handle, tab2.conn.conn_id).await;
        request_sync(&handle, bob.conn.conn_id).await.unwrap();
        assert!(drain(&mut bob.rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::MemberLeft { user_id } if user_id == "alice")));

        // Bob is still here, so nothing was flushed yet
        assert!(registry.is_resident(doc));
        assert_eq!(store.save_count(), 0);

        // Last member out tears the room down with exactly one flush
        leave(&handle, bob.conn.conn_id).await;
        wait_until(|| !registry.is_resident(doc)).await;
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn viewer_updates_are_rejected_without_state_change() {
        let (_store, registry) = setup();
        let doc = Uuid::new_v4();
        let mut alice = client("alice");
        let bob = client("bob");

        let (_, handle) = registry
            .join(alice.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        registry
            .join(bob.conn.clone(), Role::Viewer, doc)
            .await
            .unwrap();
        drain(&mut alice.rx);

        let before = request_sync(&handle, alice.conn.conn_id).await.unwrap();
        let err = submit(&handle, bob.conn.conn_id, text_update("sneaky"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Permission(_)));

        // Authoritative state unchanged and nothing reached alice
        let after = request_sync(&handle, alice.conn.conn_id).await.unwrap();
        assert_eq!(before.state, after.state);
        assert!(!drain(&mut alice.rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Update(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_updates_coalesces_into_one_save() {
        let (store, registry) = setup();
        let doc = Uuid::new_v4();
        let mut alice = client("alice");

        let (_, handle) = registry
            .join(alice.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();

        for text in ["a", "b", "c", "d", "e"] {
            submit(&handle, alice.conn.conn_id, text_update(text))
                .await
                .unwrap();
        }
        assert_eq!(store.save_count(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        // The sync roundtrip orders us after the save in the room task
        request_sync(&handle, alice.conn.conn_id).await.unwrap();
        assert_eq!(store.save_count(), 1);

        assert!(drain(&mut alice.rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::DocumentSaved(s) if s.version == 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn a_slow_durable_write_does_not_stall_update_fanout() {
        let store = Arc::new(GatedStore::default());
        let registry = RoomRegistry::new(
            Arc::clone(&store) as Arc<dyn DocumentStore>,
            RoomSettings {
                save_debounce: Duration::from_secs(2),
                snapshot_interval: Duration::from_secs(60),
            },
        );
        let doc = Uuid::new_v4();
        let alice = client("alice");
        let mut bob = client("bob");

        let (_, handle) = registry
            .join(alice.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        registry
            .join(bob.conn.clone(), Role::Viewer, doc)
            .await
            .unwrap();

        submit(&handle, alice.conn.conn_id, text_update("first"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        store.entered.notified().await;
        drain(&mut bob.rx);

        // The write is held open; an edit submitted meanwhile must fan out
        // immediately, not after the store call returns
        submit(&handle, alice.conn.conn_id, text_update("second"))
            .await
            .unwrap();
        request_sync(&handle, bob.conn.conn_id).await.unwrap();
        assert_eq!(store.inner.save_count(), 0);
        assert!(drain(&mut bob.rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::Update(_))));

        store.release.notify_one();
        wait_until(|| store.inner.save_count() == 1).await;

        // The edit that landed mid-write gets its own follow-up save
        store.release.notify_one();
        tokio::time::sleep(Duration::from_secs(3)).await;
        wait_until(|| store.inner.save_count() == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn sync_before_the_window_elapses_reflects_the_update() {
        let (store, registry) = setup();
        let doc = Uuid::new_v4();
        let alice = client("alice");

        let (_, handle) = registry
            .join(alice.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        let update = text_update("unsaved");
        submit(&handle, alice.conn.conn_id, update.clone())
            .await
            .unwrap();

        let sync = request_sync(&handle, alice.conn.conn_id).await.unwrap();
        assert_eq!(store.save_count(), 0);

        let replica = CrdtState::new();
        replica.apply_update(&update).unwrap();
        assert!(same_content(&sync.state, &replica.encode_state()));
    }

    #[tokio::test(start_paused = true)]
    async fn editor_viewer_disconnect_scenario() {
        let (store, registry) = setup();
        let doc = Uuid::new_v4();
        let a = client("a");
        let mut b = client("b");

        // A (editor) joins an empty document and submits U1
        let (joined_a, handle) = registry
            .join(a.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        assert_eq!(joined_a.document.version, 0);
        let u1 = text_update("U1");
        submit(&handle, a.conn.conn_id, u1.clone()).await.unwrap();

        // B (viewer) joins and sees U1's effect in the join payload
        let (joined_b, _) = registry
            .join(b.conn.clone(), Role::Viewer, doc)
            .await
            .unwrap();
        let replica = CrdtState::new();
        replica.apply_update(&u1).unwrap();
        assert!(same_content(&joined_b.state, &replica.encode_state()));

        // B cannot write
        assert!(matches!(
            submit(&handle, b.conn.conn_id, text_update("nope")).await,
            Err(SubmitError::Permission(_))
        ));

        // A disconnects; the room stays resident for B and nothing flushed
        leave(&handle, a.conn.conn_id).await;
        let sync = request_sync(&handle, b.conn.conn_id).await.unwrap();
        assert!(registry.is_resident(doc));
        assert_eq!(store.save_count(), 0);
        assert!(same_content(&sync.state, &replica.encode_state()));

        assert!(drain(&mut b.rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::MemberLeft { user_id } if user_id == "a")));
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_after_teardown_reloads_the_flushed_state() {
        let (_store, registry) = setup();
        let doc = Uuid::new_v4();
        let alice = client("alice");

        let (_, handle) = registry
            .join(alice.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        let update = text_update("persisted");
        submit(&handle, alice.conn.conn_id, update.clone())
            .await
            .unwrap();
        leave(&handle, alice.conn.conn_id).await;
        wait_until(|| !registry.is_resident(doc)).await;

        let again = client("alice");
        let (joined, _) = registry
            .join(again.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        assert_eq!(joined.document.version, 1);

        let replica = CrdtState::new();
        replica.apply_update(&update).unwrap();
        assert!(same_content(&joined.state, &replica.encode_state()));
    }

    #[tokio::test]
    async fn concurrent_first_joins_create_one_room() {
        let (_store, registry) = setup();
        let doc = Uuid::new_v4();
        let alice = client("alice");
        let bob = client("bob");

        let (ra, rb) = tokio::join!(
            registry.join(alice.conn.clone(), Role::Editor, doc),
            registry.join(bob.conn.clone(), Role::Editor, doc),
        );
        ra.unwrap();
        rb.unwrap();
        assert_eq!(registry.resident_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_is_retried_on_the_next_trigger() {
        let (store, registry) = setup();
        let doc = Uuid::new_v4();
        let alice = client("alice");

        let (_, handle) = registry
            .join(alice.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();

        store.fail_next_saves(1);
        submit(&handle, alice.conn.conn_id, text_update("first"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        request_sync(&handle, alice.conn.conn_id).await.unwrap();
        assert_eq!(store.save_count(), 0);

        // The next accepted update re-arms the window; this save succeeds
        submit(&handle, alice.conn.conn_id, text_update("second"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        request_sync(&handle, alice.conn.conn_id).await.unwrap();
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn operation_records_name_the_last_submitter() {
        let (store, registry) = setup();
        let doc = Uuid::new_v4();
        let alice = client("alice");

        let (_, handle) = registry
            .join(alice.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        submit(&handle, alice.conn.conn_id, text_update("attr"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        request_sync(&handle, alice.conn.conn_id).await.unwrap();

        assert_eq!(store.operation_records(doc), vec![(1, "alice".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_records_follow_the_interval() {
        let (store, registry) = setup();
        let doc = Uuid::new_v4();
        let alice = client("alice");

        let (_, handle) = registry
            .join(alice.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();

        // First save lands well inside the snapshot interval
        submit(&handle, alice.conn.conn_id, text_update("one"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        request_sync(&handle, alice.conn.conn_id).await.unwrap();
        assert_eq!(store.snapshot_count(doc), 0);

        // Once the interval has elapsed, the next save also snapshots
        tokio::time::sleep(Duration::from_secs(61)).await;
        submit(&handle, alice.conn.conn_id, text_update("two"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        request_sync(&handle, alice.conn.conn_id).await.unwrap();
        assert_eq!(store.snapshot_count(doc), 1);
        assert_eq!(store.save_count(), 2);
    }

    #[tokio::test]
    async fn presence_reaches_other_members_only() {
        let (_store, registry) = setup();
        let doc = Uuid::new_v4();
        let mut alice = client("alice");
        let mut bob = client("bob");

        let (_, handle) = registry
            .join(alice.conn.clone(), Role::Editor, doc)
            .await
            .unwrap();
        registry
            .join(bob.conn.clone(), Role::Viewer, doc)
            .await
            .unwrap();
        drain(&mut alice.rx);
        drain(&mut bob.rx);

        handle
            .tx
            .send(RoomCommand::Cursor {
                conn_id: bob.conn.conn_id,
                cursor: Some(crate::models::CursorPos { anchor: 3, head: 7 }),
            })
            .await
            .unwrap();
        handle
            .tx
            .send(RoomCommand::Typing {
                conn_id: bob.conn.conn_id,
                typing: true,
            })
            .await
            .unwrap();
        request_sync(&handle, bob.conn.conn_id).await.unwrap();

        // Viewers may broadcast presence; it lands with alice, not bob
        let to_alice = drain(&mut alice.rx);
        assert!(to_alice
            .iter()
            .any(|m| matches!(m, ServerMessage::Cursor(c) if c.user_id == "bob")));
        assert!(to_alice
            .iter()
            .any(|m| matches!(m, ServerMessage::Typing(t) if t.user_id == "bob" && t.typing)));
        assert!(drain(&mut bob.rx)
            .iter()
            .all(|m| !matches!(m, ServerMessage::Cursor(_) | ServerMessage::Typing(_))));
    }
}
