use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::App;
use crate::models::{
    AuthError, ClientMessage, Identity, ServerMessage, SyncMessage, UpdateMessage,
};
use crate::room::{ConnHandle, RoomCommand, RoomHandle};
use crate::ws::token::extract_token;

/// WebSocket handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    State(app): State<Arc<App>>,
) -> Response {
    info!("New WebSocket connection attempt");

    // Admission runs before any room operation; a refused connection still
    // upgrades, but only to deliver one error frame before the close.
    let token = extract_token(&headers, &params);
    match app.admission.admit(token.as_deref()).await {
        Ok(identity) => ws.on_upgrade(move |socket| handle_socket(socket, identity, app)),
        Err(e) => {
            warn!("Connection refused: {}", e);
            let frame = refusal_frame(&e);
            ws.on_upgrade(move |socket| refuse_socket(socket, frame))
        }
    }
}

fn refusal_frame(reason: &AuthError) -> ServerMessage {
    ServerMessage::Error {
        message: reason.to_string(),
    }
}

async fn refuse_socket(mut socket: WebSocket, frame: ServerMessage) {
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(text)).await;
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, identity: Identity, app: Arc<App>) {
    // Generate unique connection ID to identify this client
    let conn_id = Uuid::new_v4();
    info!(
        "WebSocket connection established for user {} with connection_id: {}",
        identity.user_id, conn_id
    );

    app.tracker.register(&identity.user_id, conn_id);

    // Split the socket into sender and receiver
    let (mut sender, mut receiver) = socket.split();

    // Outbound pump: everything the room fans out to this connection goes
    // through this channel and task.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(256);
    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize outbound message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut session = ConnSession {
        conn: ConnHandle {
            conn_id,
            identity,
            tx: out_tx,
        },
        app: Arc::clone(&app),
        room: None,
    };

    while let Some(Ok(msg)) = receiver.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Ping/pong are handled by axum; binary frames are not part of
            // the protocol.
            _ => continue,
        };

        // Closed tagged message set: anything malformed or unrecognized is
        // rejected here and never reaches room logic.
        let frame: ClientMessage = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Rejected malformed frame on connection {}: {}", conn_id, e);
                session
                    .send_error(format!("unrecognized message: {}", e))
                    .await;
                continue;
            }
        };

        session.dispatch(frame).await;
    }

    // Explicit leave, transport close, and error all converge here, once.
    session.leave_current().await;
    let user_id = session.conn.identity.user_id.clone();
    if app.tracker.unregister(&user_id, conn_id) {
        info!("User {} has no remaining connections", user_id);
    } else {
        info!(
            "User {} still has {} connection(s)",
            user_id,
            app.tracker.connection_count(&user_id)
        );
    }
    send_task.abort();
    info!("WebSocket connection terminated: {}", conn_id);
}

/// Per-connection state on the core side: who this is and which room (at
/// most one) the connection currently belongs to.
struct ConnSession {
    conn: ConnHandle,
    app: Arc<App>,
    room: Option<(Uuid, RoomHandle)>,
}

impl ConnSession {
    async fn dispatch(&mut self, frame: ClientMessage) {
        match frame {
            ClientMessage::Join(join) => self.handle_join(join.document_id).await,
            ClientMessage::Leave => self.leave_current().await,
            ClientMessage::Update(update) => self.handle_update(update).await,
            ClientMessage::Sync(sync) => self.handle_sync(sync).await,
            ClientMessage::Cursor(cursor) => {
                if let Some(handle) = self.room_handle(cursor.document_id) {
                    let _ = handle
                        .tx
                        .send(RoomCommand::Cursor {
                            conn_id: self.conn.conn_id,
                            cursor: cursor.cursor,
                        })
                        .await;
                } else {
                    self.send_error("not joined to this document".to_string()).await;
                }
            }
            ClientMessage::Typing(typing) => {
                if let Some(handle) = self.room_handle(typing.document_id) {
                    let _ = handle
                        .tx
                        .send(RoomCommand::Typing {
                            conn_id: self.conn.conn_id,
                            typing: typing.typing,
                        })
                        .await;
                } else {
                    self.send_error("not joined to this document".to_string()).await;
                }
            }
        }
    }

    async fn handle_join(&mut self, document_id: Uuid) {
        // Access check happens out here, never inside the room task.
        let role = match self
            .app
            .access
            .check_access(&self.conn.identity.user_id, document_id)
            .await
        {
            Ok(role) => role,
            Err(e) => {
                self.send_error(e.to_string()).await;
                return;
            }
        };

        // A connection belongs to at most one room; switching documents is
        // an implicit leave. Rejoining the current document is not a
        // switch: the room merges the connection and replies with fresh
        // state, so a sole member's room must not tear down under it.
        if !matches!(&self.room, Some((current, _)) if *current == document_id) {
            self.leave_current().await;
        }

        match self
            .app
            .registry
            .join(self.conn.clone(), role, document_id)
            .await
        {
            Ok((joined, handle)) => {
                self.room = Some((document_id, handle));
                self.send(ServerMessage::Joined(*joined)).await;
            }
            Err(e) => {
                error!("Join failed for document {}: {}", document_id, e);
                self.send_error(e.to_string()).await;
            }
        }
    }

    async fn handle_update(&mut self, update: UpdateMessage) {
        let Some(handle) = self.room_handle(update.document_id) else {
            self.send_error("not joined to this document".to_string()).await;
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = RoomCommand::Update {
            conn_id: self.conn.conn_id,
            update: update.update,
            client_tag: update.client_tag,
            timestamp: update.timestamp,
            reply: reply_tx,
        };
        if handle.tx.send(cmd).await.is_err() {
            self.send_error("room is closed".to_string()).await;
            return;
        }

        match reply_rx.await {
            Ok(Ok(())) => {}
            // Rejections are local to this submission; other members never
            // see them.
            Ok(Err(e)) => self.send_error(e.to_string()).await,
            Err(_) => self.send_error("room is closed".to_string()).await,
        }
    }

    async fn handle_sync(&mut self, sync: SyncMessage) {
        let Some((_, handle)) = &self.room else {
            self.send_error("not joined to a document".to_string()).await;
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd = RoomCommand::Sync {
            conn_id: self.conn.conn_id,
            vector: sync.vector,
            reply: reply_tx,
        };
        if handle.tx.send(cmd).await.is_err() {
            self.send_error("room is closed".to_string()).await;
            return;
        }

        match reply_rx.await {
            Ok(Ok(reply)) => self.send(ServerMessage::Sync(reply)).await,
            Ok(Err(e)) => self.send_error(e.to_string()).await,
            Err(_) => self.send_error("room is closed".to_string()).await,
        }
    }

    fn room_handle(&self, document_id: Uuid) -> Option<RoomHandle> {
        match &self.room {
            Some((doc, handle)) if *doc == document_id => Some(handle.clone()),
            _ => None,
        }
    }

    async fn leave_current(&mut self) {
        if let Some((document_id, handle)) = self.room.take() {
            info!(
                "Connection {} leaving document {}",
                self.conn.conn_id, document_id
            );
            let _ = handle
                .tx
                .send(RoomCommand::Leave {
                    conn_id: self.conn.conn_id,
                })
                .await;
        }
    }

    async fn send(&self, msg: ServerMessage) {
        let _ = self.conn.tx.send(msg).await;
    }

    async fn send_error(&self, message: String) {
        self.send(ServerMessage::Error { message }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{FixedAccess, LocalIdentityProvider};
    use crate::config::Config;
    use crate::models::Role;
    use crate::store::MemoryStore;

    fn test_app() -> Arc<App> {
        App::new(
            Config::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(FixedAccess { role: Role::Editor }),
            Arc::new(LocalIdentityProvider),
        )
    }

    fn test_session(app: &Arc<App>, user: &str) -> (ConnSession, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let session = ConnSession {
            conn: ConnHandle {
                conn_id: Uuid::new_v4(),
                identity: Identity {
                    user_id: user.to_string(),
                    display_name: user.to_string(),
                    color: "#4363d8".to_string(),
                    avatar: None,
                },
                tx,
            },
            app: Arc::clone(app),
            room: None,
        };
        (session, rx)
    }

    #[test]
    fn a_refused_connection_gets_one_tagged_error_frame() {
        let frame = refusal_frame(&AuthError::Missing);
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains(r#""type":"error""#));
    }

    #[tokio::test]
    async fn rejoining_the_same_document_does_not_bounce_the_membership() {
        let app = test_app();
        let doc = Uuid::new_v4();
        let (mut alice, _alice_rx) = test_session(&app, "alice");
        let (mut bob, mut bob_rx) = test_session(&app, "bob");

        alice.handle_join(doc).await;
        bob.handle_join(doc).await;
        let (_, first) = alice.room.clone().unwrap();
        while bob_rx.try_recv().is_ok() {}

        // A repeated join of the current document merges in place
        alice.handle_join(doc).await;
        let (_, second) = alice.room.clone().unwrap();
        assert!(first.same_room(&second));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn switching_documents_still_leaves_the_first_room() {
        let app = test_app();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let (mut alice, _alice_rx) = test_session(&app, "alice");

        alice.handle_join(doc_a).await;
        alice.handle_join(doc_b).await;

        let (current, _) = alice.room.clone().unwrap();
        assert_eq!(current, doc_b);
        assert!(app.registry.is_resident(doc_b));
    }
}
