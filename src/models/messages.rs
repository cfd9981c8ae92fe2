use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use uuid::Uuid;

use crate::models::{CursorPos, DocumentInfo, Identity, MemberSnapshot, Role};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinMessage {
    pub document_id: Uuid,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    pub document_id: Uuid,
    #[serde_as(as = "Base64")]
    pub update: Vec<u8>,
    /// Opaque tag the submitting client uses to recognize its own update
    #[serde(default)]
    pub client_tag: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    /// Encoded state vector of what the client already holds. Absent means
    /// the client wants the full state.
    #[serde_as(as = "Option<Base64>")]
    #[serde(default)]
    pub vector: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CursorMessage {
    pub document_id: Uuid,
    pub cursor: Option<CursorPos>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TypingMessage {
    pub document_id: Uuid,
    pub typing: bool,
}

/// Every frame a client may send. Unrecognized or malformed shapes fail
/// deserialization at the boundary and never reach room logic.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Join(JoinMessage),
    Leave,
    Update(UpdateMessage),
    Sync(SyncMessage),
    Cursor(CursorMessage),
    Typing(TypingMessage),
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinedMessage {
    pub document: DocumentInfo,
    #[serde_as(as = "Base64")]
    pub state: Vec<u8>,
    pub members: Vec<MemberSnapshot>,
    pub role: Role,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastUpdateMessage {
    pub document_id: Uuid,
    #[serde_as(as = "Base64")]
    pub update: Vec<u8>,
    pub client_tag: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub identity: Identity,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SyncReplyMessage {
    #[serde_as(as = "Base64")]
    pub state: Vec<u8>,
    pub version: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresenceCursorMessage {
    pub document_id: Uuid,
    pub user_id: String,
    pub cursor: Option<CursorPos>,
    pub display_name: String,
    pub color: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PresenceTypingMessage {
    pub document_id: Uuid,
    pub user_id: String,
    pub typing: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSavedMessage {
    pub saved_at: DateTime<Utc>,
    pub version: i64,
}

/// Every frame the server may send.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Joined(JoinedMessage),
    Update(BroadcastUpdateMessage),
    Sync(SyncReplyMessage),
    MemberJoined { member: MemberSnapshot },
    MemberLeft { user_id: String },
    Cursor(PresenceCursorMessage),
    Typing(PresenceTypingMessage),
    DocumentSaved(DocumentSavedMessage),
    Error { message: String },
}
