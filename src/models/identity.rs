use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Who a connection is. Resolved once at admission and immutable for the
/// life of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
    /// Color used for remote cursor rendering
    pub color: String,
    pub avatar: Option<String>,
}

/// Access level for a document, resolved by the external access-control
/// service at join time and cached for the member's stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPos {
    pub anchor: u32,
    pub head: u32,
}

/// A participant in a room. One entry per identity, however many tabs or
/// devices it is connected from.
#[derive(Debug, Clone)]
pub struct RoomMember {
    pub identity: Identity,
    pub role: Role,
    pub cursor: Option<CursorPos>,
    pub typing: bool,
    pub connections: HashSet<Uuid>,
}

impl RoomMember {
    pub fn new(identity: Identity, role: Role, conn_id: Uuid) -> Self {
        let mut connections = HashSet::new();
        connections.insert(conn_id);
        Self {
            identity,
            role,
            cursor: None,
            typing: false,
            connections,
        }
    }

    pub fn snapshot(&self) -> MemberSnapshot {
        MemberSnapshot {
            identity: self.identity.clone(),
            role: self.role,
            cursor: self.cursor,
            typing: self.typing,
            online: !self.connections.is_empty(),
        }
    }
}

/// Wire form of a roster entry, included in the join payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSnapshot {
    #[serde(flatten)]
    pub identity: Identity,
    pub role: Role,
    pub cursor: Option<CursorPos>,
    pub typing: bool,
    pub online: bool,
}

/// Document metadata as served in the join payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub id: Uuid,
    pub title: String,
    pub version: i64,
}
