pub mod error;
pub mod health;
pub mod identity;
pub mod messages;

pub use error::{AccessError, ApplyError, AuthError, PermissionError, StoreError, SubmitError};
pub use health::HealthResponse;
pub use identity::{CursorPos, DocumentInfo, Identity, MemberSnapshot, Role, RoomMember};
pub use messages::{
    BroadcastUpdateMessage, ClientMessage, DocumentSavedMessage, JoinedMessage,
    PresenceCursorMessage, PresenceTypingMessage, ServerMessage, SyncMessage, SyncReplyMessage,
    UpdateMessage,
};
