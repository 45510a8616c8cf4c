use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, Identity, MessageId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Frames the client emits on the realtime connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientRequest {
    LoadMessages,
    LoadPrivateMessages {
        target_user_id: UserId,
    },
    PublicMessage {
        body: String,
    },
    PrivateMessage {
        target_user_id: UserId,
        body: String,
    },
    Typing {
        #[serde(default)]
        target_user_id: Option<UserId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    #[serde(alias = "content")]
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
}

impl MessagePayload {
    /// Conversation this message belongs to from the point of view of
    /// `self_id`. Private messages are keyed by the other participant.
    pub fn conversation_for(&self, self_id: UserId) -> ConversationId {
        match self.receiver_id {
            None => ConversationId::Public,
            Some(receiver_id) if self.sender_id == self_id => ConversationId::Private(receiver_id),
            Some(_) => ConversationId::Private(self.sender_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: UserId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateHistory {
    pub user_id: UserId,
    pub messages: Vec<MessagePayload>,
}

/// Frames the backend pushes on the realtime connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    Me(Identity),
    OnlineUsers(Vec<OnlineUser>),
    LoadMessages(Vec<MessagePayload>),
    PrivateHistory(PrivateHistory),
    PublicMessage(MessagePayload),
    PrivateMessage(MessagePayload),
    Typing(UserId),
    ConnectError(ApiError),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Me(_) => "me",
            Self::OnlineUsers(_) => "online-users",
            Self::LoadMessages(_) => "load-messages",
            Self::PrivateHistory(_) => "private-history",
            Self::PublicMessage(_) => "public-message",
            Self::PrivateMessage(_) => "private-message",
            Self::Typing(_) => "typing",
            Self::ConnectError(_) => "connect-error",
        }
    }
}
