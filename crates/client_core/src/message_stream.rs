//! Folds realtime events into per-conversation message timelines and the
//! presence set.
//!
//! The reducer is synchronous and side-effect free; typing signals are the
//! only output that is not state and are returned as a [`Notice`].

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, Identity, MessageId, UserId},
    protocol::{MessagePayload, ServerEvent},
};

use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub conversation_id: ConversationId,
}

impl Message {
    pub fn from_payload(payload: MessagePayload, conversation_id: ConversationId) -> Self {
        Self {
            id: payload.id,
            sender_id: payload.sender_id,
            sender_name: payload.sender_name,
            body: payload.body,
            timestamp: payload.created_at,
            conversation_id,
        }
    }

    fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id)
    }
}

/// A thread ordered by `(timestamp, id)` holding at most one message per id.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: ConversationId,
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.seen.contains(&id)
    }

    /// Returns `false` when a message with the same id is already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        let key = message.order_key();
        let at = self.messages.partition_point(|m| m.order_key() < key);
        self.messages.insert(at, message);
        true
    }

    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        self.seen.clear();
        for message in messages {
            self.insert(message);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub name: String,
    pub is_online: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Identified(Identity),
    SnapshotLoaded {
        conversation_id: ConversationId,
        messages: Vec<Message>,
    },
    MessageArrived(Message),
    PresenceSnapshot(Vec<PresenceEntry>),
    TypingSignal(UserId),
}

/// Transient output for the UI; never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Typing { user_id: UserId },
}

#[derive(Debug, Clone, Default)]
pub struct ChatState {
    me: Option<Identity>,
    conversations: BTreeMap<ConversationId, Conversation>,
    presence: BTreeMap<UserId, PresenceEntry>,
}

impl ChatState {
    pub fn me(&self) -> Option<&Identity> {
        self.me.as_ref()
    }

    pub fn conversation(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.get(&id)
    }

    pub fn public(&self) -> Option<&Conversation> {
        self.conversation(ConversationId::Public)
    }

    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.conversations.values()
    }

    pub fn presence(&self) -> &BTreeMap<UserId, PresenceEntry> {
        &self.presence
    }

    pub fn apply(&mut self, event: StreamEvent) -> Option<Notice> {
        match event {
            StreamEvent::Identified(identity) => {
                self.me = Some(identity);
                None
            }
            StreamEvent::SnapshotLoaded {
                conversation_id,
                messages,
            } => {
                self.conversation_mut(conversation_id).replace(messages);
                None
            }
            StreamEvent::MessageArrived(message) => {
                self.conversation_mut(message.conversation_id)
                    .insert(message);
                None
            }
            StreamEvent::PresenceSnapshot(entries) => {
                self.presence = entries
                    .into_iter()
                    .map(|entry| (entry.user_id, entry))
                    .collect();
                None
            }
            StreamEvent::TypingSignal(user_id) => Some(Notice::Typing { user_id }),
        }
    }

    /// Decodes a wire event against the current identity and applies it.
    pub fn ingest(&mut self, event: ServerEvent) -> Result<Option<Notice>, ProtocolError> {
        let self_id = self.me.as_ref().map(|identity| identity.id);
        Ok(match decode(event, self_id)? {
            Some(event) => self.apply(event),
            None => None,
        })
    }

    fn conversation_mut(&mut self, id: ConversationId) -> &mut Conversation {
        self.conversations
            .entry(id)
            .or_insert_with(|| Conversation::new(id))
    }
}

pub fn reduce(mut state: ChatState, event: StreamEvent) -> ChatState {
    state.apply(event);
    state
}

/// Maps a wire event onto the reducer's vocabulary. Lifecycle-only events
/// map to `None`.
pub fn decode(event: ServerEvent, self_id: Option<UserId>) -> Result<Option<StreamEvent>, ProtocolError> {
    let event = match event {
        ServerEvent::Me(identity) => StreamEvent::Identified(identity),
        ServerEvent::OnlineUsers(users) => StreamEvent::PresenceSnapshot(
            users
                .into_iter()
                .map(|user| PresenceEntry {
                    user_id: user.id,
                    name: user.name,
                    is_online: true,
                })
                .collect(),
        ),
        ServerEvent::LoadMessages(messages) => StreamEvent::SnapshotLoaded {
            conversation_id: ConversationId::Public,
            messages: messages
                .into_iter()
                .map(|payload| Message::from_payload(payload, ConversationId::Public))
                .collect(),
        },
        ServerEvent::PrivateHistory(history) => {
            let conversation_id = ConversationId::Private(history.user_id);
            StreamEvent::SnapshotLoaded {
                conversation_id,
                messages: history
                    .messages
                    .into_iter()
                    .map(|payload| Message::from_payload(payload, conversation_id))
                    .collect(),
            }
        }
        ServerEvent::PublicMessage(payload) => {
            StreamEvent::MessageArrived(Message::from_payload(payload, ConversationId::Public))
        }
        ServerEvent::PrivateMessage(payload) => {
            let self_id = self_id.ok_or(ProtocolError::Unidentified {
                event: "private-message",
            })?;
            if payload.receiver_id.is_none() {
                return Err(ProtocolError::Malformed(
                    "private-message without receiver_id".into(),
                ));
            }
            let conversation_id = payload.conversation_for(self_id);
            StreamEvent::MessageArrived(Message::from_payload(payload, conversation_id))
        }
        ServerEvent::Typing(user_id) => StreamEvent::TypingSignal(user_id),
        ServerEvent::ConnectError(_) => return Ok(None),
    };
    Ok(Some(event))
}

#[cfg(test)]
#[path = "tests/message_stream_tests.rs"]
mod tests;
