use std::fmt;

use uuid::Uuid;
use vela_storage::MessageId;

pub use vela_storage::ChatId as ConversationId;

/// Stable identity of one message slot in a conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey(pub Uuid);

impl MessageKey {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl From<MessageId> for MessageKey {
    /// Loaded messages reuse their persisted id so reloads keep keys stable.
    fn from(value: MessageId) -> Self {
        Self(value.as_uuid())
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Identity of one content version of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId(pub Uuid);

impl VersionId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Identifier for one reveal run.
///
/// This must change on every send/regenerate so stale publications can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RevealSessionId(pub u64);

impl RevealSessionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Routing key attached to every reveal publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RevealTarget {
    pub conversation_id: ConversationId,
    pub session_id: RevealSessionId,
}

impl RevealTarget {
    pub const fn new(conversation_id: ConversationId, session_id: RevealSessionId) -> Self {
        Self {
            conversation_id,
            session_id,
        }
    }
}
