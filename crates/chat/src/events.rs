use crate::ids::{ConversationId, MessageKey, VersionId};

/// Observable change produced by applying reveal events to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// An assistant placeholder was created and the first token is coming.
    Streaming {
        conversation_id: ConversationId,
        message_key: MessageKey,
        version_id: VersionId,
    },
    Content {
        conversation_id: ConversationId,
        message_key: MessageKey,
        version_id: VersionId,
        content: String,
    },
    Completed {
        conversation_id: ConversationId,
        message_key: MessageKey,
        version_id: VersionId,
        content: String,
    },
    /// The reveal was cancelled; `version_id` is `None` when no placeholder existed yet.
    Stopped {
        conversation_id: ConversationId,
        version_id: Option<VersionId>,
        content: String,
    },
    Failed {
        conversation_id: ConversationId,
        message: String,
    },
}

impl SessionUpdate {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::Streaming {
                conversation_id, ..
            }
            | Self::Content {
                conversation_id, ..
            }
            | Self::Completed {
                conversation_id, ..
            }
            | Self::Stopped {
                conversation_id, ..
            }
            | Self::Failed {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Stopped { .. } | Self::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeLevel {
    Info,
    Error,
}

/// Short user-facing message about something that happened in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}
