use super::ids::{ChatId, MessageId, UserId};

/// Title given to chats created without one.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// Storage-local message role, decoupled from the chat core's role enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRecord {
    pub id: ChatId,
    pub user_id: UserId,
    pub title: String,
    pub created_at_unix_millis: u64,
    pub updated_at_unix_millis: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub seq: u64,
    pub role: MessageRole,
    pub content: String,
    pub created_at_unix_millis: u64,
}

/// A chat together with its messages in creation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatWithMessages {
    pub chat: ChatRecord,
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChat {
    pub title: String,
}

impl NewChat {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }

    pub(crate) fn normalized_title(&self) -> String {
        let title = self.title.trim();
        if title.is_empty() {
            DEFAULT_CHAT_TITLE.to_string()
        } else {
            title.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatPatch {
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}
