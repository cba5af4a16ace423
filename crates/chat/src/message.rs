use vela_source::{Prompt, PromptMessage};
use vela_storage::{ChatRecord, ChatWithMessages, MessageId, MessageRecord, MessageRole};

use crate::ids::{ConversationId, MessageKey, VersionId};

/// Longest title derived from a first user message, in characters.
pub const TITLE_MAX_CHARS: usize = 50;

/// Title for a conversation whose first user message is `text`.
pub fn title_from_text(text: &str) -> String {
    let title = text.trim().chars().take(TITLE_MAX_CHARS).collect::<String>();
    title.trim_end().to_string()
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

impl From<MessageRole> for Role {
    fn from(value: MessageRole) -> Self {
        match value {
            MessageRole::User => Self::User,
            MessageRole::Assistant => Self::Assistant,
        }
    }
}

impl From<Role> for vela_source::Role {
    fn from(value: Role) -> Self {
        match value {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// One candidate content for a message slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub id: VersionId,
    pub content: String,
}

/// Relationship between a local message and its persisted row.
///
/// Local state is never rolled back when a write fails; `Failed` marks the
/// divergence instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Persisted(MessageId),
    Failed,
}

/// Direction for branch navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Prev,
    Next,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub role: Role,
    pub sync: SyncState,
    // Never empty.
    versions: Vec<Version>,
    branch: usize,
}

impl Message {
    pub fn new(key: MessageKey, role: Role, content: impl Into<String>, sync: SyncState) -> Self {
        Self {
            key,
            role,
            sync,
            versions: vec![Version {
                id: VersionId::new_v7(),
                content: content.into(),
            }],
            branch: 0,
        }
    }

    /// Empty assistant slot that a reveal fills in.
    pub fn assistant_placeholder(key: MessageKey, version_id: VersionId) -> Self {
        Self {
            key,
            role: Role::Assistant,
            sync: SyncState::Local,
            versions: vec![Version {
                id: version_id,
                content: String::new(),
            }],
            branch: 0,
        }
    }

    pub fn from_record(record: &MessageRecord) -> Self {
        Self::new(
            MessageKey::from(record.id),
            Role::from(record.role),
            record.content.clone(),
            SyncState::Persisted(record.id),
        )
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    /// Index of the displayed version.
    pub fn branch(&self) -> usize {
        self.branch
    }

    pub fn current(&self) -> &Version {
        &self.versions[self.branch]
    }

    pub fn content(&self) -> &str {
        &self.current().content
    }

    /// Appends an empty version and points the cursor at it.
    pub fn push_version(&mut self, id: VersionId) -> usize {
        self.versions.push(Version {
            id,
            content: String::new(),
        });
        self.branch = self.versions.len() - 1;
        self.branch
    }

    pub fn version_mut(&mut self, id: VersionId) -> Option<&mut Version> {
        self.versions.iter_mut().find(|version| version.id == id)
    }

    /// Moves the cursor one step, staying put at either end.
    pub fn step_branch(&mut self, direction: Direction) -> usize {
        self.branch = match direction {
            Direction::Prev => self.branch.saturating_sub(1),
            Direction::Next => (self.branch + 1).min(self.versions.len() - 1),
        };
        self.branch
    }

    /// One-based `(current, total)` pair, e.g. `(2, 2)` for "2 / 2".
    pub fn branch_indicator(&self) -> (usize, usize) {
        (self.branch + 1, self.versions.len())
    }
}

/// In-memory view of the active conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub id: ConversationId,
    pub title: String,
    pub updated_at_unix_millis: u64,
    pub messages: Vec<Message>,
}

impl ConversationView {
    pub fn empty(chat: &ChatRecord) -> Self {
        Self {
            id: chat.id,
            title: chat.title.clone(),
            updated_at_unix_millis: chat.updated_at_unix_millis,
            messages: Vec::new(),
        }
    }

    /// One version per persisted message; branches are not stored.
    pub fn from_loaded(loaded: &ChatWithMessages) -> Self {
        Self {
            messages: loaded.messages.iter().map(Message::from_record).collect(),
            ..Self::empty(&loaded.chat)
        }
    }

    pub fn position(&self, key: MessageKey) -> Option<usize> {
        self.messages.iter().position(|message| message.key == key)
    }

    pub fn message(&self, key: MessageKey) -> Option<&Message> {
        self.messages.iter().find(|message| message.key == key)
    }

    pub fn message_mut(&mut self, key: MessageKey) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.key == key)
    }

    /// Prompt built from the displayed versions of `messages[..=last]`.
    pub fn prompt_through(&self, last: usize) -> Prompt {
        Prompt::new(
            self.messages
                .iter()
                .take(last + 1)
                .map(|message| PromptMessage::new(message.role.into(), message.content()))
                .collect(),
        )
    }
}
