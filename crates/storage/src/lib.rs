pub mod clock;
pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use clock::MonotonicClock;
pub use error::{StorageError, StorageErrorKind, StorageResult};
pub use ids::{ChatId, MessageId, UserId};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use types::{
    ChatPatch, ChatRecord, ChatWithMessages, DEFAULT_CHAT_TITLE, MessageRecord, MessageRole,
    NewChat, NewMessage,
};

/// Chat CRUD scoped to the calling user.
///
/// Reads made without a caller return empty results; writes without a caller
/// fail with [`StorageError::NotAuthenticated`]. Chats owned by another user
/// are indistinguishable from missing ones.
pub trait ChatStore: Send + Sync {
    fn list_chats(&self, caller: Option<&UserId>) -> StorageResult<Vec<ChatRecord>>;
    fn get_chat(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
    ) -> StorageResult<Option<ChatWithMessages>>;
    fn create_chat(&self, caller: Option<&UserId>, input: NewChat) -> StorageResult<ChatRecord>;
    fn update_chat(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
        patch: ChatPatch,
    ) -> StorageResult<ChatRecord>;
    /// Removes every message of the chat, then the chat itself.
    fn delete_chat(&self, caller: Option<&UserId>, chat_id: ChatId) -> StorageResult<()>;
}

pub trait MessageStore: Send + Sync {
    /// Appends at the end of the chat and bumps the chat's `updated_at`.
    fn add_message(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;
    fn list_messages(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
    ) -> StorageResult<Vec<MessageRecord>>;
}

pub trait Storage: ChatStore + MessageStore {}

impl<T> Storage for T where T: ChatStore + MessageStore {}
