use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use snafu::OptionExt;

use super::clock::STORE_CLOCK;
use super::error::{
    InvariantViolationSnafu, NotAuthenticatedSnafu, NotFoundSnafu, StorageResult,
};
use super::ids::{ChatId, MessageId, UserId};
use super::types::{
    ChatPatch, ChatRecord, ChatWithMessages, MessageRecord, NewChat, NewMessage,
};
use super::{ChatStore, MessageStore};

#[derive(Debug, Default)]
struct MemoryState {
    chats: HashMap<ChatId, ChatRecord>,
    messages: HashMap<ChatId, Vec<MessageRecord>>,
}

impl MemoryState {
    fn owned_chat_mut(
        &mut self,
        user_id: &UserId,
        chat_id: ChatId,
        stage: &'static str,
    ) -> StorageResult<&mut ChatRecord> {
        self.chats
            .get_mut(&chat_id)
            .filter(|chat| &chat.user_id == user_id)
            .context(NotFoundSnafu {
                stage,
                entity: "chat",
                id: chat_id.to_string(),
            })
    }
}

/// Process-local store with the same ownership and ordering rules as
/// [`super::SqliteStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state.lock().ok().context(InvariantViolationSnafu {
            stage,
            details: "memory store lock poisoned".to_string(),
        })
    }
}

fn require_caller<'a>(
    caller: Option<&'a UserId>,
    stage: &'static str,
    operation: &'static str,
) -> StorageResult<&'a UserId> {
    caller.context(NotAuthenticatedSnafu { stage, operation })
}

impl ChatStore for MemoryStorage {
    fn list_chats(&self, caller: Option<&UserId>) -> StorageResult<Vec<ChatRecord>> {
        let Some(user_id) = caller else {
            return Ok(Vec::new());
        };

        let state = self.lock("memory-chat-list")?;
        let mut chats = state
            .chats
            .values()
            .filter(|chat| &chat.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        chats.sort_by(|left, right| {
            right
                .updated_at_unix_millis
                .cmp(&left.updated_at_unix_millis)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(chats)
    }

    fn get_chat(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
    ) -> StorageResult<Option<ChatWithMessages>> {
        let Some(user_id) = caller else {
            return Ok(None);
        };

        let state = self.lock("memory-chat-get")?;
        let Some(chat) = state
            .chats
            .get(&chat_id)
            .filter(|chat| &chat.user_id == user_id)
        else {
            return Ok(None);
        };

        Ok(Some(ChatWithMessages {
            chat: chat.clone(),
            messages: state.messages.get(&chat_id).cloned().unwrap_or_default(),
        }))
    }

    fn create_chat(&self, caller: Option<&UserId>, input: NewChat) -> StorageResult<ChatRecord> {
        let user_id = require_caller(caller, "memory-chat-create-auth", "create_chat")?;
        let now = STORE_CLOCK.now_millis();
        let record = ChatRecord {
            id: ChatId::new_v7(),
            user_id: user_id.clone(),
            title: input.normalized_title(),
            created_at_unix_millis: now,
            updated_at_unix_millis: now,
        };

        let mut state = self.lock("memory-chat-create")?;
        state.chats.insert(record.id, record.clone());
        state.messages.insert(record.id, Vec::new());
        Ok(record)
    }

    fn update_chat(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
        patch: ChatPatch,
    ) -> StorageResult<ChatRecord> {
        let user_id = require_caller(caller, "memory-chat-update-auth", "update_chat")?;
        let mut state = self.lock("memory-chat-update")?;
        let chat = state.owned_chat_mut(user_id, chat_id, "memory-chat-update-missing")?;

        if let Some(title) = patch.title {
            chat.title = NewChat::new(title).normalized_title();
        }
        chat.updated_at_unix_millis = STORE_CLOCK.now_millis();
        Ok(chat.clone())
    }

    fn delete_chat(&self, caller: Option<&UserId>, chat_id: ChatId) -> StorageResult<()> {
        let user_id = require_caller(caller, "memory-chat-delete-auth", "delete_chat")?;
        let mut state = self.lock("memory-chat-delete")?;
        state.owned_chat_mut(user_id, chat_id, "memory-chat-delete-missing")?;

        state.messages.remove(&chat_id);
        state.chats.remove(&chat_id);
        Ok(())
    }
}

impl MessageStore for MemoryStorage {
    fn add_message(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let user_id = require_caller(caller, "memory-message-add-auth", "add_message")?;
        let mut state = self.lock("memory-message-add")?;
        let now = STORE_CLOCK.now_millis();
        let chat = state.owned_chat_mut(user_id, chat_id, "memory-message-add-missing")?;
        chat.updated_at_unix_millis = now;

        let messages = state.messages.entry(chat_id).or_default();
        let record = MessageRecord {
            id: MessageId::new_v7(),
            chat_id,
            seq: messages.last().map_or(1, |last| last.seq + 1),
            role: input.role,
            content: input.content,
            created_at_unix_millis: now,
        };
        messages.push(record.clone());
        Ok(record)
    }

    fn list_messages(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
    ) -> StorageResult<Vec<MessageRecord>> {
        Ok(self
            .get_chat(caller, chat_id)?
            .map(|loaded| loaded.messages)
            .unwrap_or_default())
    }
}
