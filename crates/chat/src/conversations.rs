use snafu::{OptionExt, ResultExt};
use vela_storage::{ChatPatch, ChatRecord, DEFAULT_CHAT_TITLE, NewChat};

use crate::error::{
    ChatResult, ConversationNotFoundSnafu, NoActiveConversationSnafu, StorageSnafu,
};
use crate::events::Notice;
use crate::ids::ConversationId;
use crate::message::{ConversationView, Message};
use crate::session::{ChatSession, RevealKind};

impl ChatSession {
    /// Caller's conversations, most recently updated first.
    pub fn list_conversations(&self) -> ChatResult<Vec<ChatRecord>> {
        self.store
            .list_chats(self.caller.as_ref())
            .context(StorageSnafu {
                stage: "list-conversations",
            })
    }

    /// Creates an empty "New Chat" and makes it active.
    pub fn new_conversation(&mut self) -> ChatResult<ConversationId> {
        let created = self
            .store
            .create_chat(self.caller.as_ref(), NewChat::new(DEFAULT_CHAT_TITLE));
        let record = match created {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(stage = error.stage(), error = %error, "failed to create chat");
                self.notices.push(Notice::error("Failed to create chat"));
                return Err(error).context(StorageSnafu {
                    stage: "new-conversation",
                });
            }
        };

        self.leave_active_conversation();
        self.conversation = Some(ConversationView::empty(&record));
        tracing::info!(chat_id = %record.id, "created chat");
        self.notices.push(Notice::info("New chat created"));
        Ok(record.id)
    }

    /// Loads a conversation from the store and makes it active.
    ///
    /// A reply still being revealed for this conversation is re-attached with
    /// the content published so far.
    pub fn select_conversation(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        let loaded = self
            .store
            .get_chat(self.caller.as_ref(), conversation_id)
            .context(StorageSnafu {
                stage: "select-conversation",
            })?
            .context(ConversationNotFoundSnafu {
                stage: "select-conversation",
                conversation_id,
            })?;

        self.leave_active_conversation();
        let mut view = ConversationView::from_loaded(&loaded);
        self.reattach_reply(&mut view);
        tracing::info!(
            chat_id = %conversation_id,
            messages = view.messages.len(),
            "selected chat"
        );
        self.conversation = Some(view);
        Ok(())
    }

    /// Deletes a conversation with all its messages.
    ///
    /// A reveal owned by it is cancelled; the active view is cleared only when
    /// it showed the deleted conversation.
    pub fn delete_conversation(&mut self, conversation_id: ConversationId) -> ChatResult<()> {
        if let Err(error) = self
            .store
            .delete_chat(self.caller.as_ref(), conversation_id)
        {
            tracing::warn!(chat_id = %conversation_id, error = %error, "failed to delete chat");
            self.notices.push(Notice::error("Failed to delete chat"));
            return Err(error).context(StorageSnafu {
                stage: "delete-conversation",
            });
        }

        let owns_reveal = self
            .reveal
            .as_ref()
            .is_some_and(|reveal| reveal.target.conversation_id == conversation_id);
        if owns_reveal {
            self.cancel_reveal();
        }
        if self.active_conversation_id() == Some(conversation_id) {
            self.conversation = None;
        }

        tracing::info!(chat_id = %conversation_id, "deleted chat");
        self.notices.push(Notice::info("Chat deleted"));
        Ok(())
    }

    /// Renames the active conversation.
    pub fn rename_conversation(&mut self, title: &str) -> ChatResult<()> {
        let conversation_id = self
            .active_conversation_id()
            .context(NoActiveConversationSnafu {
                stage: "rename-conversation",
            })?;
        let record = self
            .store
            .update_chat(
                self.caller.as_ref(),
                conversation_id,
                ChatPatch {
                    title: Some(title.to_string()),
                },
            )
            .context(StorageSnafu {
                stage: "rename-conversation",
            })?;

        if let Some(conversation) = self.conversation.as_mut() {
            conversation.title = record.title;
            conversation.updated_at_unix_millis = record.updated_at_unix_millis;
        }
        Ok(())
    }

    /// Regenerated versions exist only in the view, so their reveal ends with it.
    fn leave_active_conversation(&mut self) {
        let Some(active_id) = self.active_conversation_id() else {
            return;
        };
        let regenerating_here = self.reveal.as_ref().is_some_and(|reveal| {
            reveal.kind == RevealKind::Regenerate && reveal.target.conversation_id == active_id
        });
        if regenerating_here {
            tracing::debug!(chat_id = %active_id, "cancelling regenerate on conversation switch");
            self.cancel_reveal();
        }
    }

    fn reattach_reply(&self, view: &mut ConversationView) {
        let Some(reveal) = self.reveal.as_ref() else {
            return;
        };
        if reveal.kind != RevealKind::Reply || reveal.target.conversation_id != view.id {
            return;
        }
        let (Some(message_key), Some(version_id)) = (reveal.message_key, reveal.version_id) else {
            return;
        };
        if view.message(message_key).is_some() {
            return;
        }

        let mut placeholder = Message::assistant_placeholder(message_key, version_id);
        if let Some(version) = placeholder.version_mut(version_id) {
            version.content.clone_from(&reveal.content);
        }
        view.messages.push(placeholder);
    }
}
