use std::time::Duration;

use crate::ids::{MessageKey, VersionId};
use crate::message::{Direction, Role};
use crate::reveal::RevealRequest;
use crate::session::{ChatSession, RevealKind};
use crate::state::SendTransition;

impl ChatSession {
    /// Reveals a fresh answer into a new version of an assistant message.
    ///
    /// Returns `false` without side effects when the key is unknown, the
    /// message is not an assistant reply to a user message, or a reveal is
    /// already active. The new version is not persisted.
    pub fn regenerate(&mut self, message_key: MessageKey) -> bool {
        if self.is_busy() {
            tracing::debug!(%message_key, "regenerate refused while a reveal is active");
            return false;
        }
        let Some(conversation) = self.conversation.as_ref() else {
            return false;
        };
        let Some(index) = conversation.position(message_key) else {
            return false;
        };
        if index == 0
            || conversation.messages[index].role != Role::Assistant
            || conversation.messages[index - 1].role != Role::User
        {
            tracing::debug!(%message_key, index, "message cannot be regenerated");
            return false;
        }
        let conversation_id = conversation.id;
        let prompt = conversation.prompt_through(index - 1);

        let target = self.next_target(conversation_id);
        match self.state.apply(SendTransition::Submit(target)) {
            Ok(next) => self.state = next,
            Err(rejection) => {
                tracing::warn!(%rejection, "regenerate rejected by send state");
                return false;
            }
        }

        let version_id = VersionId::new_v7();
        let cursor = self
            .conversation
            .as_mut()
            .and_then(|conversation| conversation.message_mut(message_key))
            .map(|message| message.push_version(version_id));

        let request = RevealRequest {
            target,
            prompt,
            submit_delay: Duration::ZERO,
            pacing: self.config.pacing,
        };
        self.start_reveal(
            request,
            RevealKind::Regenerate,
            Some(message_key),
            Some(version_id),
        );

        tracing::debug!(
            chat_id = %conversation_id,
            %message_key,
            %version_id,
            ?cursor,
            "regenerate reveal started"
        );
        true
    }

    /// Moves a message's branch cursor one step; `None` for unknown keys.
    pub fn select_branch(&mut self, message_key: MessageKey, direction: Direction) -> Option<usize> {
        self.conversation
            .as_mut()?
            .message_mut(message_key)
            .map(|message| message.step_branch(direction))
    }

    /// One-based `(current, total)` for a message in the active conversation.
    pub fn branch_indicator(&self, message_key: MessageKey) -> Option<(usize, usize)> {
        self.conversation
            .as_ref()?
            .message(message_key)
            .map(|message| message.branch_indicator())
    }

    /// Key of the newest assistant message in the active conversation.
    pub fn last_assistant_key(&self) -> Option<MessageKey> {
        self.conversation
            .as_ref()?
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Assistant)
            .map(|message| message.key)
    }
}
