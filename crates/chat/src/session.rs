use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use tokio::sync::mpsc;
use vela_source::{ResponseSource, create_source};
use vela_storage::{
    ChatPatch, DEFAULT_CHAT_TITLE, NewChat, NewMessage, Storage, StorageError, UserId,
};

use crate::error::{
    ChatResult, NoActiveConversationSnafu, SourceSnafu, StorageSnafu, TransitionSnafu,
};
use crate::events::{Notice, SessionUpdate};
use crate::ids::{ConversationId, MessageKey, RevealSessionId, RevealTarget, VersionId};
use crate::message::{ConversationView, Message, Role, SyncState, title_from_text};
use crate::reveal::{RevealEvent, RevealHandle, RevealPacing, RevealPayload, RevealRequest, spawn_reveal};
use crate::settings::Settings;
use crate::state::{SendState, SendTransition};

/// Timing of reply reveals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub submit_delay: Duration,
    pub pacing: RevealPacing,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            submit_delay: Duration::from_millis(500),
            pacing: RevealPacing::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input.
    Ignored,
    /// A reveal is still active.
    Busy,
    Submitted {
        conversation_id: ConversationId,
        message_key: MessageKey,
    },
}

/// Which version, if any, is currently being revealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RevealState {
    pub active_version_id: Option<VersionId>,
    pub is_revealing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RevealKind {
    /// Answers a send; the result is persisted.
    Reply,
    /// Fills a new version of an existing message; kept in memory only.
    Regenerate,
}

pub(crate) struct ActiveReveal {
    pub(crate) target: RevealTarget,
    pub(crate) kind: RevealKind,
    pub(crate) message_key: Option<MessageKey>,
    pub(crate) version_id: Option<VersionId>,
    pub(crate) content: String,
    pub(crate) handle: RevealHandle,
}

/// Owned chat state: active conversation, send pipeline, reveal and notices.
///
/// All mutation goes through `&mut self`. Methods that start a reveal must be
/// called from within a tokio runtime.
pub struct ChatSession {
    pub(crate) store: Arc<dyn Storage>,
    pub(crate) source: Arc<dyn ResponseSource>,
    pub(crate) caller: Option<UserId>,
    pub(crate) config: SessionConfig,
    pub(crate) conversation: Option<ConversationView>,
    pub(crate) state: SendState,
    pub(crate) reveal: Option<ActiveReveal>,
    pub(crate) notices: Vec<Notice>,
    events_tx: mpsc::UnboundedSender<RevealEvent>,
    events_rx: mpsc::UnboundedReceiver<RevealEvent>,
    next_session: u64,
}

impl ChatSession {
    pub fn new(
        store: Arc<dyn Storage>,
        source: Arc<dyn ResponseSource>,
        caller: Option<UserId>,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            source,
            caller,
            config,
            conversation: None,
            state: SendState::Ready,
            reveal: None,
            notices: Vec::new(),
            events_tx,
            events_rx,
            next_session: 0,
        }
    }

    pub fn from_settings(store: Arc<dyn Storage>, settings: &Settings) -> ChatResult<Self> {
        let source = create_source(&settings.source.kind, settings.source.templates.clone())
            .context(SourceSnafu {
                stage: "session-from-settings",
            })?;
        Ok(Self::new(
            store,
            source,
            settings.caller(),
            settings.reveal.to_session_config(),
        ))
    }

    pub fn caller(&self) -> Option<&UserId> {
        self.caller.as_ref()
    }

    pub fn conversation(&self) -> Option<&ConversationView> {
        self.conversation.as_ref()
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.conversation.as_ref().map(|conversation| conversation.id)
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn state(&self) -> &SendState {
        &self.state
    }

    /// Reports a version only once its reveal has opened; `Submitted` reveals nothing yet.
    pub fn reveal_state(&self) -> RevealState {
        let active_version_id = match self.state {
            SendState::Streaming(_) => self.reveal.as_ref().and_then(|reveal| reveal.version_id),
            _ => None,
        };
        RevealState {
            active_version_id,
            is_revealing: active_version_id.is_some(),
        }
    }

    /// True while a send or regenerate would be refused.
    pub fn is_busy(&self) -> bool {
        self.reveal.is_some() || self.state.is_busy()
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Leaves the `Error` state; no-op otherwise.
    pub fn acknowledge_error(&mut self) {
        if matches!(self.state, SendState::Error { .. }) {
            self.state = SendState::Ready;
        }
    }

    /// Appends a user message and starts revealing the reply.
    ///
    /// Store failures while creating the conversation are returned; failures
    /// while saving messages only raise a notice and mark the message `Failed`.
    pub fn send(&mut self, text: &str) -> ChatResult<SendOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SendOutcome::Ignored);
        }
        if self.is_busy() {
            tracing::debug!(state = self.state.label(), "send refused while a reveal is active");
            return Ok(SendOutcome::Busy);
        }
        self.acknowledge_error();

        let conversation_id = self.ensure_conversation(text)?;
        self.retitle_untitled(conversation_id, text);

        let persisted = self
            .store
            .add_message(self.caller.as_ref(), conversation_id, NewMessage::user(text));
        let (message_key, sync, updated_at) = match persisted {
            Ok(record) => (
                MessageKey::from(record.id),
                SyncState::Persisted(record.id),
                Some(record.created_at_unix_millis),
            ),
            Err(error) => {
                self.report_persistence_failure(conversation_id, &error, "Failed to save message");
                (MessageKey::new_v7(), SyncState::Failed, None)
            }
        };

        let conversation = self
            .conversation
            .as_mut()
            .context(NoActiveConversationSnafu { stage: "send" })?;
        conversation
            .messages
            .push(Message::new(message_key, Role::User, text, sync));
        if let Some(updated_at) = updated_at {
            conversation.updated_at_unix_millis = updated_at;
        }
        let prompt = conversation.prompt_through(conversation.messages.len() - 1);

        let target = self.next_target(conversation_id);
        self.state = self
            .state
            .apply(SendTransition::Submit(target))
            .context(TransitionSnafu {
                stage: "send-submit",
            })?;
        let request = RevealRequest {
            target,
            prompt,
            submit_delay: self.config.submit_delay,
            pacing: self.config.pacing,
        };
        self.start_reveal(request, RevealKind::Reply, None, None);

        tracing::debug!(
            chat_id = %conversation_id,
            session_id = target.session_id.0,
            "reply reveal submitted"
        );
        Ok(SendOutcome::Submitted {
            conversation_id,
            message_key,
        })
    }

    /// Cancels the active reveal.
    ///
    /// The last published content is final. For replies it is persisted; a
    /// reveal stopped before its first token leaves nothing behind.
    pub fn stop(&mut self) -> Option<SessionUpdate> {
        let reveal = self.cancel_reveal()?;
        let conversation_id = reveal.target.conversation_id;
        if let (RevealKind::Reply, Some(message_key)) = (reveal.kind, reveal.message_key) {
            self.persist_reply(conversation_id, message_key, &reveal.content);
        }

        tracing::debug!(
            chat_id = %conversation_id,
            session_id = reveal.target.session_id.0,
            revealed_chars = reveal.content.chars().count(),
            "reveal stopped"
        );
        Some(SessionUpdate::Stopped {
            conversation_id,
            version_id: reveal.version_id,
            content: reveal.content,
        })
    }

    /// Waits for the next visible change from the active reveal.
    ///
    /// Returns `None` once no reveal is active. Cancel-safe.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        while self.reveal.is_some() {
            let event = self.events_rx.recv().await?;
            if let Some(update) = self.apply_event(event) {
                return Some(update);
            }
        }
        None
    }

    /// Drives the active reveal to its end.
    pub async fn settle(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = self.next_update().await {
            updates.push(update);
        }
        updates
    }

    pub(crate) fn next_target(&mut self, conversation_id: ConversationId) -> RevealTarget {
        self.next_session += 1;
        RevealTarget::new(conversation_id, RevealSessionId::new(self.next_session))
    }

    pub(crate) fn start_reveal(
        &mut self,
        request: RevealRequest,
        kind: RevealKind,
        message_key: Option<MessageKey>,
        version_id: Option<VersionId>,
    ) {
        let target = request.target;
        let handle = spawn_reveal(Arc::clone(&self.source), request, self.events_tx.clone());
        self.reveal = Some(ActiveReveal {
            target,
            kind,
            message_key,
            version_id,
            content: String::new(),
            handle,
        });
    }

    /// Cancels the active reveal without persisting anything.
    pub(crate) fn cancel_reveal(&mut self) -> Option<ActiveReveal> {
        let mut reveal = self.reveal.take()?;
        reveal.handle.cancel();
        match self.state.apply(SendTransition::Cancel(reveal.target)) {
            Ok(next) => self.state = next,
            Err(rejection) => {
                tracing::warn!(%rejection, "send state out of sync with reveal, resetting");
                self.state = SendState::Ready;
            }
        }
        Some(reveal)
    }

    pub(crate) fn report_persistence_failure(
        &mut self,
        conversation_id: ConversationId,
        error: &StorageError,
        notice: &str,
    ) {
        tracing::warn!(
            chat_id = %conversation_id,
            stage = error.stage(),
            error = %error,
            "{notice}"
        );
        self.notices.push(Notice::error(notice));
    }

    fn ensure_conversation(&mut self, text: &str) -> ChatResult<ConversationId> {
        if let Some(conversation) = &self.conversation {
            return Ok(conversation.id);
        }

        let created = self
            .store
            .create_chat(self.caller.as_ref(), NewChat::new(title_from_text(text)));
        let record = match created {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(stage = error.stage(), error = %error, "failed to create chat");
                self.notices.push(Notice::error("Failed to create chat"));
                return Err(error).context(StorageSnafu {
                    stage: "send-create-conversation",
                });
            }
        };

        tracing::info!(chat_id = %record.id, title = %record.title, "created chat for first message");
        self.conversation = Some(ConversationView::empty(&record));
        Ok(record.id)
    }

    fn retitle_untitled(&mut self, conversation_id: ConversationId, text: &str) {
        let untitled = self.conversation.as_ref().is_some_and(|conversation| {
            conversation.messages.is_empty() && conversation.title == DEFAULT_CHAT_TITLE
        });
        if !untitled {
            return;
        }

        let patch = ChatPatch {
            title: Some(title_from_text(text)),
        };
        match self
            .store
            .update_chat(self.caller.as_ref(), conversation_id, patch)
        {
            Ok(record) => {
                if let Some(conversation) = self.conversation.as_mut() {
                    conversation.title = record.title;
                    conversation.updated_at_unix_millis = record.updated_at_unix_millis;
                }
            }
            Err(error) => {
                self.report_persistence_failure(
                    conversation_id,
                    &error,
                    "Failed to update chat title",
                );
            }
        }
    }

    fn apply_event(&mut self, event: RevealEvent) -> Option<SessionUpdate> {
        let active = self.reveal.as_ref().map(|reveal| reveal.target);
        if active != Some(event.target) {
            tracing::warn!(stale = ?event.target, ?active, "discarding stale reveal event");
            return None;
        }

        if let Some(transition) = event.transition() {
            match self.state.apply(transition) {
                Ok(next) => self.state = next,
                Err(rejection) => {
                    tracing::warn!(%rejection, "rejected reveal transition");
                    return None;
                }
            }
        } else if !self.state.accepts_content(event.target) {
            tracing::warn!(reveal = ?event.target, "content arrived before reveal opened");
            return None;
        }

        match event.payload {
            RevealPayload::Opened => self.open_reveal(),
            RevealPayload::Content(content) => self.publish(content),
            RevealPayload::Done(content) => self.complete(content),
            RevealPayload::Error(message) => self.fail(message),
        }
    }

    fn open_reveal(&mut self) -> Option<SessionUpdate> {
        let reveal = self.reveal.as_mut()?;
        let conversation_id = reveal.target.conversation_id;

        let (message_key, version_id) = match (reveal.message_key, reveal.version_id) {
            (Some(message_key), Some(version_id)) => (message_key, version_id),
            _ => {
                let message_key = MessageKey::new_v7();
                let version_id = VersionId::new_v7();
                reveal.message_key = Some(message_key);
                reveal.version_id = Some(version_id);
                if let Some(conversation) = self
                    .conversation
                    .as_mut()
                    .filter(|conversation| conversation.id == conversation_id)
                {
                    conversation
                        .messages
                        .push(Message::assistant_placeholder(message_key, version_id));
                }
                (message_key, version_id)
            }
        };

        tracing::debug!(chat_id = %conversation_id, %version_id, "reveal opened");
        Some(SessionUpdate::Streaming {
            conversation_id,
            message_key,
            version_id,
        })
    }

    fn publish(&mut self, content: String) -> Option<SessionUpdate> {
        let reveal = self.reveal.as_mut()?;
        let message_key = reveal.message_key?;
        let version_id = reveal.version_id?;
        let conversation_id = reveal.target.conversation_id;
        reveal.content.clone_from(&content);

        write_version(
            self.conversation.as_mut(),
            conversation_id,
            message_key,
            version_id,
            &content,
        );
        Some(SessionUpdate::Content {
            conversation_id,
            message_key,
            version_id,
            content,
        })
    }

    fn complete(&mut self, content: String) -> Option<SessionUpdate> {
        let reveal = self.reveal.take()?;
        let message_key = reveal.message_key?;
        let version_id = reveal.version_id?;
        let conversation_id = reveal.target.conversation_id;

        write_version(
            self.conversation.as_mut(),
            conversation_id,
            message_key,
            version_id,
            &content,
        );
        if reveal.kind == RevealKind::Reply {
            self.persist_reply(conversation_id, message_key, &content);
        }

        tracing::debug!(
            chat_id = %conversation_id,
            %version_id,
            chars = content.chars().count(),
            "reveal completed"
        );
        Some(SessionUpdate::Completed {
            conversation_id,
            message_key,
            version_id,
            content,
        })
    }

    fn fail(&mut self, message: String) -> Option<SessionUpdate> {
        let reveal = self.reveal.take()?;
        let conversation_id = reveal.target.conversation_id;
        tracing::warn!(chat_id = %conversation_id, %message, "reveal failed");
        self.notices
            .push(Notice::error(format!("Failed to generate response: {message}")));
        Some(SessionUpdate::Failed {
            conversation_id,
            message,
        })
    }

    /// Writes the assistant reply to its owning conversation, visible or not.
    fn persist_reply(
        &mut self,
        conversation_id: ConversationId,
        message_key: MessageKey,
        content: &str,
    ) {
        let persisted = self.store.add_message(
            self.caller.as_ref(),
            conversation_id,
            NewMessage::assistant(content),
        );
        let (sync, updated_at) = match persisted {
            Ok(record) => (
                SyncState::Persisted(record.id),
                Some(record.created_at_unix_millis),
            ),
            Err(error) => {
                self.report_persistence_failure(conversation_id, &error, "Failed to save response");
                (SyncState::Failed, None)
            }
        };

        let Some(conversation) = self
            .conversation
            .as_mut()
            .filter(|conversation| conversation.id == conversation_id)
        else {
            return;
        };
        if let Some(updated_at) = updated_at {
            conversation.updated_at_unix_millis = updated_at;
        }
        if let Some(message) = conversation.message_mut(message_key) {
            message.sync = sync;
        }
    }
}

/// Applies revealed content when the owning conversation is on screen.
fn write_version(
    conversation: Option<&mut ConversationView>,
    conversation_id: ConversationId,
    message_key: MessageKey,
    version_id: VersionId,
    content: &str,
) {
    let version = conversation
        .filter(|conversation| conversation.id == conversation_id)
        .and_then(|conversation| conversation.message_mut(message_key))
        .and_then(|message| message.version_mut(version_id));
    if let Some(version) = version {
        version.content.clear();
        version.content.push_str(content);
    }
}
