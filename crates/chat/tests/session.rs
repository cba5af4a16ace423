use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use vela::{
    ChatSession, Direction, MessageKey, NoticeLevel, Role, SendOutcome, SendState, SessionConfig,
    SessionUpdate, SyncState, normalize, title_from_text,
};
use vela_source::{BoxFuture, Prompt, ResponseBody, ResponseSource, SourceError, SourceResult, TemplateSource};
use vela_storage::{
    ChatId, ChatPatch, ChatRecord, ChatStore, ChatWithMessages, MemoryStorage, MessageRecord,
    MessageStore, NewChat, NewMessage, StorageError, StorageErrorKind, StorageResult, UserId,
};

const REPLY: &str = "Recursion is   a function\ncalling itself until a base case stops it.";

fn alice() -> UserId {
    UserId::new("alice").expect("user id")
}

fn template(text: &str) -> Arc<dyn ResponseSource> {
    Arc::new(TemplateSource::new(vec![text.to_string()]).expect("template source"))
}

fn session_with(store: Arc<MemoryStorage>, reply: &str) -> ChatSession {
    ChatSession::new(store, template(reply), Some(alice()), SessionConfig::default())
}

fn assistant_key(session: &ChatSession) -> MessageKey {
    session.last_assistant_key().expect("assistant message")
}

async fn contents_until_stop(session: &mut ChatSession, count: usize) -> Vec<String> {
    let mut contents = Vec::new();
    while contents.len() < count {
        match session.next_update().await.expect("reveal still running") {
            SessionUpdate::Content { content, .. } => contents.push(content),
            SessionUpdate::Streaming { .. } => {}
            other => panic!("unexpected update {other:?}"),
        }
    }
    contents
}

/// Memory store whose message writes can be switched to fail.
struct FlakyStore {
    inner: MemoryStorage,
    fail_messages: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
            fail_messages: AtomicBool::new(false),
        }
    }
}

impl ChatStore for FlakyStore {
    fn list_chats(&self, caller: Option<&UserId>) -> StorageResult<Vec<ChatRecord>> {
        self.inner.list_chats(caller)
    }

    fn get_chat(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
    ) -> StorageResult<Option<ChatWithMessages>> {
        self.inner.get_chat(caller, chat_id)
    }

    fn create_chat(&self, caller: Option<&UserId>, input: NewChat) -> StorageResult<ChatRecord> {
        self.inner.create_chat(caller, input)
    }

    fn update_chat(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
        patch: ChatPatch,
    ) -> StorageResult<ChatRecord> {
        self.inner.update_chat(caller, chat_id, patch)
    }

    fn delete_chat(&self, caller: Option<&UserId>, chat_id: ChatId) -> StorageResult<()> {
        self.inner.delete_chat(caller, chat_id)
    }
}

impl MessageStore for FlakyStore {
    fn add_message(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(StorageError::InvariantViolation {
                stage: "flaky-add-message",
                details: "disk full".to_string(),
            });
        }
        self.inner.add_message(caller, chat_id, input)
    }

    fn list_messages(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
    ) -> StorageResult<Vec<MessageRecord>> {
        self.inner.list_messages(caller, chat_id)
    }
}

struct UnavailableSource;

impl ResponseSource for UnavailableSource {
    fn id(&self) -> &str {
        "unavailable"
    }

    fn respond<'a>(&'a self, _prompt: &'a Prompt) -> BoxFuture<'a, SourceResult<ResponseBody>> {
        Box::pin(async {
            Err(SourceError::StreamFailed {
                stage: "unavailable-source",
                message: "service unavailable".to_string(),
            })
        })
    }
}

#[tokio::test(start_paused = true)]
async fn explain_recursion_round_trip() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), REPLY);

    let chat_id = session.new_conversation().expect("new conversation");
    let outcome = session.send("  Explain recursion  ").expect("send");
    assert!(matches!(outcome, SendOutcome::Submitted { conversation_id, .. } if conversation_id == chat_id));

    let chats = session.list_conversations().expect("list");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].title, "Explain recursion");
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].role, Role::User);
    assert_eq!(session.messages()[0].content(), "Explain recursion");
    assert!(matches!(session.state(), SendState::Submitted(_)));

    let updates = session.settle().await;
    assert!(matches!(updates.last(), Some(SessionUpdate::Completed { .. })));
    assert_eq!(session.state(), &SendState::Ready);

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content(), normalize(REPLY));
    assert!(matches!(messages[1].sync, SyncState::Persisted(_)));

    let persisted = store.list_messages(Some(&alice()), chat_id).expect("messages");
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[1].content, normalize(REPLY));
}

#[tokio::test(start_paused = true)]
async fn first_send_creates_a_titled_conversation() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), REPLY);
    let long = "word ".repeat(30);

    session.send(&long).expect("send");

    let conversation = session.conversation().expect("active conversation");
    assert_eq!(conversation.title, title_from_text(&long));
    assert_eq!(conversation.title, "word ".repeat(10).trim_end());
    assert_eq!(session.list_conversations().expect("list").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn blank_send_is_ignored_and_busy_send_is_refused() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), REPLY);

    assert_eq!(session.send(" \n\t ").expect("blank"), SendOutcome::Ignored);
    assert!(session.conversation().is_none());

    session.send("first").expect("send");
    assert_eq!(session.send("second").expect("busy"), SendOutcome::Busy);
    assert_eq!(session.messages().len(), 1);

    session.settle().await;
    assert!(matches!(session.send("second").expect("send"), SendOutcome::Submitted { .. }));
}

#[tokio::test(start_paused = true)]
async fn published_content_grows_to_the_normalized_reply() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store, REPLY);
    session.send("Explain recursion").expect("send");
    assert!(matches!(session.state(), SendState::Submitted(_)));
    let submitted = session.reveal_state();
    assert!(!submitted.is_revealing);
    assert_eq!(submitted.active_version_id, None);

    let mut published = Vec::new();
    while let Some(update) = session.next_update().await {
        match update {
            SessionUpdate::Content { content, .. } => published.push(content),
            SessionUpdate::Completed { content, .. } => published.push(content),
            SessionUpdate::Streaming { .. } => {
                assert!(session.reveal_state().is_revealing);
                assert!(session.reveal_state().active_version_id.is_some());
            }
            other => panic!("unexpected update {other:?}"),
        }
    }

    assert_eq!(published.len(), REPLY.split_whitespace().count() + 1);
    for pair in published.windows(2).take(published.len() - 2) {
        assert!(pair[0].len() < pair[1].len());
    }
    assert_eq!(published.last(), Some(&normalize(REPLY)));
    assert!(!session.reveal_state().is_revealing);
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_the_revealed_prefix() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), "a b c d e f");
    let chat_id = session.new_conversation().expect("new conversation");
    session.send("letters").expect("send");

    let published = contents_until_stop(&mut session, 2).await;
    assert_eq!(published, vec!["a".to_string(), "a b".to_string()]);

    let stopped = session.stop().expect("active reveal");
    assert!(matches!(stopped, SessionUpdate::Stopped { ref content, version_id: Some(_), .. } if content == "a b"));
    assert_eq!(session.state(), &SendState::Ready);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(session.next_update().await.is_none());
    assert_eq!(session.messages()[1].content(), "a b");

    let persisted = store.list_messages(Some(&alice()), chat_id).expect("messages");
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[1].content, "a b");
}

#[tokio::test(start_paused = true)]
async fn stop_before_the_first_token_appends_nothing() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), REPLY);
    let chat_id = session.new_conversation().expect("new conversation");
    session.send("hello").expect("send");

    let stopped = session.stop().expect("active reveal");
    assert!(matches!(stopped, SessionUpdate::Stopped { version_id: None, .. }));
    assert!(session.stop().is_none());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(session.messages().len(), 1);
    assert_eq!(
        store.list_messages(Some(&alice()), chat_id).expect("messages").len(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn events_from_a_stopped_reveal_are_discarded() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store, "x y z");
    session.send("first").expect("send");

    // The first token is already queued when the placeholder opens.
    assert!(matches!(
        session.next_update().await,
        Some(SessionUpdate::Streaming { .. })
    ));
    session.stop();
    session.send("second").expect("send");

    let updates = session.settle().await;
    let contents = updates
        .iter()
        .filter_map(|update| match update {
            SessionUpdate::Content { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(contents, vec!["x", "x y", "x y z"]);

    let roles_and_contents = session
        .messages()
        .iter()
        .map(|message| (message.role, message.content().to_string()))
        .collect::<Vec<_>>();
    assert_eq!(
        roles_and_contents,
        vec![
            (Role::User, "first".to_string()),
            (Role::Assistant, String::new()),
            (Role::User, "second".to_string()),
            (Role::Assistant, "x y z".to_string()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn regenerate_adds_an_unpersisted_version() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), REPLY);
    let chat_id = session.new_conversation().expect("new conversation");
    session.send("Explain recursion").expect("send");
    session.settle().await;

    let user_key = session.messages()[0].key;
    assert!(!session.regenerate(user_key));
    assert!(!session.regenerate(MessageKey::new_v7()));

    let key = assistant_key(&session);
    assert!(session.regenerate(key));
    assert_eq!(session.branch_indicator(key), Some((2, 2)));
    assert!(!session.regenerate(key));
    assert_eq!(session.send("again").expect("busy"), SendOutcome::Busy);

    let updates = session.settle().await;
    assert!(matches!(updates.first(), Some(SessionUpdate::Streaming { message_key, .. }) if *message_key == key));
    assert!(matches!(updates.last(), Some(SessionUpdate::Completed { .. })));

    let message = &session.messages()[1];
    assert_eq!(message.versions().len(), 2);
    assert_eq!(message.versions()[0].content, normalize(REPLY));
    assert_eq!(message.versions()[1].content, normalize(REPLY));
    assert_eq!(message.branch(), 1);

    let persisted = store.list_messages(Some(&alice()), chat_id).expect("messages");
    assert_eq!(persisted.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn regenerate_needs_a_preceding_user_message() {
    let store = Arc::new(MemoryStorage::new());
    let chat = store
        .create_chat(Some(&alice()), NewChat::new("doubled reply"))
        .expect("create");
    for message in [
        NewMessage::user("Explain recursion"),
        NewMessage::assistant("It calls itself."),
        NewMessage::assistant("Until a base case."),
    ] {
        store
            .add_message(Some(&alice()), chat.id, message)
            .expect("add message");
    }

    let mut session = session_with(store, REPLY);
    session.select_conversation(chat.id).expect("select");
    let key = session.messages()[2].key;

    assert!(!session.regenerate(key));
    assert_eq!(session.messages()[2].versions().len(), 1);
    assert_eq!(session.state(), &SendState::Ready);
    assert!(!session.is_busy());

    let answered = session.messages()[1].key;
    assert!(session.regenerate(answered));
}

#[tokio::test(start_paused = true)]
async fn branch_navigation_is_clamped() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store, REPLY);
    session.send("Explain recursion").expect("send");
    session.settle().await;
    let key = assistant_key(&session);
    for _ in 0..2 {
        assert!(session.regenerate(key));
        session.settle().await;
    }
    assert_eq!(session.branch_indicator(key), Some((3, 3)));

    let cursors = [
        Direction::Next,
        Direction::Prev,
        Direction::Prev,
        Direction::Prev,
        Direction::Next,
    ]
    .into_iter()
    .map(|direction| session.select_branch(key, direction))
    .collect::<Vec<_>>();
    assert_eq!(cursors, vec![Some(2), Some(1), Some(0), Some(0), Some(1)]);
    assert_eq!(session.select_branch(MessageKey::new_v7(), Direction::Next), None);
}

#[tokio::test(start_paused = true)]
async fn deleting_conversations_updates_the_active_view() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), REPLY);

    let first = session.new_conversation().expect("first");
    let second = session.new_conversation().expect("second");
    assert_eq!(session.active_conversation_id(), Some(second));

    session.delete_conversation(first).expect("delete other");
    assert_eq!(session.active_conversation_id(), Some(second));

    session.delete_conversation(second).expect("delete active");
    assert_eq!(session.active_conversation_id(), None);
    assert!(session.list_conversations().expect("list").is_empty());

    let notices = session.drain_notices();
    assert_eq!(
        notices
            .iter()
            .filter(|notice| notice.message == "Chat deleted")
            .count(),
        2
    );
    assert!(session.drain_notices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn deleting_the_owner_cancels_its_reveal() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), REPLY);
    let owner = session.send("hello").expect("send");
    let SendOutcome::Submitted { conversation_id, .. } = owner else {
        panic!("expected submission");
    };

    session.new_conversation().expect("switch away");
    assert!(session.is_busy());
    session.delete_conversation(conversation_id).expect("delete owner");

    assert!(!session.is_busy());
    assert_eq!(session.state(), &SendState::Ready);
    assert!(session.next_update().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn reply_keeps_revealing_after_switching_away() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), "a b c");
    let owner = session.new_conversation().expect("owner");
    session.send("letters").expect("send");
    assert_eq!(contents_until_stop(&mut session, 1).await, vec!["a".to_string()]);

    let other = session.new_conversation().expect("other");
    assert_eq!(session.active_conversation_id(), Some(other));

    session.select_conversation(owner).expect("back to owner");
    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content(), "a");
    assert_eq!(messages[1].sync, SyncState::Local);

    session.select_conversation(other).expect("away again");
    let updates = session.settle().await;
    assert!(updates.iter().all(|update| update.conversation_id() == owner));
    assert!(session.messages().is_empty());

    let persisted = store.list_messages(Some(&alice()), owner).expect("messages");
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted[1].content, "a b c");

    session.select_conversation(owner).expect("reload owner");
    assert_eq!(session.messages()[1].content(), "a b c");
    assert_eq!(session.messages()[1].branch_indicator(), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn persistence_failures_surface_as_notices() {
    let store = Arc::new(FlakyStore::new());
    let mut session = ChatSession::new(
        store.clone(),
        template(REPLY),
        Some(alice()),
        SessionConfig::default(),
    );
    session.new_conversation().expect("new conversation");
    session.drain_notices();
    store.fail_messages.store(true, Ordering::SeqCst);

    let outcome = session.send("hello").expect("send still proceeds");
    assert!(matches!(outcome, SendOutcome::Submitted { .. }));
    assert_eq!(session.messages()[0].sync, SyncState::Failed);

    session.settle().await;
    assert_eq!(session.messages()[1].content(), normalize(REPLY));
    assert_eq!(session.messages()[1].sync, SyncState::Failed);

    let notices = session.drain_notices();
    let messages = notices
        .iter()
        .map(|notice| (notice.level, notice.message.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        messages,
        vec![
            (NoticeLevel::Error, "Failed to save message"),
            (NoticeLevel::Error, "Failed to save response"),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn source_failures_enter_the_error_state() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = ChatSession::new(
        store,
        Arc::new(UnavailableSource),
        Some(alice()),
        SessionConfig::default(),
    );

    session.send("hello").expect("send");
    let updates = session.settle().await;
    assert!(matches!(
        updates.as_slice(),
        [SessionUpdate::Failed { message, .. }] if message.contains("service unavailable")
    ));
    assert!(matches!(session.state(), SendState::Error { .. }));
    assert_eq!(session.messages().len(), 1);
    assert!(session
        .drain_notices()
        .iter()
        .any(|notice| notice.level == NoticeLevel::Error));

    session.acknowledge_error();
    assert_eq!(session.state(), &SendState::Ready);

    session.send("retry").expect("send after error");
    assert!(matches!(session.state(), SendState::Submitted(_)));
}

#[tokio::test(start_paused = true)]
async fn unauthenticated_sessions_cannot_write() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = ChatSession::new(store, template(REPLY), None, SessionConfig::default());

    assert!(session.list_conversations().expect("list").is_empty());
    let error = session.send("hello").expect_err("no caller");
    assert_eq!(error.storage_kind(), Some(StorageErrorKind::NotAuthenticated));
    assert!(session.conversation().is_none());
    assert!(!session.is_busy());
    assert_eq!(
        session.drain_notices().first().map(|notice| notice.message.as_str()),
        Some("Failed to create chat")
    );
}

#[tokio::test(start_paused = true)]
async fn foreign_conversations_are_not_found() {
    let store = Arc::new(MemoryStorage::new());
    let bob = UserId::new("bob").expect("user id");
    let foreign = store
        .create_chat(Some(&bob), NewChat::new("bob's chat"))
        .expect("create");

    let mut session = session_with(store, REPLY);
    let error = session
        .select_conversation(foreign.id)
        .expect_err("foreign chat");
    assert_eq!(error.storage_kind(), Some(StorageErrorKind::NotFound));
    assert!(session.list_conversations().expect("list").is_empty());

    let error = session
        .rename_conversation("anything")
        .expect_err("no active conversation");
    assert_eq!(error.stage(), "rename-conversation");
}

#[tokio::test(start_paused = true)]
async fn renaming_updates_the_view_and_the_store() {
    let store = Arc::new(MemoryStorage::new());
    let mut session = session_with(store.clone(), REPLY);
    let chat_id = session.new_conversation().expect("new conversation");

    session.rename_conversation("  Rust notes ").expect("rename");
    assert_eq!(session.conversation().map(|view| view.title.as_str()), Some("Rust notes"));
    let stored = store
        .get_chat(Some(&alice()), chat_id)
        .expect("get chat")
        .expect("chat exists");
    assert_eq!(stored.chat.title, "Rust notes");

    session.rename_conversation("   ").expect("rename blank");
    assert_eq!(
        session.conversation().map(|view| view.title.as_str()),
        Some(vela_storage::DEFAULT_CHAT_TITLE)
    );
}
