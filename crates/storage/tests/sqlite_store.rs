use sqlx::SqlitePool;
use tempfile::TempDir;
use vela_storage::{
    ChatPatch, ChatStore, DEFAULT_CHAT_TITLE, MessageRole, MessageStore, NewChat, NewMessage,
    SqliteStorage, StorageErrorKind, UserId,
};

fn database_path(dir: &TempDir) -> String {
    let path = dir.path().join("nested").join("chats.db");
    path.to_str().expect("utf-8 temp path").to_string()
}

async fn open_store(dir: &TempDir) -> SqliteStorage {
    SqliteStorage::open(&database_path(dir))
        .await
        .expect("open sqlite store")
}

async fn inspect(dir: &TempDir) -> SqlitePool {
    SqlitePool::connect(&format!("sqlite://{}", database_path(dir)))
        .await
        .expect("open inspection pool")
}

fn user(name: &str) -> UserId {
    UserId::new(name).expect("non-empty user id")
}

#[tokio::test]
async fn schema_bootstrap_creates_both_collections() {
    let dir = TempDir::new().expect("temp dir");
    open_store(&dir).await;

    let tables = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name IN ('chats', 'messages') ORDER BY name",
    )
    .fetch_all(&inspect(&dir).await)
    .await
    .expect("list tables");

    assert_eq!(tables, vec!["chats".to_string(), "messages".to_string()]);
}

#[tokio::test]
async fn chat_lifecycle_round_trips_through_sqlite() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    let alice = user("alice");

    let chat = store
        .create_chat(Some(&alice), NewChat::new(""))
        .expect("create chat");
    assert_eq!(chat.title, DEFAULT_CHAT_TITLE);

    store
        .add_message(Some(&alice), chat.id, NewMessage::user("Explain recursion"))
        .expect("user message");
    store
        .add_message(Some(&alice), chat.id, NewMessage::assistant("It calls itself."))
        .expect("assistant message");

    let renamed = store
        .update_chat(
            Some(&alice),
            chat.id,
            ChatPatch {
                title: Some("Explain recursion".to_string()),
            },
        )
        .expect("rename");
    assert_eq!(renamed.title, "Explain recursion");
    assert!(renamed.updated_at_unix_millis > chat.updated_at_unix_millis);

    let loaded = store
        .get_chat(Some(&alice), chat.id)
        .expect("get chat")
        .expect("chat exists");
    let messages = loaded
        .messages
        .iter()
        .map(|message| (message.role, message.content.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        messages,
        vec![
            (MessageRole::User, "Explain recursion"),
            (MessageRole::Assistant, "It calls itself."),
        ]
    );

    store.delete_chat(Some(&alice), chat.id).expect("delete");
    assert!(store.get_chat(Some(&alice), chat.id).expect("get").is_none());

    let orphaned = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
        .fetch_one(&inspect(&dir).await)
        .await
        .expect("count messages");
    assert_eq!(orphaned, 0);
}

#[tokio::test]
async fn listing_is_scoped_to_caller_and_newest_first() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    let alice = user("alice");
    let bob = user("bob");

    let first = store
        .create_chat(Some(&alice), NewChat::new("first"))
        .expect("first");
    store
        .create_chat(Some(&alice), NewChat::new("second"))
        .expect("second");
    store
        .create_chat(Some(&bob), NewChat::new("bob's"))
        .expect("bob");

    store
        .add_message(Some(&alice), first.id, NewMessage::user("bump"))
        .expect("bump first");

    let titles = store
        .list_chats(Some(&alice))
        .expect("list")
        .into_iter()
        .map(|chat| chat.title)
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["first".to_string(), "second".to_string()]);
    assert!(store.list_chats(None).expect("anonymous list").is_empty());
}

#[tokio::test]
async fn writes_check_authentication_and_ownership() {
    let dir = TempDir::new().expect("temp dir");
    let store = open_store(&dir).await;
    let alice = user("alice");
    let mallory = user("mallory");
    let chat = store
        .create_chat(Some(&alice), NewChat::new("mine"))
        .expect("create");

    let error = store
        .create_chat(None, NewChat::new("anonymous"))
        .expect_err("anonymous create");
    assert_eq!(error.kind(), StorageErrorKind::NotAuthenticated);

    let error = store
        .add_message(Some(&mallory), chat.id, NewMessage::user("hijack"))
        .expect_err("foreign append");
    assert_eq!(error.kind(), StorageErrorKind::NotFound);

    let error = store
        .delete_chat(Some(&mallory), chat.id)
        .expect_err("foreign delete");
    assert_eq!(error.kind(), StorageErrorKind::NotFound);

    assert!(store.get_chat(Some(&mallory), chat.id).expect("get").is_none());
    assert!(store.get_chat(Some(&alice), chat.id).expect("get").is_some());
}

#[tokio::test]
async fn in_memory_locations_are_rejected() {
    for location in [":memory:", "sqlite::memory:", "sqlite://chats.db?mode=memory"] {
        let error = SqliteStorage::open(location)
            .await
            .expect_err("in-memory sqlite cannot back the store");
        assert_eq!(error.stage(), "sqlite-open-in-memory");
        assert_eq!(error.kind(), StorageErrorKind::PersistenceFailure);
    }
}
