use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, ensure};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::clock::STORE_CLOCK;
use super::error::{
    CreateSqliteDirectorySnafu, InMemoryDatabaseSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, StorageError, StorageResult,
};
use super::error::{
    InvariantViolationSnafu, NotAuthenticatedSnafu, NotFoundSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu,
};
use super::ids::{ChatId, MessageId, UserId};
use super::types::{
    ChatPatch, ChatRecord, ChatWithMessages, MessageRecord, MessageRole, NewChat, NewMessage,
};
use super::{ChatStore, MessageStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    /// Opens a file-backed store, creating the file and running migrations.
    ///
    /// Every call connects afresh, so in-memory databases are rejected.
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        let database_url = normalize_database_url(database_location);
        ensure!(
            !is_in_memory_url(&database_url),
            InMemoryDatabaseSnafu {
                stage: "sqlite-open-in-memory",
                database_url,
            }
        );
        ensure_database_directory(database_location)?;

        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        pool.close().await;

        tracing::info!(database_url = %database_url, "sqlite chat store ready");
        Ok(Self { database_url })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ChatStore for SqliteStorage {
    fn list_chats(&self, caller: Option<&UserId>) -> StorageResult<Vec<ChatRecord>> {
        let Some(user_id) = caller.cloned() else {
            return Ok(Vec::new());
        };

        let database_url = self.database_url.clone();
        self.run_db_call("chat-list", async move {
            let mut connection = connect_store_connection(&database_url, "chat-list-connect").await?;
            let rows = sqlx::query_as::<_, ChatRow>(
                "SELECT id, user_id, title, created_at, updated_at FROM chats WHERE user_id = ? ORDER BY updated_at DESC, id DESC",
            )
            .bind(user_id.as_str())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-list-query",
            })?;

            rows.into_iter().map(chat_row_to_record).collect()
        })
    }

    fn get_chat(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
    ) -> StorageResult<Option<ChatWithMessages>> {
        let Some(user_id) = caller.cloned() else {
            return Ok(None);
        };

        let database_url = self.database_url.clone();
        self.run_db_call("chat-get", async move {
            let mut connection = connect_store_connection(&database_url, "chat-get-connect").await?;
            let Some(chat) = load_owned_chat(&mut connection, &user_id, chat_id, "chat-get-load").await? else {
                return Ok(None);
            };
            let messages = load_messages(&mut connection, chat_id, "chat-get-messages").await?;

            Ok(Some(ChatWithMessages { chat, messages }))
        })
    }

    fn create_chat(&self, caller: Option<&UserId>, input: NewChat) -> StorageResult<ChatRecord> {
        let user_id = require_caller(caller, "chat-create-auth", "create_chat")?;
        let database_url = self.database_url.clone();
        let now = STORE_CLOCK.now_millis();
        self.run_db_call("chat-create", async move {
            let mut connection = connect_store_connection(&database_url, "chat-create-connect").await?;
            let chat_id = ChatId::new_v7();
            let title = input.normalized_title();
            let stamp = u64_to_i64(now, "chat-create-timestamp")?;

            sqlx::query(
                "INSERT INTO chats (id, user_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(chat_id.to_string())
            .bind(user_id.as_str())
            .bind(title.as_str())
            .bind(stamp)
            .bind(stamp)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-create-insert",
            })?;

            Ok(ChatRecord {
                id: chat_id,
                user_id,
                title,
                created_at_unix_millis: now,
                updated_at_unix_millis: now,
            })
        })
    }

    fn update_chat(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
        patch: ChatPatch,
    ) -> StorageResult<ChatRecord> {
        let user_id = require_caller(caller, "chat-update-auth", "update_chat")?;
        let database_url = self.database_url.clone();
        let now = STORE_CLOCK.now_millis();
        self.run_db_call("chat-update", async move {
            let mut connection = connect_store_connection(&database_url, "chat-update-connect").await?;
            let title = patch.title.map(|title| NewChat::new(title).normalized_title());
            let update_result = sqlx::query(
                "UPDATE chats SET title = COALESCE(?, title), updated_at = ? WHERE id = ? AND user_id = ?",
            )
            .bind(title)
            .bind(u64_to_i64(now, "chat-update-timestamp")?)
            .bind(chat_id.to_string())
            .bind(user_id.as_str())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "chat-update-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "chat-update-missing",
                    entity: "chat",
                    id: chat_id.to_string(),
                }
                .fail();
            }

            load_owned_chat(&mut connection, &user_id, chat_id, "chat-update-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "chat-update-load-missing",
                    entity: "chat",
                    id: chat_id.to_string(),
                })
        })
    }

    fn delete_chat(&self, caller: Option<&UserId>, chat_id: ChatId) -> StorageResult<()> {
        let user_id = require_caller(caller, "chat-delete-auth", "delete_chat")?;
        let database_url = self.database_url.clone();
        self.run_db_call("chat-delete", async move {
            let mut connection = connect_store_connection(&database_url, "chat-delete-connect").await?;
            if load_owned_chat(&mut connection, &user_id, chat_id, "chat-delete-load")
                .await?
                .is_none()
            {
                return NotFoundSnafu {
                    stage: "chat-delete-missing",
                    entity: "chat",
                    id: chat_id.to_string(),
                }
                .fail();
            }

            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "chat-delete-begin",
            })?;

            // Messages go first so the chat row never disappears ahead of its children.
            let removed = sqlx::query("DELETE FROM messages WHERE chat_id = ?")
                .bind(chat_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-delete-messages",
                })?;

            sqlx::query("DELETE FROM chats WHERE id = ? AND user_id = ?")
                .bind(chat_id.to_string())
                .bind(user_id.as_str())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "chat-delete-chat",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "chat-delete-commit",
            })?;

            tracing::debug!(
                chat_id = %chat_id,
                removed_messages = removed.rows_affected(),
                "deleted chat"
            );
            Ok(())
        })
    }
}

impl MessageStore for SqliteStorage {
    fn add_message(
        &self,
        caller: Option<&UserId>,
        chat_id: ChatId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let user_id = require_caller(caller, "message-add-auth", "add_message")?;
        let database_url = self.database_url.clone();
        let now = STORE_CLOCK.now_millis();
        self.run_db_call("message-add", async move {
            let mut connection = connect_store_connection(&database_url, "message-add-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-add-begin",
            })?;

            let owned = sqlx::query_scalar::<_, i64>(
                "SELECT 1 FROM chats WHERE id = ? AND user_id = ? LIMIT 1",
            )
            .bind(chat_id.to_string())
            .bind(user_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-add-ensure-chat",
            })?;
            if owned.is_none() {
                return NotFoundSnafu {
                    stage: "message-add-missing-chat",
                    entity: "chat",
                    id: chat_id.to_string(),
                }
                .fail();
            }

            let next_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?",
            )
            .bind(chat_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-add-next-seq",
            })?;

            let message_id = MessageId::new_v7();
            let stamp = u64_to_i64(now, "message-add-timestamp")?;

            sqlx::query(
                "INSERT INTO messages (id, chat_id, seq, role, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(chat_id.to_string())
            .bind(next_seq)
            .bind(input.role.as_str())
            .bind(input.content.as_str())
            .bind(stamp)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-add-insert",
            })?;

            sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
                .bind(stamp)
                .bind(chat_id.to_string())
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-add-touch-chat",
                })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-add-commit",
            })?;

            Ok(MessageRecord {
                id: message_id,
                chat_id,
                seq: i64_to_u64(next_seq, "message-add-seq")?,
                role: input.role,
                content: input.content,
                created_at_unix_millis: now,
            })
        })
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

#[derive(Debug, FromRow)]
struct ChatRow {
    id: String,
    user_id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    seq: i64,
    role: String,
    content: String,
    created_at: i64,
}

fn chat_row_to_record(row: ChatRow) -> StorageResult<ChatRecord> {
    Ok(ChatRecord {
        id: ChatId::parse(&row.id)?,
        user_id: UserId::new(row.user_id).context(InvariantViolationSnafu {
            stage: "chat-row-user-id",
            details: "chat row has a blank user_id".to_string(),
        })?,
        title: row.title,
        created_at_unix_millis: i64_to_u64(row.created_at, "chat-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "chat-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        chat_id: ChatId::parse(&row.chat_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

fn require_caller(
    caller: Option<&UserId>,
    stage: &'static str,
    operation: &'static str,
) -> StorageResult<UserId> {
    caller
        .cloned()
        .context(NotAuthenticatedSnafu { stage, operation })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

async fn load_owned_chat(
    connection: &mut SqliteConnection,
    user_id: &UserId,
    chat_id: ChatId,
    stage: &'static str,
) -> StorageResult<Option<ChatRecord>> {
    let row = sqlx::query_as::<_, ChatRow>(
        "SELECT id, user_id, title, created_at, updated_at FROM chats WHERE id = ? AND user_id = ?",
    )
    .bind(chat_id.to_string())
    .bind(user_id.as_str())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    row.map(chat_row_to_record).transpose()
}

async fn load_messages(
    connection: &mut SqliteConnection,
    chat_id: ChatId,
    stage: &'static str,
) -> StorageResult<Vec<MessageRecord>> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, chat_id, seq, role, content, created_at FROM messages WHERE chat_id = ? ORDER BY seq ASC, id ASC",
    )
    .bind(chat_id.to_string())
    .fetch_all(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    rows.into_iter().map(message_row_to_record).collect()
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn is_in_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
