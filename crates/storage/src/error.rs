use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("no authenticated user for '{operation}'"))]
    NotAuthenticated {
        stage: &'static str,
        operation: &'static str,
    },
    #[snafu(display("storage entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("storage id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("sqlite store needs a file location, got in-memory '{database_url}'"))]
    InMemoryDatabase {
        stage: &'static str,
        database_url: String,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to configure sqlite pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to spawn sqlite worker thread"))]
    SqliteThreadSpawn {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to initialize sqlite worker runtime"))]
    SqliteRuntimeInit {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// Coarse failure classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// No user context; reads degrade to empty results, writes are rejected.
    NotAuthenticated,
    /// Entity absent or owned by someone else. Not retried.
    NotFound,
    /// Backend could not complete the call.
    PersistenceFailure,
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            Self::NotAuthenticated { .. } => StorageErrorKind::NotAuthenticated,
            Self::NotFound { .. } => StorageErrorKind::NotFound,
            Self::InvalidId { .. }
            | Self::InvariantViolation { .. }
            | Self::InMemoryDatabase { .. }
            | Self::CreateSqliteDirectory { .. }
            | Self::SqliteConnectOptions { .. }
            | Self::SqliteConnect { .. }
            | Self::SqlitePragma { .. }
            | Self::SqliteMigrate { .. }
            | Self::SqliteQuery { .. }
            | Self::SqliteThreadSpawn { .. }
            | Self::SqliteRuntimeInit { .. } => StorageErrorKind::PersistenceFailure,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotAuthenticated { stage, .. }
            | Self::NotFound { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::InvariantViolation { stage, .. }
            | Self::InMemoryDatabase { stage, .. }
            | Self::CreateSqliteDirectory { stage, .. }
            | Self::SqliteConnectOptions { stage, .. }
            | Self::SqliteConnect { stage, .. }
            | Self::SqlitePragma { stage, .. }
            | Self::SqliteMigrate { stage, .. }
            | Self::SqliteQuery { stage, .. }
            | Self::SqliteThreadSpawn { stage, .. }
            | Self::SqliteRuntimeInit { stage, .. } => *stage,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
