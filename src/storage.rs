//! Embedded SQLite persistence: connection lifecycle, pooling, and pragma
//! tuning, shared by the process table (§3), counter store (§3), and user
//! table (§3).
//!
//! Architecture carried over unchanged from the teacher's `database.rs`:
//! functional core (path/config validation, connection-string generation)
//! separated from imperative shell (filesystem, pool creation, migrations).

use crate::domain_types::ConnectionPoolSize;
use nutype::nutype;
use sqlx::migrate::Migrator;
use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Persistence-layer errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A `sqlx` query failed.
    #[error("database error: {0}")]
    Database(#[source] SqlxErrorText),

    /// A filesystem operation (directory creation) failed.
    #[error("file system error: {message}")]
    FileSystem {
        /// What went wrong.
        message: String,
    },

    /// The supplied [`DatabaseConfig`] was invalid.
    #[error("configuration error: {field} - {reason}")]
    Configuration {
        /// The field that failed validation.
        field: String,
        /// Why it failed.
        reason: String,
    },

    /// The connection pool could not be created.
    #[error("connection pool error: {message}")]
    ConnectionPool {
        /// What went wrong.
        message: String,
    },

    /// Embedded migrations failed to apply.
    #[error("migration failed: {message}")]
    Migration {
        /// What went wrong.
        message: String,
    },
}

/// Wraps a `sqlx::Error`'s text so [`StorageError`] can stay
/// `Clone + PartialEq + Eq` (a raw `sqlx::Error` is neither).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlxErrorText(pub String);

impl std::fmt::Display for SqlxErrorText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for SqlxErrorText {}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Database(SqlxErrorText(e.to_string()))
    }
}

/// Convenience alias for persistence-layer results.
pub type StorageResult<T> = Result<T, StorageError>;

/// A validated path to a sqlite database file, or the special in-memory
/// marker `":memory:"`.
///
/// The teacher's original validator required a `.db` extension
/// unconditionally; this widens the predicate to also accept the sqlite
/// in-memory sentinel, since unit tests across this crate open ephemeral
/// in-memory databases rather than real files.
#[nutype(
    sanitize(with = |path: PathBuf| path),
    validate(predicate = |path| is_memory_marker(path) || (!path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db"))),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

fn is_memory_marker(path: &Path) -> bool {
    path == Path::new(":memory:")
}

impl DatabasePath {
    /// Validate a path; accepts any `.db`-suffixed path or `":memory:"`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Configuration`] if the path is empty or has
    /// neither a `.db` extension nor the `:memory:` marker.
    pub fn new<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        Self::try_new(path_buf).map_err(|_| StorageError::Configuration {
            field: "database_path".to_string(),
            reason: "path must be \":memory:\" or have a .db extension".to_string(),
        })
    }

    /// The underlying path.
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// The sqlite connection URI for this path.
    pub fn to_connection_string(&self) -> String {
        if is_memory_marker(&self.as_path()) {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", self.as_path().display())
        }
    }

    /// Parent directory to create before opening, if any (in-memory
    /// databases have none).
    pub fn parent_directory(&self) -> Option<PathBuf> {
        if is_memory_marker(&self.as_path()) {
            None
        } else {
            self.as_path().parent().map(Path::to_path_buf)
        }
    }

    /// Whether the backing file currently exists on disk.
    pub fn exists(&self) -> bool {
        !is_memory_marker(&self.as_path()) && self.as_path().exists()
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Pool and pragma settings for a sqlite connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    path: DatabasePath,
    pool_size: ConnectionPoolSize,
    enable_wal_mode: bool,
    enable_foreign_keys: bool,
}

impl DatabaseConfig {
    /// Production defaults: pooled connections, WAL mode, foreign keys on.
    pub fn new(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::default(),
            enable_wal_mode: true,
            enable_foreign_keys: true,
        }
    }

    /// Minimal settings appropriate for an ephemeral test database.
    ///
    /// # Panics
    ///
    /// Panics if a pool size of 1 is somehow rejected (never happens: 1 is
    /// always within `ConnectionPoolSize`'s valid range).
    pub fn for_testing(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::try_new(1).expect("pool size 1 is always valid"),
            enable_wal_mode: false,
            enable_foreign_keys: false,
        }
    }

    /// Override the connection pool size.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: ConnectionPoolSize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Override WAL mode.
    #[must_use]
    pub fn with_wal_mode(mut self, enable: bool) -> Self {
        self.enable_wal_mode = enable;
        self
    }

    /// Override foreign-key enforcement.
    #[must_use]
    pub fn with_foreign_keys(mut self, enable: bool) -> Self {
        self.enable_foreign_keys = enable;
        self
    }

    /// The configured path.
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    /// The configured pool size.
    pub fn pool_size(&self) -> ConnectionPoolSize {
        self.pool_size
    }

    /// Whether WAL mode is enabled.
    pub fn wal_mode_enabled(&self) -> bool {
        self.enable_wal_mode
    }

    /// Whether foreign-key enforcement is enabled.
    pub fn foreign_keys_enabled(&self) -> bool {
        self.enable_foreign_keys
    }

    /// Validate this configuration before opening a pool.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Configuration`] if the pool size is zero.
    pub fn validate(&self) -> StorageResult<()> {
        if self.pool_size.as_usize() == 0 {
            return Err(StorageError::Configuration {
                field: "pool_size".to_string(),
                reason: "pool size must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// An open, migrated sqlite connection pool.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
    config: DatabaseConfig,
}

impl DatabaseConnection {
    fn create_connect_options(config: &DatabaseConfig) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::sqlite::SqliteConnectOptions;
        use sqlx::ConnectOptions;
        use std::str::FromStr;

        let mut options = SqliteConnectOptions::from_str(&config.path().to_connection_string())
            .expect("connection string is always well-formed")
            .create_if_missing(true);

        if config.wal_mode_enabled() {
            options = options.pragma("journal_mode", "WAL");
        }
        if config.foreign_keys_enabled() {
            options = options.pragma("foreign_keys", "ON");
        }
        options.disable_statement_logging()
    }

    /// Open (creating if missing), pragma-tune, and migrate a database.
    ///
    /// # Errors
    ///
    /// Returns an error if validation, directory creation, pool creation,
    /// or migration fails.
    pub async fn initialize(config: DatabaseConfig) -> StorageResult<Self> {
        config.validate()?;
        Self::ensure_parent_directory_exists(&config).await?;
        let pool = Self::create_connection_pool(&config).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool, config })
    }

    async fn ensure_parent_directory_exists(config: &DatabaseConfig) -> StorageResult<()> {
        if let Some(parent) = config.path().parent_directory() {
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| StorageError::FileSystem {
                    message: format!("failed to create directory {}: {e}", parent.display()),
                })?;
        }
        Ok(())
    }

    async fn create_connection_pool(config: &DatabaseConfig) -> StorageResult<Pool<Sqlite>> {
        let options = Self::create_connect_options(config);
        SqlitePool::connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionPool {
                message: format!("failed to create connection pool: {e}"),
            })
    }

    async fn run_migrations(pool: &Pool<Sqlite>) -> StorageResult<()> {
        info!("running embedded migrations");
        match MIGRATOR.run(pool).await {
            Ok(()) => {
                info!("migrations applied");
                Ok(())
            }
            Err(e) => {
                warn!("migration failed: {e}");
                Err(StorageError::Migration {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Whether the backing file exists (always false for `:memory:`).
    pub fn database_file_exists(&self) -> bool {
        self.config.path().exists()
    }

    /// Round-trip a trivial query to confirm the pool is live.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn test_connection(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// The configuration this connection was opened with.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn accepts_memory_marker_and_db_extension() {
        assert!(DatabasePath::new(":memory:").is_ok());
        assert!(DatabasePath::new("test.db").is_ok());
    }

    #[test]
    fn rejects_empty_path_and_wrong_extension() {
        assert!(DatabasePath::new("").is_err());
        assert!(DatabasePath::new("test.txt").is_err());
    }

    #[test]
    fn memory_marker_has_no_parent_directory() {
        let path = DatabasePath::new(":memory:").unwrap();
        assert!(path.parent_directory().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn initializes_an_in_memory_database_and_runs_migrations() {
        let path = DatabasePath::new(":memory:").unwrap();
        let config = DatabaseConfig::for_testing(path);
        let conn = DatabaseConnection::initialize(config).await.unwrap();
        conn.test_connection().await.unwrap();

        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='users'",
        )
        .fetch_one(conn.pool())
        .await
        .unwrap();
        assert_eq!(exists, 1);
    }

    #[tokio::test]
    async fn initializes_a_file_backed_database() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let path = DatabasePath::new(db_path).unwrap();
        let config = DatabaseConfig::for_testing(path);

        let conn = DatabaseConnection::initialize(config).await.unwrap();
        assert!(conn.database_file_exists());
    }
}
