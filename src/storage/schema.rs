use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::types::DatabaseError;
use crate::clock::{self, Clock};
use crate::config::Config;

// ============================================================================
// Database
// ============================================================================

/// Knobs for [`Database::open_with`].
#[derive(Clone)]
pub struct DatabaseOptions {
    pub clock: Arc<dyn Clock>,
    /// Upper bound on any single operation
    pub timeout: Duration,
    /// Tags attached to each listed/searched article
    pub max_tags_per_article: usize,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            clock: clock::system(),
            timeout: Duration::from_secs(3),
            max_tags_per_article: 3,
        }
    }
}

impl DatabaseOptions {
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            timeout: config.database.timeout(),
            max_tags_per_article: config.search.max_tags_per_article,
        }
    }
}

/// Shared handle to the SQLite store. Clones share the pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    pub(crate) max_tags_per_article: usize,
}

impl Database {
    /// Open with default options (system clock, 3s timeout).
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        Self::open_with(path, DatabaseOptions::default()).await
    }

    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database that lives as long as
    /// the returned handle (and its clones).
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database lock (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if the schema could not be created.
    pub async fn open_with(path: &str, options: DatabaseOptions) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path)
        };

        // busy_timeout: SQLite waits for locks held by other writers before
        // returning SQLITE_BUSY. Set per connection so every pooled
        // connection inherits it.
        let options_sqlite = SqliteConnectOptions::from_str(&url)?
            .pragma("busy_timeout", "5000")
            .foreign_keys(true);

        // An in-memory database exists only while a connection to it is
        // open, so it gets exactly one connection that is never recycled.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options_sqlite)
            .await?;

        let db = Self {
            pool,
            clock: options.clock,
            timeout: options.timeout,
            max_tags_per_article: options.max_tags_per_article,
        };

        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::InstanceLocked => DatabaseError::InstanceLocked,
            other => DatabaseError::Migration(other.to_string()),
        })?;

        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Current time from the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Run one database operation under the configured timeout.
    pub(crate) async fn timed<T, F>(&self, op: F) -> Result<T, DatabaseError>
    where
        F: Future<Output = Result<T, DatabaseError>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Database operation timed out"
                );
                Err(DatabaseError::Timeout)
            }
        }
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. SQLite supports DDL inside transactions, so a
    /// failed migration leaves the previous schema intact.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blogs (
                id INTEGER PRIMARY KEY,
                feed_url TEXT NOT NULL UNIQUE,
                site_url TEXT NOT NULL,
                title TEXT NOT NULL,
                etag TEXT NOT NULL DEFAULT '',
                last_modified TEXT NOT NULL DEFAULT '',
                synced_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY,
                blog_id INTEGER NOT NULL REFERENCES blogs(id) ON DELETE CASCADE,
                url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                published_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_posts_blog ON posts(blog_id)")
            .execute(&mut *tx)
            .await?;

        // Listing order: newest first, id as tie-breaker
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_posts_published ON posts(published_at DESC, id DESC)",
        )
        .execute(&mut *tx)
        .await?;

        // External-content FTS5 index over each post's document
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS posts_fts
            USING fts5(title, content, content=posts, content_rowid=id, tokenize='porter unicode61')
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS posts_fts_insert AFTER INSERT ON posts BEGIN
                INSERT INTO posts_fts(rowid, title, content)
                VALUES (new.id, new.title, new.content);
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS posts_fts_delete AFTER DELETE ON posts BEGIN
                INSERT INTO posts_fts(posts_fts, rowid, title, content)
                VALUES ('delete', old.id, old.title, old.content);
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS posts_fts_update AFTER UPDATE OF title, content ON posts BEGIN
                INSERT INTO posts_fts(posts_fts, rowid, title, content)
                VALUES ('delete', old.id, old.title, old.content);
                INSERT INTO posts_fts(rowid, title, content)
                VALUES (new.id, new.title, new.content);
            END
        "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
