use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// No row with the given id (or key)
    #[error("Record not found")]
    NotFound,

    /// Optimistic concurrency check failed: the row changed since it was read
    #[error("Record was modified concurrently; reload and retry")]
    Conflict,

    /// Unique constraint violated (feed URL, post URL, tag name)
    #[error("Record already exists")]
    AlreadyExists,

    /// Operation exceeded the configured database timeout
    #[error("Database operation timed out")]
    Timeout,

    /// Input rejected before reaching the database
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Another process has the database locked
    #[error("Another blogroll process appears to hold the database lock. Please stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(sqlx::Error),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx(err)
    }
}

impl DatabaseError {
    /// Classify a sqlx error: missing rows, unique violations and lock
    /// contention get their own variants.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => return DatabaseError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                return DatabaseError::AlreadyExists
            }
            _ => {}
        }

        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Timestamps are stored as Unix microseconds.
pub(crate) fn to_micros(t: DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// Next `updated_at` for a guarded update. Always moves forward, even when
/// the clock hasn't ticked since the previous write.
pub(crate) fn next_version(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    now.max(previous + Duration::microseconds(1))
}

// ============================================================================
// Search Index Consistency Report
// ============================================================================

/// Result of comparing the `posts` table with its FTS5 index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchConsistencyReport {
    pub posts_count: i64,
    pub indexed_count: i64,
    /// FTS entries with no corresponding post
    pub orphaned_entries: i64,
    /// Posts with no FTS entry
    pub missing_entries: i64,
    pub is_consistent: bool,
}

// ============================================================================
// Data Structures
// ============================================================================

/// A tracked blog and the cache validators from its last successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blog {
    pub id: i64,
    pub feed_url: String,
    pub site_url: String,
    pub title: String,
    /// `ETag` from the last fetch, "" if the server sent none
    pub etag: String,
    /// `Last-Modified` from the last fetch, "" if the server sent none
    pub last_modified: String,
    /// None until the first successful sync commits
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Version for optimistic concurrency; pass it back unchanged on update
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlog {
    pub feed_url: String,
    pub site_url: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: i64,
    pub blog_id: i64,
    pub url: String,
    pub title: String,
    /// Plain text, already sanitized
    pub content: String,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub blog_id: i64,
    pub url: String,
    pub title: String,
    pub content: String,
    pub published_at: DateTime<Utc>,
}

/// A vocabulary entry. Tags are matched against post text at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Read projection of a post for listing and search results.
#[derive(Debug, Clone, PartialEq)]
pub struct Article {
    pub post_id: i64,
    pub blog_id: i64,
    pub url: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub blog_title: String,
    pub blog_site_url: String,
    /// Best-matching vocabulary tags, highest score first
    pub tags: Vec<String>,
    /// Relevance when produced by a search (higher is better)
    pub score: Option<f64>,
}

// ============================================================================
// Row Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct BlogRow {
    pub id: i64,
    pub feed_url: String,
    pub site_url: String,
    pub title: String,
    pub etag: String,
    pub last_modified: String,
    pub synced_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl BlogRow {
    pub(crate) fn into_blog(self) -> Blog {
        Blog {
            id: self.id,
            feed_url: self.feed_url,
            site_url: self.site_url,
            title: self.title,
            etag: self.etag,
            last_modified: self.last_modified,
            synced_at: self.synced_at.map(from_micros),
            created_at: from_micros(self.created_at),
            updated_at: from_micros(self.updated_at),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct PostRow {
    pub id: i64,
    pub blog_id: i64,
    pub url: String,
    pub title: String,
    pub content: String,
    pub published_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PostRow {
    pub(crate) fn into_post(self) -> Post {
        Post {
            id: self.id,
            blog_id: self.blog_id,
            url: self.url,
            title: self.title,
            content: self.content,
            published_at: from_micros(self.published_at),
            created_at: from_micros(self.created_at),
            updated_at: from_micros(self.updated_at),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TagRow {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TagRow {
    pub(crate) fn into_tag(self) -> Tag {
        Tag {
            id: self.id,
            name: self.name,
            created_at: from_micros(self.created_at),
            updated_at: from_micros(self.updated_at),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleRow {
    pub post_id: i64,
    pub blog_id: i64,
    pub url: String,
    pub title: String,
    pub published_at: i64,
    pub blog_title: String,
    pub blog_site_url: String,
    pub score: Option<f64>,
}

impl ArticleRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            post_id: self.post_id,
            blog_id: self.blog_id,
            url: self.url,
            title: self.title,
            published_at: from_micros(self.published_at),
            blog_title: self.blog_title,
            blog_site_url: self.blog_site_url,
            tags: Vec::new(),
            score: self.score,
        }
    }
}
