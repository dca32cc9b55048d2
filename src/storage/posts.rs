use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use std::collections::HashMap;

use super::schema::Database;
use super::types::{next_version, to_micros, DatabaseError, NewPost, Post, PostRow};

const POST_COLUMNS: &str = "id, blog_id, url, title, content, published_at, created_at, updated_at";

impl Database {
    // ========================================================================
    // Post Operations
    // ========================================================================

    /// Returns `AlreadyExists` if a post with the same URL is stored.
    pub async fn create_post(&self, post: &NewPost) -> Result<Post, DatabaseError> {
        let now = self.now();
        self.timed(async {
            let mut conn = self.pool.acquire().await?;
            insert_post_in(&mut conn, post, now)
                .await?
                .ok_or(DatabaseError::AlreadyExists)
        })
        .await
    }

    pub async fn read_post(&self, id: i64) -> Result<Post, DatabaseError> {
        self.timed(async {
            let row = sqlx::query_as::<_, PostRow>(&format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE id = ?"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(PostRow::into_post).ok_or(DatabaseError::NotFound)
        })
        .await
    }

    pub async fn find_post_by_url(&self, url: &str) -> Result<Option<Post>, DatabaseError> {
        self.timed(async {
            let row = sqlx::query_as::<_, PostRow>(&format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE url = ?"
            ))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(PostRow::into_post))
        })
        .await
    }

    /// A blog's posts, newest first.
    pub async fn list_posts_for_blog(&self, blog_id: i64) -> Result<Vec<Post>, DatabaseError> {
        self.timed(async {
            let rows = sqlx::query_as::<_, PostRow>(&format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE blog_id = ? \
                 ORDER BY published_at DESC, id DESC"
            ))
            .bind(blog_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(PostRow::into_post).collect())
        })
        .await
    }

    /// A blog's stored posts keyed by URL: the "known" side of a sync diff.
    pub async fn stored_posts_by_url(
        &self,
        blog_id: i64,
    ) -> Result<HashMap<String, Post>, DatabaseError> {
        self.timed(async {
            let rows = sqlx::query_as::<_, PostRow>(&format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE blog_id = ?"
            ))
            .bind(blog_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows
                .into_iter()
                .map(PostRow::into_post)
                .map(|post| (post.url.clone(), post))
                .collect())
        })
        .await
    }

    /// Guarded post update; same contract as [`Database::update_blog`].
    pub async fn update_post(&self, post: &Post) -> Result<Post, DatabaseError> {
        let now = self.now();
        self.timed(async {
            let mut conn = self.pool.acquire().await?;
            update_post_in(&mut conn, post, now).await
        })
        .await
    }

    pub async fn delete_post(&self, id: i64) -> Result<(), DatabaseError> {
        self.timed(async {
            let result = sqlx::query("DELETE FROM posts WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(DatabaseError::NotFound);
            }
            Ok(())
        })
        .await
    }
}

/// Insert one post, or `None` if its URL is already stored.
pub(crate) async fn insert_post_in(
    conn: &mut SqliteConnection,
    post: &NewPost,
    now: DateTime<Utc>,
) -> Result<Option<Post>, DatabaseError> {
    let now = to_micros(now);
    let row = sqlx::query_as::<_, PostRow>(&format!(
        "INSERT INTO posts (blog_id, url, title, content, published_at, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(url) DO NOTHING \
         RETURNING {POST_COLUMNS}"
    ))
    .bind(post.blog_id)
    .bind(&post.url)
    .bind(&post.title)
    .bind(&post.content)
    .bind(to_micros(post.published_at))
    .bind(now)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(PostRow::into_post))
}

/// Guarded post update on an existing connection or transaction.
pub(crate) async fn update_post_in(
    conn: &mut SqliteConnection,
    post: &Post,
    now: DateTime<Utc>,
) -> Result<Post, DatabaseError> {
    let next = next_version(post.updated_at, now);

    let result = sqlx::query(
        r#"
        UPDATE posts
        SET url = ?, title = ?, content = ?, published_at = ?, updated_at = ?
        WHERE id = ? AND updated_at = ?
    "#,
    )
    .bind(&post.url)
    .bind(&post.title)
    .bind(&post.content)
    .bind(to_micros(post.published_at))
    .bind(to_micros(next))
    .bind(post.id)
    .bind(to_micros(post.updated_at))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM posts WHERE id = ?")
            .bind(post.id)
            .fetch_optional(&mut *conn)
            .await?;
        return Err(if exists.is_some() {
            tracing::debug!(post_id = post.id, "Post update rejected: stale version");
            DatabaseError::Conflict
        } else {
            tracing::debug!(post_id = post.id, "Post update rejected: post deleted");
            DatabaseError::NotFound
        });
    }

    Ok(Post {
        updated_at: next,
        ..post.clone()
    })
}
