use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{next_version, to_micros, Blog, BlogRow, DatabaseError, NewBlog};
use chrono::{DateTime, Utc};

const BLOG_COLUMNS: &str =
    "id, feed_url, site_url, title, etag, last_modified, synced_at, created_at, updated_at";

impl Database {
    // ========================================================================
    // Blog Operations
    // ========================================================================

    /// Insert a blog with empty validators and no sync timestamp.
    ///
    /// Returns `AlreadyExists` if the feed URL is already tracked.
    pub async fn create_blog(&self, blog: &NewBlog) -> Result<Blog, DatabaseError> {
        let now = to_micros(self.now());
        self.timed(async {
            let row = sqlx::query_as::<_, BlogRow>(&format!(
                "INSERT INTO blogs (feed_url, site_url, title, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?) RETURNING {BLOG_COLUMNS}"
            ))
            .bind(&blog.feed_url)
            .bind(&blog.site_url)
            .bind(&blog.title)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

            tracing::info!(blog_id = row.id, feed_url = %row.feed_url, "Blog created");
            Ok(row.into_blog())
        })
        .await
    }

    pub async fn read_blog(&self, id: i64) -> Result<Blog, DatabaseError> {
        self.timed(async {
            let row = sqlx::query_as::<_, BlogRow>(&format!(
                "SELECT {BLOG_COLUMNS} FROM blogs WHERE id = ?"
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(BlogRow::into_blog).ok_or(DatabaseError::NotFound)
        })
        .await
    }

    pub async fn find_blog_by_feed_url(&self, feed_url: &str) -> Result<Option<Blog>, DatabaseError> {
        self.timed(async {
            let row = sqlx::query_as::<_, BlogRow>(&format!(
                "SELECT {BLOG_COLUMNS} FROM blogs WHERE feed_url = ?"
            ))
            .bind(feed_url)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(BlogRow::into_blog))
        })
        .await
    }

    /// All tracked blogs, alphabetically by title.
    pub async fn list_blogs(&self) -> Result<Vec<Blog>, DatabaseError> {
        self.timed(async {
            let rows = sqlx::query_as::<_, BlogRow>(&format!(
                "SELECT {BLOG_COLUMNS} FROM blogs ORDER BY title COLLATE NOCASE, id"
            ))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(BlogRow::into_blog).collect())
        })
        .await
    }

    /// Write every mutable field of `blog`, guarded by its `updated_at`.
    ///
    /// Fails with `Conflict` if the stored row changed since `blog` was read
    /// and with `NotFound` if it was deleted. In both cases nothing is
    /// written. On success the returned blog carries the new version.
    pub async fn update_blog(&self, blog: &Blog) -> Result<Blog, DatabaseError> {
        let now = self.now();
        self.timed(async {
            let mut conn = self.pool.acquire().await?;
            update_blog_in(&mut conn, blog, now).await
        })
        .await
    }

    /// Remove a blog and, through the foreign key, all of its posts.
    pub async fn delete_blog(&self, id: i64) -> Result<(), DatabaseError> {
        self.timed(async {
            let result = sqlx::query("DELETE FROM blogs WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(DatabaseError::NotFound);
            }
            tracing::info!(blog_id = id, "Blog deleted");
            Ok(())
        })
        .await
    }
}

/// Guarded blog update on an existing connection or transaction.
pub(crate) async fn update_blog_in(
    conn: &mut SqliteConnection,
    blog: &Blog,
    now: DateTime<Utc>,
) -> Result<Blog, DatabaseError> {
    let next = next_version(blog.updated_at, now);

    let result = sqlx::query(
        r#"
        UPDATE blogs
        SET feed_url = ?, site_url = ?, title = ?, etag = ?, last_modified = ?,
            synced_at = ?, updated_at = ?
        WHERE id = ? AND updated_at = ?
    "#,
    )
    .bind(&blog.feed_url)
    .bind(&blog.site_url)
    .bind(&blog.title)
    .bind(&blog.etag)
    .bind(&blog.last_modified)
    .bind(blog.synced_at.map(to_micros))
    .bind(to_micros(next))
    .bind(blog.id)
    .bind(to_micros(blog.updated_at))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM blogs WHERE id = ?")
            .bind(blog.id)
            .fetch_optional(&mut *conn)
            .await?;
        return Err(if exists.is_some() {
            tracing::debug!(blog_id = blog.id, "Blog update rejected: stale version");
            DatabaseError::Conflict
        } else {
            tracing::debug!(blog_id = blog.id, "Blog update rejected: blog deleted");
            DatabaseError::NotFound
        });
    }

    Ok(Blog {
        updated_at: next,
        ..blog.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::DatabaseOptions;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn test_db() -> (Database, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let db = Database::open_with(
            ":memory:",
            DatabaseOptions {
                clock: clock.clone(),
                ..DatabaseOptions::default()
            },
        )
        .await
        .unwrap();
        (db, clock)
    }

    fn new_blog(n: u32) -> NewBlog {
        NewBlog {
            feed_url: format!("https://blog{}.example.com/feed.xml", n),
            site_url: format!("https://blog{}.example.com/", n),
            title: format!("Blog {}", n),
        }
    }

    #[tokio::test]
    async fn test_create_and_read_blog() {
        let (db, _) = test_db().await;
        let blog = db.create_blog(&new_blog(1)).await.unwrap();

        assert_eq!(blog.etag, "");
        assert_eq!(blog.last_modified, "");
        assert_eq!(blog.synced_at, None);
        assert_eq!(blog.created_at, blog.updated_at);

        let read = db.read_blog(blog.id).await.unwrap();
        assert_eq!(read, blog);

        let found = db
            .find_blog_by_feed_url("https://blog1.example.com/feed.xml")
            .await
            .unwrap();
        assert_eq!(found, Some(blog));
    }

    #[tokio::test]
    async fn test_duplicate_feed_url_already_exists() {
        let (db, _) = test_db().await;
        db.create_blog(&new_blog(1)).await.unwrap();
        let err = db.create_blog(&new_blog(1)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::AlreadyExists));
    }

    #[tokio::test]
    async fn test_read_missing_blog_not_found() {
        let (db, _) = test_db().await;
        assert!(matches!(
            db.read_blog(42).await,
            Err(DatabaseError::NotFound)
        ));
        assert_eq!(db.find_blog_by_feed_url("https://nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_blog_advances_version() {
        let (db, clock) = test_db().await;
        let blog = db.create_blog(&new_blog(1)).await.unwrap();

        clock.advance(Duration::seconds(10));
        let updated = db
            .update_blog(&Blog {
                etag: "\"abc\"".to_string(),
                ..blog.clone()
            })
            .await
            .unwrap();

        assert_eq!(updated.etag, "\"abc\"");
        assert!(updated.updated_at > blog.updated_at);
        assert_eq!(db.read_blog(blog.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_update_within_same_tick_still_advances() {
        let (db, _) = test_db().await;
        let blog = db.create_blog(&new_blog(1)).await.unwrap();

        // Clock does not move between these updates
        let first = db.update_blog(&blog).await.unwrap();
        let second = db.update_blog(&first).await.unwrap();
        assert!(first.updated_at > blog.updated_at);
        assert!(second.updated_at > first.updated_at);

        // The original version is now stale
        assert!(matches!(
            db.update_blog(&blog).await,
            Err(DatabaseError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_stale_update_never_mutates_row() {
        let (db, clock) = test_db().await;
        let blog = db.create_blog(&new_blog(1)).await.unwrap();

        clock.advance(Duration::seconds(1));
        let winner = db
            .update_blog(&Blog {
                title: "Winner".to_string(),
                ..blog.clone()
            })
            .await
            .unwrap();

        clock.advance(Duration::seconds(1));
        let err = db
            .update_blog(&Blog {
                title: "Loser".to_string(),
                ..blog.clone()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict));

        assert_eq!(db.read_blog(blog.id).await.unwrap(), winner);
    }

    #[tokio::test]
    async fn test_update_deleted_blog_not_found() {
        let (db, _) = test_db().await;
        let blog = db.create_blog(&new_blog(1)).await.unwrap();
        db.delete_blog(blog.id).await.unwrap();

        assert!(matches!(
            db.update_blog(&blog).await,
            Err(DatabaseError::NotFound)
        ));
        assert!(matches!(
            db.delete_blog(blog.id).await,
            Err(DatabaseError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_update_to_taken_feed_url_already_exists() {
        let (db, _) = test_db().await;
        let a = db.create_blog(&new_blog(1)).await.unwrap();
        let b = db.create_blog(&new_blog(2)).await.unwrap();

        let err = db
            .update_blog(&Blog {
                feed_url: a.feed_url.clone(),
                ..b
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::AlreadyExists));
    }

    #[tokio::test]
    async fn test_list_blogs_sorted_by_title() {
        let (db, _) = test_db().await;
        db.create_blog(&NewBlog {
            title: "zebra".to_string(),
            ..new_blog(1)
        })
        .await
        .unwrap();
        db.create_blog(&NewBlog {
            title: "Aardvark".to_string(),
            ..new_blog(2)
        })
        .await
        .unwrap();

        let titles: Vec<String> = db
            .list_blogs()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.title)
            .collect();
        assert_eq!(titles, vec!["Aardvark", "zebra"]);
    }
}
