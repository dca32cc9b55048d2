use super::blogs::update_blog_in;
use super::posts::{insert_post_in, update_post_in};
use super::schema::Database;
use super::types::{Blog, DatabaseError, NewPost, Post};

/// What a sync commit wrote.
#[derive(Debug, Clone)]
pub struct CommitSummary {
    /// The blog as stored after the commit (new validators and version)
    pub blog: Blog,
    /// Posts inserted, in the order they were given
    pub inserted: Vec<Post>,
    /// Posts whose URL was already stored by the time the commit ran
    pub skipped: usize,
    /// Stored posts whose content was refreshed
    pub updated: Vec<Post>,
    /// Content refreshes dropped because the post changed or vanished first
    pub stale_updates: usize,
}

impl Database {
    /// Persist one sync cycle atomically.
    ///
    /// In a single transaction: the blog's validators and `synced_at` are
    /// written through the optimistic guard (expected version taken from
    /// `blog.updated_at`), then each new post is inserted and each entry of
    /// `updates` is written through the post guard. A post whose URL already
    /// exists is skipped, and a refresh that hits `Conflict` or `NotFound` is
    /// dropped; neither fails the batch. Any other error rolls back
    /// everything, validators included.
    pub async fn commit_sync(
        &self,
        blog: &Blog,
        etag: &str,
        last_modified: &str,
        posts: &[NewPost],
        updates: &[Post],
    ) -> Result<CommitSummary, DatabaseError> {
        let now = self.now();
        self.timed(async {
            let mut tx = self.pool.begin().await?;

            let blog = update_blog_in(
                &mut tx,
                &Blog {
                    etag: etag.to_string(),
                    last_modified: last_modified.to_string(),
                    synced_at: Some(now),
                    ..blog.clone()
                },
                now,
            )
            .await?;

            let mut inserted = Vec::with_capacity(posts.len());
            let mut skipped = 0;
            for post in posts {
                match insert_post_in(&mut tx, post, now).await? {
                    Some(stored) => inserted.push(stored),
                    None => {
                        tracing::debug!(blog_id = blog.id, url = %post.url, "Post already exists, skipping");
                        skipped += 1;
                    }
                }
            }

            let mut updated = Vec::with_capacity(updates.len());
            let mut stale_updates = 0;
            for post in updates {
                match update_post_in(&mut tx, post, now).await {
                    Ok(stored) => updated.push(stored),
                    Err(DatabaseError::Conflict | DatabaseError::NotFound) => stale_updates += 1,
                    Err(e) => return Err(e),
                }
            }

            tx.commit().await?;

            Ok(CommitSummary {
                blog,
                inserted,
                skipped,
                updated,
                stale_updates,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewBlog;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    async fn setup() -> (Database, Blog) {
        let db = Database::open(":memory:").await.unwrap();
        let blog = db
            .create_blog(&NewBlog {
                feed_url: "https://blog.example.com/feed".to_string(),
                site_url: "https://blog.example.com/".to_string(),
                title: "Blog".to_string(),
            })
            .await
            .unwrap();
        (db, blog)
    }

    fn new_post(blog_id: i64, slug: &str) -> NewPost {
        NewPost {
            blog_id,
            url: format!("https://blog.example.com/{}", slug),
            title: slug.to_string(),
            content: String::new(),
            published_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_commit_writes_validators_and_posts() {
        let (db, blog) = setup().await;
        let summary = db
            .commit_sync(
                &blog,
                "\"v1\"",
                "Mon, 01 Jan 2024 00:00:00 GMT",
                &[new_post(blog.id, "a"), new_post(blog.id, "b")],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(summary.inserted.len(), 2);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.blog.etag, "\"v1\"");
        assert!(summary.blog.synced_at.is_some());

        let stored = db.read_blog(blog.id).await.unwrap();
        assert_eq!(stored, summary.blog);
        assert_eq!(db.stored_posts_by_url(blog.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_post_skipped_not_fatal() {
        let (db, blog) = setup().await;
        db.create_post(&new_post(blog.id, "a")).await.unwrap();

        let summary = db
            .commit_sync(
                &blog,
                "",
                "",
                &[new_post(blog.id, "a"), new_post(blog.id, "b")],
                &[],
            )
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        let urls: Vec<&str> = summary.inserted.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["https://blog.example.com/b"]);
    }

    #[tokio::test]
    async fn test_stale_blog_rolls_back_everything() {
        let (db, blog) = setup().await;
        let fresh = db.update_blog(&blog).await.unwrap();

        let err = db
            .commit_sync(&blog, "\"stale\"", "", &[new_post(blog.id, "a")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict));

        assert_eq!(db.read_blog(blog.id).await.unwrap(), fresh);
        assert!(db.stored_posts_by_url(blog.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_failure_rolls_back_validators() {
        let (db, blog) = setup().await;

        // Second post points at a blog that doesn't exist: FK violation
        let err = db
            .commit_sync(
                &blog,
                "\"v1\"",
                "",
                &[new_post(blog.id, "a"), new_post(blog.id + 100, "b")],
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Other(_)));

        let stored = db.read_blog(blog.id).await.unwrap();
        assert_eq!(stored, blog);
        assert!(db.stored_posts_by_url(blog.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_content_refresh_committed_with_blog() {
        let (db, blog) = setup().await;
        let stored = db.create_post(&new_post(blog.id, "a")).await.unwrap();
        let other = db.create_post(&new_post(blog.id, "b")).await.unwrap();
        // Someone else refreshed "b" since it was read
        db.update_post(&other).await.unwrap();

        let summary = db
            .commit_sync(
                &blog,
                "",
                "",
                &[],
                &[
                    Post {
                        content: "new body".to_string(),
                        ..stored.clone()
                    },
                    Post {
                        content: "lost body".to_string(),
                        ..other.clone()
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(summary.updated.len(), 1);
        assert_eq!(summary.stale_updates, 1);
        assert_eq!(db.read_post(stored.id).await.unwrap().content, "new body");
        assert_eq!(db.read_post(other.id).await.unwrap().content, "");
        assert!(db.read_blog(blog.id).await.unwrap().synced_at.is_some());
    }
}
