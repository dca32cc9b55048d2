use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

use super::diff;
use crate::config::Config;
use crate::feed::{
    clean_html, parse_feed, FeedFetcher, FeedPost, FeedRequest, FeedResponse, FetchError,
    ParseError,
};
use crate::storage::{Blog, Database, DatabaseError, NewBlog, NewPost, Post};
use crate::util::validate_feed_url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    /// The feed URL is malformed, answers with a client error, or doesn't
    /// serve a usable feed. Reported to whoever submitted it.
    #[error("Feed is unreachable or invalid: {0}")]
    UnreachableFeed(String),

    /// Transient fetch failure; the next cycle retries
    #[error("Fetch failed: {0}")]
    Fetch(#[source] FetchError),

    #[error("Feed could not be parsed: {0}")]
    Parse(#[from] ParseError),

    /// Another writer updated the blog (or post) first; nothing was written
    #[error("Blog was modified concurrently; nothing written this cycle")]
    Conflict,

    #[error("Blog no longer exists")]
    NotFound,

    #[error("Storage error: {0}")]
    Storage(#[source] DatabaseError),
}

impl From<DatabaseError> for SyncError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Conflict => SyncError::Conflict,
            DatabaseError::NotFound => SyncError::NotFound,
            other => SyncError::Storage(other),
        }
    }
}

impl SyncError {
    /// True for bad input that an interactive caller should reject; false
    /// for failures a later cycle may recover from.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SyncError::UnreachableFeed(_))
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Phases of one blog's sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Start,
    Fetching,
    /// Server answered 304; nothing to write
    Unchanged,
    Fetched,
    Parsing,
    Diffing,
    Persisting,
    Done,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Start => "start",
            SyncState::Fetching => "fetching",
            SyncState::Unchanged => "unchanged",
            SyncState::Fetched => "fetched",
            SyncState::Parsing => "parsing",
            SyncState::Diffing => "diffing",
            SyncState::Persisting => "persisting",
            SyncState::Done => "done",
            SyncState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks and logs the state of a single cycle.
struct Cycle<'a> {
    feed_url: &'a str,
    state: SyncState,
}

impl<'a> Cycle<'a> {
    fn new(feed_url: &'a str) -> Self {
        Self {
            feed_url,
            state: SyncState::Start,
        }
    }

    fn advance(&mut self, to: SyncState) {
        tracing::debug!(blog = %self.feed_url, from = %self.state, to = %to, "Sync transition");
        self.state = to;
    }

    fn fail(&mut self, err: impl Into<SyncError>) -> SyncError {
        let err = err.into();
        tracing::debug!(
            blog = %self.feed_url,
            from = %self.state,
            to = %SyncState::Failed,
            error = %err,
            "Sync transition"
        );
        self.state = SyncState::Failed;
        err
    }
}

/// Result of a cycle that reached `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub blog_id: i64,
    pub feed_url: String,
    pub state: SyncState,
    /// The server answered 304 and nothing was written
    pub not_modified: bool,
    pub new_posts: usize,
    /// New posts that another writer stored first
    pub skipped_duplicates: usize,
    /// Stored posts whose content changed in the feed and was rewritten
    pub updated_posts: usize,
}

// ============================================================================
// Engine
// ============================================================================

/// Runs fetch → parse → diff → persist for one blog at a time.
///
/// Cheap to share behind an `Arc`; all state lives in the database.
#[derive(Clone)]
pub struct SyncEngine {
    db: Database,
    fetcher: FeedFetcher,
    page_fetch_concurrency: usize,
    allow_private_hosts: bool,
}

impl SyncEngine {
    pub fn new(db: Database, fetcher: FeedFetcher, config: &Config) -> Self {
        Self {
            db,
            fetcher,
            page_fetch_concurrency: config.sync.page_fetch_concurrency.max(1),
            allow_private_hosts: config.fetch.allow_private_hosts,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Sync a feed by URL: the interactive entry point.
    ///
    /// Unknown feeds are added (see [`SyncEngine::sync_new_blog`]); known
    /// ones get a regular conditional sync.
    pub async fn sync_blog(&self, feed_url: &str) -> Result<SyncOutcome, SyncError> {
        let url = validate_feed_url(feed_url, self.allow_private_hosts)
            .map_err(|e| SyncError::UnreachableFeed(e.to_string()))?;
        let feed_url = url.as_str();

        match self.db.find_blog_by_feed_url(feed_url).await? {
            Some(blog) => self.sync_existing_blog(&blog).await,
            None => self.sync_new_blog(feed_url).await,
        }
    }

    /// First sync of a feed that has no blog row yet.
    ///
    /// The fetch is unconditional. Anything short of a parseable feed is
    /// `UnreachableFeed`. The blog row is created with empty validators;
    /// the response's validators are only stored by the same commit that
    /// stores its posts.
    pub async fn sync_new_blog(&self, feed_url: &str) -> Result<SyncOutcome, SyncError> {
        let mut cycle = Cycle::new(feed_url);

        cycle.advance(SyncState::Fetching);
        let request = FeedRequest {
            url: feed_url,
            ..FeedRequest::default()
        };
        let response = self.fetcher.fetch_feed(&request).await.map_err(|e| {
            cycle.fail(if e.is_unreachable() {
                SyncError::UnreachableFeed(e.to_string())
            } else {
                SyncError::Fetch(e)
            })
        })?;

        let (body, etag, last_modified) = match response {
            FeedResponse::NotModified { .. } => {
                return Err(cycle.fail(SyncError::UnreachableFeed(
                    "server answered 304 to an unconditional request".to_string(),
                )))
            }
            FeedResponse::Fetched { body, .. } if body.is_empty() => {
                return Err(cycle.fail(SyncError::UnreachableFeed(
                    "empty response body".to_string(),
                )))
            }
            FeedResponse::Fetched {
                body,
                etag,
                last_modified,
            } => (body, etag, last_modified),
        };
        cycle.advance(SyncState::Fetched);

        cycle.advance(SyncState::Parsing);
        let parsed = parse_feed(feed_url, &body)
            .map_err(|e| cycle.fail(SyncError::UnreachableFeed(e.to_string())))?;
        log_skipped(feed_url, &parsed.skipped);

        let new_blog = NewBlog {
            feed_url: feed_url.to_string(),
            site_url: parsed.site_url,
            title: parsed.title,
        };
        let blog = match self.db.create_blog(&new_blog).await {
            Ok(blog) => blog,
            Err(DatabaseError::AlreadyExists) => {
                tracing::debug!(feed_url = %feed_url, "Blog added concurrently, syncing stored row");
                let existing = self
                    .db
                    .find_blog_by_feed_url(feed_url)
                    .await?
                    .ok_or(SyncError::NotFound)?;
                return self.sync_existing_blog(&existing).await;
            }
            Err(e) => return Err(cycle.fail(e)),
        };

        self.diff_and_persist(
            &mut cycle,
            &blog,
            parsed.posts,
            HashMap::new(),
            &etag,
            &last_modified,
        )
        .await
    }

    /// Conditional sync of a tracked blog using its stored validators.
    pub async fn sync_existing_blog(&self, blog: &Blog) -> Result<SyncOutcome, SyncError> {
        let mut cycle = Cycle::new(&blog.feed_url);

        cycle.advance(SyncState::Fetching);
        let request = FeedRequest {
            url: &blog.feed_url,
            etag: &blog.etag,
            last_modified: &blog.last_modified,
        };
        let response = self
            .fetcher
            .fetch_feed(&request)
            .await
            .map_err(|e| cycle.fail(SyncError::Fetch(e)))?;

        let (body, etag, last_modified) = match response {
            FeedResponse::NotModified { .. } => {
                cycle.advance(SyncState::Unchanged);
                cycle.advance(SyncState::Done);
                tracing::debug!(blog_id = blog.id, feed_url = %blog.feed_url, "Feed not modified");
                return Ok(SyncOutcome {
                    blog_id: blog.id,
                    feed_url: blog.feed_url.clone(),
                    state: SyncState::Done,
                    not_modified: true,
                    new_posts: 0,
                    skipped_duplicates: 0,
                    updated_posts: 0,
                });
            }
            FeedResponse::Fetched {
                body,
                etag,
                last_modified,
            } => (body, etag, last_modified),
        };
        cycle.advance(SyncState::Fetched);

        cycle.advance(SyncState::Parsing);
        let parsed = parse_feed(&blog.feed_url, &body).map_err(|e| cycle.fail(e))?;
        log_skipped(&blog.feed_url, &parsed.skipped);

        let stored = self
            .db
            .stored_posts_by_url(blog.id)
            .await
            .map_err(|e| cycle.fail(e))?;

        self.diff_and_persist(&mut cycle, blog, parsed.posts, stored, &etag, &last_modified)
            .await
    }

    /// Re-fetch a post's page and store its content under the post's guard.
    pub async fn refresh_post_content(&self, post: &Post) -> Result<Post, SyncError> {
        let content = self.fetch_page(&post.url).await.map_err(SyncError::Fetch)?;

        let updated = self
            .db
            .update_post(&Post {
                content,
                ..post.clone()
            })
            .await?;

        tracing::info!(post_id = post.id, url = %post.url, "Post content refreshed");
        Ok(updated)
    }

    async fn diff_and_persist(
        &self,
        cycle: &mut Cycle<'_>,
        blog: &Blog,
        feed_posts: Vec<FeedPost>,
        stored: HashMap<String, Post>,
        etag: &str,
        last_modified: &str,
    ) -> Result<SyncOutcome, SyncError> {
        cycle.advance(SyncState::Diffing);
        let changed = diff::changed_posts(&feed_posts, &stored);
        let known: HashSet<String> = stored.into_keys().collect();
        let fresh = diff::new_posts(feed_posts, &known);
        tracing::debug!(
            blog_id = blog.id,
            known = known.len(),
            new = fresh.len(),
            changed = changed.len(),
            "Diff computed"
        );

        cycle.advance(SyncState::Persisting);
        let new_posts = self.prepare_posts(blog.id, fresh).await;
        let summary = self
            .db
            .commit_sync(blog, etag, last_modified, &new_posts, &changed)
            .await
            .map_err(|e| cycle.fail(e))?;

        cycle.advance(SyncState::Done);
        tracing::info!(
            blog_id = blog.id,
            feed_url = %blog.feed_url,
            new_posts = summary.inserted.len(),
            skipped = summary.skipped,
            updated = summary.updated.len(),
            stale_updates = summary.stale_updates,
            "Blog synced"
        );

        Ok(SyncOutcome {
            blog_id: blog.id,
            feed_url: blog.feed_url.clone(),
            state: cycle.state,
            not_modified: false,
            new_posts: summary.inserted.len(),
            skipped_duplicates: summary.skipped,
            updated_posts: summary.updated.len(),
        })
    }

    /// Sanitize feed content; posts without any are hydrated from their page.
    ///
    /// Page fetches run concurrently up to `page_fetch_concurrency`; output
    /// order matches input order. A failed page fetch stores the post with
    /// empty content rather than failing the cycle, and so does a link the
    /// host policy rejects.
    async fn prepare_posts(&self, blog_id: i64, posts: Vec<FeedPost>) -> Vec<NewPost> {
        stream::iter(posts)
            .map(|post| async move {
                let content = if post.content.trim().is_empty() {
                    match self.fetch_page(&post.url).await {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(url = %post.url, error = %e, "Page fetch failed, storing post without content");
                            String::new()
                        }
                    }
                } else {
                    clean_html(&post.content)
                };

                NewPost {
                    blog_id,
                    url: post.url,
                    title: post.title,
                    content,
                    published_at: post.published_at,
                }
            })
            .buffered(self.page_fetch_concurrency)
            .collect()
            .await
    }

    /// Post links come from the feed, so they pass the same host check as
    /// feed URLs before any request is made.
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        validate_feed_url(url, self.allow_private_hosts)?;
        self.fetcher.fetch_page(url).await
    }
}

fn log_skipped(feed_url: &str, skipped: &crate::feed::SkippedItems) {
    if skipped.total() > 0 {
        tracing::warn!(
            feed_url = %feed_url,
            missing_link = skipped.missing_link,
            missing_title = skipped.missing_title,
            missing_timestamp = skipped.missing_timestamp,
            duplicate_url = skipped.duplicate_url,
            "Feed items skipped"
        );
    }
}
