use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use super::engine::{SyncEngine, SyncError, SyncOutcome};
use crate::config::SyncConfig;
use crate::storage::Blog;

/// Totals for one scheduled pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Blogs tracked when the pass started
    pub total: usize,
    /// Synced within `resync_after`, left alone
    pub skipped_recent: usize,
    /// Cycles that reached `Done` with new content
    pub synced: usize,
    /// Cycles that ended with a 304
    pub unchanged: usize,
    pub failed: usize,
    pub new_posts: usize,
    /// Another pass was still running; this one did nothing
    pub already_running: bool,
}

/// Periodically syncs every tracked blog with bounded concurrency.
///
/// A failing blog is logged and counted; it never aborts the pass or
/// affects its siblings. Passes never overlap.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    config: SyncConfig,
    running: Mutex<()>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, config: SyncConfig) -> Self {
        Self {
            engine,
            config,
            running: Mutex::new(()),
        }
    }

    /// Run one pass over all blogs not synced within `resync_after`.
    ///
    /// Returns early with `already_running` set if a pass is in progress.
    /// Only a failure to list blogs is an error.
    pub async fn sync_all(&self) -> Result<PassReport, SyncError> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::info!("Sync pass already running, skipping");
            return Ok(PassReport {
                already_running: true,
                ..PassReport::default()
            });
        };

        let db = self.engine.database();
        let pass_start = db.now();
        let blogs = db.list_blogs().await?;
        // A blog's last commit lands a little after its pass started, so
        // the window gets slack or it would miss every other tick.
        let slack = self.config.resync_after().min(self.config.interval_chrono()) / 10;
        let cutoff = pass_start - self.config.resync_after() + slack;

        let mut report = PassReport {
            total: blogs.len(),
            ..PassReport::default()
        };

        let due: Vec<Blog> = blogs
            .into_iter()
            .filter(|blog| match blog.synced_at {
                Some(synced_at) if synced_at > cutoff => {
                    report.skipped_recent += 1;
                    false
                }
                _ => true,
            })
            .collect();

        tracing::info!(
            due = due.len(),
            skipped_recent = report.skipped_recent,
            max_concurrent = self.config.max_concurrent,
            "Starting sync pass"
        );

        let engine = &self.engine;
        let results: Vec<(Blog, Result<SyncOutcome, SyncError>)> = stream::iter(due)
            .map(|blog| async move {
                let result = engine.sync_existing_blog(&blog).await;
                (blog, result)
            })
            .buffer_unordered(self.config.max_concurrent.max(1))
            .collect()
            .await;

        for (blog, result) in results {
            match result {
                Ok(outcome) if outcome.not_modified => report.unchanged += 1,
                Ok(outcome) => {
                    report.synced += 1;
                    report.new_posts += outcome.new_posts;
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        blog_id = blog.id,
                        feed_url = %blog.feed_url,
                        error = %e,
                        "Blog sync failed"
                    );
                }
            }
        }

        tracing::info!(
            synced = report.synced,
            unchanged = report.unchanged,
            failed = report.failed,
            new_posts = report.new_posts,
            "Sync pass complete"
        );
        Ok(report)
    }

    /// Run passes every `interval` until `shutdown` flips to true or its
    /// sender is dropped. A pass in flight finishes before the loop exits.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if !self.config.run_on_startup {
            // The first tick completes immediately
            ticker.tick().await;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.sync_all().await {
                        tracing::warn!(error = %e, "Sync pass failed");
                    }
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }
}
