use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

use blogroll::clock;
use blogroll::config::Config;
use blogroll::feed::FeedFetcher;
use blogroll::storage::{Article, Database, DatabaseError, DatabaseOptions};
use blogroll::sync::{Scheduler, SyncEngine};
use blogroll::util::normalize_url;

/// Get the default config file path (~/.config/blogroll/config.toml)
fn default_config_path() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("blogroll")
        .join("config.toml"))
}

#[derive(Parser, Debug)]
#[command(name = "blogroll", version, about = "Blog feed sync and search")]
struct Args {
    /// Config file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overrides `database_path` from the config
    #[arg(long, global = true, value_name = "FILE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a feed, or sync it now if it's already tracked
    Sync {
        #[arg(value_name = "FEED_URL")]
        url: String,
    },
    /// Run one sync pass over every tracked blog
    SyncAll,
    /// Re-fetch a stored post's page and replace its content
    RefreshPost {
        #[arg(value_name = "POST_URL")]
        url: String,
    },
    /// Sync on the configured interval until interrupted
    Run,
    /// List articles, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Full-text search over titles and content
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Manage the tag vocabulary
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },
    /// Rebuild the search index (FTS5)
    RebuildSearch,
}

#[derive(Subcommand, Debug)]
enum TagAction {
    Add { name: String },
    Remove { name: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("blogroll=info")),
        )
        .init();

    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if let Some(database) = args.database {
        config.database_path = database;
    }

    let db_path = config
        .database_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let options = DatabaseOptions::from_config(&config, clock::system());
    let db = match Database::open_with(db_path, options).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: The database is locked by another blogroll process.");
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match args.command {
        Command::Sync { url } => {
            let engine = build_engine(db.clone(), &config)?;
            match engine.sync_blog(&url).await {
                Ok(outcome) if outcome.not_modified => {
                    println!("{}: not modified", outcome.feed_url);
                }
                Ok(outcome) => {
                    println!(
                        "{}: {} new posts ({} already stored), {} updated",
                        outcome.feed_url,
                        outcome.new_posts,
                        outcome.skipped_duplicates,
                        outcome.updated_posts
                    );
                }
                Err(e) if e.is_unreachable() => {
                    eprintln!("Error: {}", e);
                    std::process::exit(2);
                }
                Err(e) => return Err(e).context("Sync failed"),
            }
        }
        Command::SyncAll => {
            let engine = Arc::new(build_engine(db.clone(), &config)?);
            let scheduler = Scheduler::new(engine, config.sync.clone());
            let report = scheduler.sync_all().await.context("Sync pass failed")?;
            println!(
                "{} blogs: {} synced, {} unchanged, {} failed, {} skipped; {} new posts",
                report.total,
                report.synced,
                report.unchanged,
                report.failed,
                report.skipped_recent,
                report.new_posts
            );
        }
        Command::RefreshPost { url } => {
            let url = normalize_url(&url).unwrap_or(url);
            let post = match db.find_post_by_url(&url).await? {
                Some(post) => post,
                None => {
                    eprintln!("Error: no stored post with URL {}", url);
                    std::process::exit(2);
                }
            };
            let engine = build_engine(db.clone(), &config)?;
            let post = engine
                .refresh_post_content(&post)
                .await
                .context("Refresh failed")?;
            println!("{}: {} characters of content", post.url, post.content.len());
        }
        Command::Run => {
            let engine = Arc::new(build_engine(db.clone(), &config)?);
            let scheduler = Scheduler::new(engine, config.sync.clone());
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                wait_for_shutdown().await;
                let _ = shutdown_tx.send(true);
            });
            tracing::info!(
                interval_minutes = config.sync.interval_minutes,
                max_concurrent = config.sync.max_concurrent,
                "Scheduler started"
            );
            scheduler.run(shutdown_rx).await;
        }
        Command::List { limit, offset } => {
            let articles = db.list_articles(limit, offset).await?;
            let total = db.count_articles().await?;
            print_articles(&articles);
            println!("({} of {})", articles.len(), total);
        }
        Command::Search {
            query,
            limit,
            offset,
        } => {
            let articles = db.search_articles(&query, limit, offset).await?;
            let total = db.count_search(&query).await?;
            print_articles(&articles);
            println!("({} of {} matches)", articles.len(), total);
        }
        Command::Tag { action } => match action {
            TagAction::Add { name } => {
                let tag = db.create_tag(&name).await.context("Failed to add tag")?;
                println!("Added tag '{}'", tag.name);
            }
            TagAction::Remove { name } => {
                db.delete_tag(&name).await.context("Failed to remove tag")?;
                println!("Removed tag '{}'", name);
            }
            TagAction::List => {
                for tag in db.list_tags().await? {
                    println!("{}", tag.name);
                }
            }
        },
        Command::RebuildSearch => {
            tracing::info!("Rebuilding search index...");
            let count = db
                .rebuild_search_index()
                .await
                .context("Failed to rebuild search index")?;
            println!("Search index rebuilt: {} posts indexed", count);
        }
    }

    if let Ok(report) = db.check_search_consistency().await {
        if !report.is_consistent {
            tracing::warn!(
                posts = report.posts_count,
                indexed = report.indexed_count,
                orphaned = report.orphaned_entries,
                missing = report.missing_entries,
                "Search index inconsistent, run `blogroll rebuild-search`"
            );
        }
    }

    Ok(())
}

fn build_engine(db: Database, config: &Config) -> Result<SyncEngine> {
    let fetcher = FeedFetcher::new(&config.fetch).context("Failed to build HTTP client")?;
    Ok(SyncEngine::new(db, fetcher, config))
}

fn print_articles(articles: &[Article]) {
    for article in articles {
        let tags = if article.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", article.tags.join(", "))
        };
        println!(
            "{}  {} ({}){}\n    {}",
            article.published_at.format("%Y-%m-%d"),
            article.title,
            article.blog_title,
            tags,
            article.url
        );
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down gracefully"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
    }
    tracing::info!("Shutting down gracefully");
}
