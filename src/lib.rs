//! Blog feed aggregation engine.
//!
//! `blogroll` keeps a set of externally hosted blogs in sync with a local
//! SQLite database and exposes their posts for listing and full-text search.
//!
//! - [`feed`] - conditional feed fetching, parsing and HTML cleanup
//! - [`storage`] - SQLite persistence, optimistic concurrency and the search index
//! - [`sync`] - the per-blog sync state machine and the concurrent scheduler
//! - [`config`] - TOML configuration
//! - [`clock`] - injectable time source

pub mod clock;
pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
