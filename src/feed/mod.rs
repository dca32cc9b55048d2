//! Feed retrieval and parsing.
//!
//! Three leaves of the sync pipeline live here:
//!
//! - [`fetcher`] - conditional HTTP GET of feeds (etag / last-modified) and plain page fetches
//! - [`parser`] - RSS/Atom/JSON Feed bytes into candidate posts, using `feed-rs`
//! - [`sanitize`] - HTML to plain text for indexing
//!
//! None of them touch the database.
//!
//! # Example
//!
//! ```ignore
//! use blogroll::feed::{parse_feed, FeedFetcher, FeedRequest, FeedResponse};
//!
//! let fetcher = FeedFetcher::new(&config.fetch)?;
//! let request = FeedRequest { url, etag: "", last_modified: "" };
//! if let FeedResponse::Fetched { body, .. } = fetcher.fetch_feed(&request).await? {
//!     let feed = parse_feed(url, &body)?;
//! }
//! ```

mod fetcher;
mod parser;
mod sanitize;

pub use fetcher::{FeedFetcher, FeedRequest, FeedResponse, FetchError};
pub use parser::{parse_feed, FeedPost, ParseError, ParsedFeed, SkippedItems};
pub use sanitize::{clean_html, clean_html_bytes};
