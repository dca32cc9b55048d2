//! SQLite persistence: blogs, posts, the tag vocabulary and the FTS5 search
//! index.
//!
//! Every mutating update of a blog or post is guarded by the `updated_at`
//! value the caller last read (optimistic concurrency), and every operation
//! runs under the database timeout configured in [`DatabaseOptions`].

mod blogs;
mod posts;
mod schema;
mod search;
mod sync;
mod tags;
mod types;

pub use schema::{Database, DatabaseOptions};
pub use search::MAX_PAGE_SIZE;
pub use sync::CommitSummary;
pub use types::{
    Article, Blog, DatabaseError, NewBlog, NewPost, Post, SearchConsistencyReport, Tag,
};
