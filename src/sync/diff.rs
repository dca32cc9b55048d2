//! Feed-vs-store diff.
//!
//! Post identity is the normalized URL (see [`crate::util::normalize_url`]),
//! scoped to one blog: the known set passed in is that blog's stored URLs.

use std::collections::{HashMap, HashSet};

use crate::feed::{clean_html, FeedPost};
use crate::storage::Post;

/// Feed posts whose URL is not in `known`, in feed order, first occurrence
/// only.
pub fn new_posts(feed_posts: Vec<FeedPost>, known: &HashSet<String>) -> Vec<FeedPost> {
    let mut seen: HashSet<String> = HashSet::with_capacity(feed_posts.len());
    feed_posts
        .into_iter()
        .filter(|post| !known.contains(&post.url) && seen.insert(post.url.clone()))
        .collect()
}

/// Stored posts whose feed entry now carries different content.
///
/// Only entries with a non-blank body count; an empty body never clears
/// stored content. Returned posts carry the sanitized new content and the
/// stored `updated_at`, ready for a guarded update.
pub fn changed_posts(feed_posts: &[FeedPost], stored: &HashMap<String, Post>) -> Vec<Post> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(feed_posts.len());
    feed_posts
        .iter()
        .filter(|post| seen.insert(post.url.as_str()) && !post.content.trim().is_empty())
        .filter_map(|post| {
            let current = stored.get(&post.url)?;
            let content = clean_html(&post.content);
            (content != current.content).then(|| Post {
                content,
                ..current.clone()
            })
        })
        .collect()
}
