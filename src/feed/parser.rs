use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use std::collections::HashSet;
use thiserror::Error;

use crate::util::{normalize_post_url, normalize_url};

#[derive(Debug, Error)]
pub enum ParseError {
    /// Bytes are not a recognizable RSS/Atom/JSON feed
    #[error("Invalid feed document: {0}")]
    Feed(#[from] parser::ParseFeedError),
}

/// A feed item that survived validation, ready for diffing.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedPost {
    /// Normalized absolute URL (the identity used for diffing)
    pub url: String,
    pub title: String,
    /// Raw HTML body from the feed; empty when the feed only links to the post
    pub content: String,
    pub published_at: DateTime<Utc>,
}

/// Per-reason counts of feed items that were rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkippedItems {
    pub missing_link: usize,
    pub missing_title: usize,
    pub missing_timestamp: usize,
    pub duplicate_url: usize,
}

impl SkippedItems {
    pub fn total(&self) -> usize {
        self.missing_link + self.missing_title + self.missing_timestamp + self.duplicate_url
    }
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub feed_url: String,
    pub site_url: String,
    pub title: String,
    /// Accepted items, in feed order
    pub posts: Vec<FeedPost>,
    pub skipped: SkippedItems,
}

/// Parse feed bytes into blog metadata plus candidate posts.
///
/// Items are rejected (and counted in [`ParsedFeed::skipped`]) when they have
/// no usable link, no title, or no timestamp at all. An item's `updated`
/// timestamp wins over `published` when both are present. A missing timestamp
/// is never replaced by a made-up date.
pub fn parse_feed(feed_url: &str, bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = parser::parse(bytes)?;

    let site_url = pick_site_link(&feed.links)
        .and_then(|href| normalize_post_url(feed_url, href))
        .or_else(|| origin_of(feed_url))
        .unwrap_or_else(|| feed_url.to_string());

    let title = feed
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| {
            url::Url::parse(&site_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
        })
        .unwrap_or_else(|| site_url.clone());

    let mut skipped = SkippedItems::default();
    let mut seen = HashSet::new();
    let mut posts = Vec::with_capacity(feed.entries.len());

    for entry in feed.entries {
        match to_feed_post(&site_url, entry) {
            Ok(post) => {
                if seen.insert(post.url.clone()) {
                    posts.push(post);
                } else {
                    skipped.duplicate_url += 1;
                }
            }
            Err(Rejected::Link) => skipped.missing_link += 1,
            Err(Rejected::Title) => skipped.missing_title += 1,
            Err(Rejected::Timestamp) => skipped.missing_timestamp += 1,
        }
    }

    Ok(ParsedFeed {
        feed_url: feed_url.to_string(),
        site_url,
        title,
        posts,
        skipped,
    })
}

enum Rejected {
    Link,
    Title,
    Timestamp,
}

fn to_feed_post(site_url: &str, entry: Entry) -> Result<FeedPost, Rejected> {
    let url = pick_entry_link(&entry.links)
        .and_then(|href| normalize_post_url(site_url, href))
        .ok_or(Rejected::Link)?;

    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or(Rejected::Title)?;

    let published_at = entry
        .updated
        .or(entry.published)
        .ok_or(Rejected::Timestamp)?;

    let content = entry
        .content
        .and_then(|c| c.body)
        .filter(|b| !b.trim().is_empty())
        .or_else(|| entry.summary.map(|s| s.content))
        .unwrap_or_default();

    Ok(FeedPost {
        url,
        title,
        content,
        published_at,
    })
}

/// The blog's own homepage: anything but the feed's `rel="self"` link.
fn pick_site_link(links: &[Link]) -> Option<&str> {
    links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .or_else(|| links.first())
        .map(|l| l.href.as_str())
}

/// The item's permalink: prefer `alternate` (or untyped) links.
fn pick_entry_link(links: &[Link]) -> Option<&str> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .map(|l| l.href.as_str())
}

fn origin_of(feed_url: &str) -> Option<String> {
    let url = url::Url::parse(feed_url).ok()?;
    normalize_url(&url.origin().ascii_serialization())
}
