//! URL helpers shared by the feed parser and the sync engine.
//!
//! - **Validation**: feed URLs submitted interactively are checked before any
//!   request is made (scheme, host, optional private-network block)
//! - **Normalization**: post links are resolved and canonicalized so diffing
//!   compares like with like

mod url;

pub use self::url::{normalize_post_url, normalize_url, validate_feed_url, UrlValidationError};
