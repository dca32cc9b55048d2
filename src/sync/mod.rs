//! Feed synchronization.
//!
//! Each blog moves through an explicit state machine per cycle:
//!
//! ```text
//! Start → Fetching → Unchanged → Done
//!                  → Fetched → Parsing → Diffing → Persisting → Done
//! (any state) → Failed
//! ```
//!
//! The [`Scheduler`] drives cycles for every tracked blog on an interval;
//! [`SyncEngine`] runs a single cycle and is also the entry point for adding
//! a feed interactively.

mod diff;
mod engine;
mod scheduler;

pub use diff::{changed_posts, new_posts};
pub use engine::{SyncEngine, SyncError, SyncOutcome, SyncState};
pub use scheduler::{PassReport, Scheduler};
