//! Remote file change notification
//!
//! Strategy selection (inotifywait, fswatch, or none) follows the cached
//! capability probe; each watched path runs one long-lived remote monitor
//! process whose output is normalized into [`crate::events::ChangeKind`].

pub mod broker;
pub mod parser;

pub use broker::ChangeWatchBroker;
pub use parser::{parse_fswatch_line, parse_inotify_line};
