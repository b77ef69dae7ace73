//! Source platform integration
//!
//! - `client`: the RPC boundary (paginated search, session event streams,
//!   lock upserts) and its HTTP implementation
//! - `watcher`: the paginated main-stream watcher built on top of it

pub mod client;
pub mod watcher;

pub use client::{
    EventPage, HttpSourceClient, LockSpec, SearchRequest, SourceClient, SourceError,
};
pub use watcher::{EventWatcher, ResumePoint, WatcherConfig};
