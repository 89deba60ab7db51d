//! One-shot command execution: engine and live output feeds.

pub mod engine;
pub mod feed;

pub use engine::ExecutionEngine;
pub use feed::{FeedEvent, FeedReader, OutputFeed};
