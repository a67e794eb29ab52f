//! In-memory collaborators.
//!
//! [`MemoryChangeFeed`] and [`MemoryStore`] implement the engine's change-feed
//! and store seams without an external database. The store publishes every
//! write to the feed, so an engine wired to both sees its own target writes
//! come back as change notifications, exactly like a database with change
//! streams enabled.

pub mod memory_feed;
pub mod memory_store;

pub use memory_feed::MemoryChangeFeed;
pub use memory_store::{matches_filter, MemoryStore};
