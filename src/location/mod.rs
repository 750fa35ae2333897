//! Location ingestion: per-device batching and the derived presence index.

pub mod batch;
pub mod presence;

pub use batch::{FlushReport, LocationBatcher};
pub use presence::{ActivityWindow, PresenceDirectory, PresenceEntry};
