//! CME-style multicast feed: packet framing, batching, templates and the listener.

pub mod adapter;
pub mod batcher;
pub mod framer;
pub mod schema;

pub use adapter::CmeFeed;
pub use batcher::{Batcher, BatcherConfig, BatcherStats};
pub use framer::{frame_packet, parse_packet, FramingError};
