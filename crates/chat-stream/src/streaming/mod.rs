mod chunk_source;
mod sse;

pub use crate::streaming::chunk_source::ChunkSource;
pub use crate::streaming::sse::{SseEvent, SseItem, SseParser};
