//! HTTP API for DorkOS
//!
//! Thin route adapters over the transport port. Streaming endpoints use
//! SSE with proxy buffering disabled.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
