//! Spaceframe Net
//!
//! A reusable TCP networking core for framed, stateful servers and
//! clients: per-connection sessions over segmented buffers, a
//! bidirectional handler pipeline with built-in frame decoders, event-loop
//! pools, and an embedder facade for the application host above.
//!
//! # Architecture
//!
//! ```text
//!        accept pool (1)          io pool (n)          worker pool (n)
//!      ┌───────────────┐     ┌────────────────┐     ┌────────────────┐
//!      │ accept + sweep│ ──▶ │ read/write pump│ ──▶ │ pipeline decode│
//!      └───────────────┘     └────────────────┘     └────────────────┘
//!             sessions ──▶ read ring ──▶ handlers ──▶ write ring
//! ```
//!
//! Inbound bytes land in a session's read ring and run head → tail
//! through the pipeline; outbound messages run tail → head, and the head
//! serializes them into the write ring for the socket pump.

#![deny(unsafe_code)] // tcp.rs opts back in for raw-descriptor plumbing
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod client;
pub mod codec;
pub mod dev_tracing;
pub mod error;
pub mod handler;
pub mod host;
pub mod msg;
pub mod options;
pub mod pipeline;
pub mod pool;
pub mod server;
pub mod session;
pub mod tcp;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::codec::{DelimiterFrameDecoder, LengthFieldFrameDecoder};
    pub use crate::error::{EngineError, Result};
    pub use crate::handler::Handler;
    pub use crate::host::{Embedder, EngineHost};
    pub use crate::msg::Msg;
    pub use crate::options::SessionOptions;
    pub use crate::pipeline::{Context, Pipeline, PipelineBuilder, PipelineHandle};
    pub use crate::server::Server;
    pub use crate::session::Session;
    pub use spaceframe_core::wheel::TimerKind;
}
