//! Handler contract for pipeline nodes.
//!
//! A handler is stateless or self-contained behavior hung on one pipeline
//! context. Every hook defaults to forwarding, so a handler only overrides
//! the directions it participates in: a frame decoder implements `decode`,
//! an application bridge implements `connect`/`decode`/`notify_closed`.

use crate::error::Result;
use crate::msg::Msg;
use crate::pipeline::Context;

/// A node's behavior in the pipeline.
///
/// Inbound events (`connect`, `decode`, `notify_closed`) travel head to
/// tail; outbound events (`encode`, `close`) travel tail to head. The
/// default for each hook forwards the event to the neighbor in its
/// direction of travel.
pub trait Handler: Send + Sync + 'static {
    /// Connection established. Forward with [`Context::fire_connect`].
    fn connect(&self, ctx: &Context<'_>) {
        ctx.fire_connect();
    }

    /// An inbound message arrived from the previous node.
    ///
    /// # Errors
    ///
    /// Errors propagate to the worker-task boundary, where they are
    /// logged and the decode run for this read ends.
    fn decode(&self, ctx: &Context<'_>, msg: Msg) -> Result<()> {
        ctx.fire_read(msg)
    }

    /// An outbound message is traveling toward the head.
    ///
    /// # Errors
    ///
    /// Errors surface to whoever injected the write.
    fn encode(&self, ctx: &Context<'_>, msg: Msg) -> Result<()> {
        ctx.fire_write(msg)
    }

    /// A close request is traveling toward the head.
    fn close(&self, ctx: &Context<'_>) {
        ctx.fire_close();
    }

    /// The session is gone; propagates head to tail exactly once.
    fn notify_closed(&self, ctx: &Context<'_>) {
        ctx.fire_closed();
    }
}
