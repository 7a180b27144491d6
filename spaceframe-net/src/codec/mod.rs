//! Built-in frame decoders.
//!
//! Both decoders are ordinary pipeline handlers: they claim the
//! [`Msg::Buffer`](crate::msg::Msg::Buffer) the session feeds in, carve
//! complete frames off the readable region, and fire each frame down the
//! chain as [`Msg::Bytes`](crate::msg::Msg::Bytes).

mod delimiter;
mod length_field;

pub use delimiter::DelimiterFrameDecoder;
pub use length_field::LengthFieldFrameDecoder;
