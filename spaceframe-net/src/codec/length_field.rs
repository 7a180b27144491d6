//! Length-field frame decoder.

use bytes::Bytes;
use tracing::{debug, error, warn};

use spaceframe_core::buffer::SegmentedRing;

use crate::error::{EngineError, Result};
use crate::handler::Handler;
use crate::msg::Msg;
use crate::pipeline::Context;

/// Splits the byte stream on a length field embedded in each frame.
///
/// The field sits `length_field_offset` bytes into the frame and is
/// `length_field_length` bytes wide (1, 2, 4 or 8). The decoded frame
/// spans `length_value + length_adjustment + length_field_end` bytes from
/// offset 0, where `length_field_end = offset + width`; the first
/// `initial_bytes_to_strip` bytes are dropped from the delivered message.
///
/// ```text
/// offset = 0, width = 2, adjustment = 0, strip = 2
///
/// BEFORE DECODE (14 bytes)         AFTER DECODE (12 bytes)
/// +--------+----------------+      +----------------+
/// | Length | Actual Content |----->| Actual Content |
/// | 0x000C | "HELLO, WORLD" |      | "HELLO, WORLD" |
/// +--------+----------------+      +----------------+
///
/// offset = 2, width = 2, adjustment = 0, strip = 0
///
/// BEFORE DECODE (16 bytes)                      AFTER DECODE (16 bytes)
/// +----------+--------+----------------+      +----------+--------+----------------+
/// | Header 1 | Length | Actual Content |----->| Header 1 | Length | Actual Content |
/// |  0xCAFE  | 0x000C | "HELLO, WORLD" |      |  0xCAFE  | 0x000C | "HELLO, WORLD" |
/// +----------+--------+----------------+      +----------+--------+----------------+
/// ```
///
/// A frame whose computed span exceeds `max_frame_length` is only warned
/// about: nothing is discarded, so the stream stays wedged on it and the
/// outer policy must close the connection.
pub struct LengthFieldFrameDecoder {
    max_frame_length: u64,
    length_field_offset: usize,
    length_field_length: usize,
    length_adjustment: i64,
    initial_bytes_to_strip: usize,
    big_endian: bool,
    length_field_end: usize,
}

impl LengthFieldFrameDecoder {
    /// Configure a big-endian decoder.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnsupportedLengthWidth`] unless
    /// `length_field_length` is 1, 2, 4 or 8.
    pub fn new(
        max_frame_length: u64,
        length_field_offset: usize,
        length_field_length: usize,
        length_adjustment: i64,
        initial_bytes_to_strip: usize,
    ) -> Result<Self> {
        if !matches!(length_field_length, 1 | 2 | 4 | 8) {
            return Err(EngineError::UnsupportedLengthWidth(length_field_length));
        }
        Ok(Self {
            max_frame_length,
            length_field_offset,
            length_field_length,
            length_adjustment,
            initial_bytes_to_strip,
            big_endian: true,
            length_field_end: length_field_offset + length_field_length,
        })
    }

    /// Switch the length field's byte order.
    #[must_use]
    pub fn with_big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    fn unadjusted_frame_length(&self, ring: &SegmentedRing) -> u64 {
        let offset = self.length_field_offset;
        match self.length_field_length {
            1 => u64::from(ring.peek_scalar_at::<u8>(offset, self.big_endian)),
            2 => u64::from(ring.peek_scalar_at::<u16>(offset, self.big_endian)),
            4 => u64::from(ring.peek_scalar_at::<u32>(offset, self.big_endian)),
            8 => ring.peek_scalar_at::<u64>(offset, self.big_endian),
            // Width is validated at construction.
            _ => 0,
        }
    }
}

impl Handler for LengthFieldFrameDecoder {
    fn decode(&self, ctx: &Context<'_>, msg: Msg) -> Result<()> {
        let Msg::Buffer(buffer) = msg else {
            return Err(EngineError::BadMessageType(
                "length-field decoder expects the session buffer",
            ));
        };

        loop {
            let frame = {
                let mut ring = buffer.lock();
                if ring.readable_bytes() == 0 || ring.readable_bytes() <= self.length_field_end {
                    return Ok(());
                }

                if self.length_adjustment < 0
                    && self.length_adjustment.unsigned_abs() > self.length_field_end as u64
                {
                    error!(
                        adjustment = self.length_adjustment,
                        field_end = self.length_field_end,
                        "length adjustment exceeds the length field end offset"
                    );
                    return Err(EngineError::BadLengthAdjustment {
                        adjustment: self.length_adjustment,
                        field_end: self.length_field_end,
                    });
                }

                let unadjusted = self.unadjusted_frame_length(&ring);
                let frame_length = unadjusted as i128
                    + i128::from(self.length_adjustment)
                    + self.length_field_end as i128;

                if frame_length < self.length_field_end as i128 {
                    warn!(
                        frame_length,
                        field_end = self.length_field_end,
                        "adjusted frame length is shorter than the length field end"
                    );
                    ring.retrieve(self.length_field_end);
                    return Ok(());
                }
                let frame_length = frame_length as u64;

                if frame_length > self.max_frame_length {
                    // Deliberately left in the stream: outer policy must
                    // close on this error.
                    warn!(
                        frame_length,
                        max_frame_length = self.max_frame_length,
                        "frame exceeds the configured maximum"
                    );
                    return Ok(());
                }

                let frame_length = frame_length as usize;
                if ring.readable_bytes() < frame_length {
                    debug!(
                        readable = ring.readable_bytes(),
                        frame_length, "waiting for the rest of the frame"
                    );
                    return Ok(());
                }

                if self.initial_bytes_to_strip > frame_length {
                    warn!(
                        frame_length,
                        strip = self.initial_bytes_to_strip,
                        "frame is shorter than the initial bytes to strip"
                    );
                    ring.retrieve(frame_length);
                    return Ok(());
                }

                ring.retrieve(self.initial_bytes_to_strip);
                ring.read(frame_length - self.initial_bytes_to_strip)
            };

            ctx.fire_read(Msg::Bytes(Bytes::from(frame.into_vec())))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Pipeline, SessionLink};
    use parking_lot::Mutex;
    use spaceframe_core::buffer::SharedBuffer;
    use std::sync::Arc;

    struct Collect {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Handler for Collect {
        fn decode(&self, _ctx: &Context<'_>, msg: Msg) -> Result<()> {
            match msg {
                Msg::Bytes(b) => {
                    self.frames.lock().push(b.to_vec());
                    Ok(())
                }
                other => Err(EngineError::BadMessageType(other.kind())),
            }
        }
    }

    struct Fixture {
        pipeline: Arc<Pipeline>,
        input: SharedBuffer,
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    fn fixture(decoder: LengthFieldFrameDecoder) -> Fixture {
        let input = SharedBuffer::new(512);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let mut builder = Pipeline::builder();
        builder
            .add_handler("decoder", Arc::new(decoder))
            .add_handler(
                "collect",
                Arc::new(Collect {
                    frames: Arc::clone(&frames),
                }),
            );
        let link = SessionLink::new(
            1,
            input.clone(),
            SharedBuffer::new(512),
            Box::new(|_| {}),
            Box::new(|| {}),
        );
        Fixture {
            pipeline: builder.build(link),
            input,
            frames,
        }
    }

    #[test]
    fn strips_the_length_field() {
        let fx = fixture(LengthFieldFrameDecoder::new(8192, 0, 2, 0, 2).unwrap());
        fx.input.append(&[0x00, 0x0C]);
        fx.input.append(b"HELLO, WORLD");
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"HELLO, WORLD".to_vec()]);
        assert_eq!(fx.input.readable_bytes(), 0);
    }

    #[test]
    fn keeps_prefix_header_when_offset_set() {
        let fx = fixture(LengthFieldFrameDecoder::new(8192, 2, 2, 0, 0).unwrap());
        let mut wire = vec![0xCA, 0xFE, 0x00, 0x0C];
        wire.extend_from_slice(b"HELLO, WORLD");
        fx.input.append(&wire);
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![wire]);
    }

    #[test]
    fn waits_for_partial_frames() {
        let fx = fixture(LengthFieldFrameDecoder::new(8192, 0, 2, 0, 2).unwrap());
        fx.input.append(&[0x00, 0x05, b'H', b'E']);
        fx.pipeline.fire_read().unwrap();
        assert!(fx.frames.lock().is_empty());

        fx.input.append(b"LLO");
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"HELLO".to_vec()]);
    }

    #[test]
    fn decodes_back_to_back_frames_in_one_run() {
        let fx = fixture(LengthFieldFrameDecoder::new(8192, 0, 2, 0, 2).unwrap());
        fx.input.append(&[0x00, 0x01, b'A', 0x00, 0x02, b'B', b'C']);
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"A".to_vec(), b"BC".to_vec()]);
    }

    #[test]
    fn oversize_frame_is_left_in_the_stream() {
        let fx = fixture(LengthFieldFrameDecoder::new(1024, 0, 2, 0, 0).unwrap());
        fx.input.append(&[0xFF, 0xFF, 1, 2, 3]);
        fx.pipeline.fire_read().unwrap();
        assert!(fx.frames.lock().is_empty());
        // Nothing discarded: the wedge is the outer policy's signal.
        assert_eq!(fx.input.readable_bytes(), 5);
    }

    #[test]
    fn negative_adjustment_shrinks_the_frame() {
        // Length field counts itself: 0x0007 covers the whole frame.
        let fx = fixture(LengthFieldFrameDecoder::new(8192, 0, 2, -2, 2).unwrap());
        fx.input.append(&[0x00, 0x07, b'H', b'E', b'L', b'L', b'O']);
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"HELLO".to_vec()]);
    }

    #[test]
    fn underflowing_frame_discards_header() {
        // adjustment -2 with length 0 makes the frame end before the
        // length field does.
        let fx = fixture(LengthFieldFrameDecoder::new(8192, 0, 2, -2, 0).unwrap());
        fx.input.append(&[0x00, 0x00, 9, 9, 9]);
        fx.pipeline.fire_read().unwrap();
        assert!(fx.frames.lock().is_empty());
        assert_eq!(fx.input.readable_bytes(), 3, "length field end discarded");
    }

    #[test]
    fn strip_beyond_frame_discards_the_frame() {
        let fx = fixture(LengthFieldFrameDecoder::new(8192, 0, 2, 0, 8).unwrap());
        fx.input.append(&[0x00, 0x01, b'A', b'B']);
        fx.pipeline.fire_read().unwrap();
        assert!(fx.frames.lock().is_empty());
        assert_eq!(fx.input.readable_bytes(), 1, "frame discarded, rest kept");
    }

    #[test]
    fn little_endian_length_field() {
        let fx =
            fixture(LengthFieldFrameDecoder::new(8192, 0, 2, 0, 2).unwrap().with_big_endian(false));
        fx.input.append(&[0x05, 0x00]);
        fx.input.append(b"HELLO");
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"HELLO".to_vec()]);
    }

    #[test]
    fn rejects_unsupported_widths() {
        assert!(matches!(
            LengthFieldFrameDecoder::new(1024, 0, 3, 0, 0),
            Err(EngineError::UnsupportedLengthWidth(3))
        ));
    }

    #[test]
    fn excessive_negative_adjustment_is_fatal() {
        let fx = fixture(LengthFieldFrameDecoder::new(8192, 0, 2, -5, 0).unwrap());
        fx.input.append(&[0x00, 0x05, 0, 0, 0]);
        assert!(matches!(
            fx.pipeline.fire_read(),
            Err(EngineError::BadLengthAdjustment { .. })
        ));
    }
}
