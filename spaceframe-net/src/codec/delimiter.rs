//! Delimiter frame decoder.

use bytes::Bytes;
use tracing::warn;

use spaceframe_core::buffer::SegmentedRing;

use crate::error::{EngineError, Result};
use crate::handler::Handler;
use crate::msg::Msg;
use crate::pipeline::Context;

/// Splits the byte stream on configured delimiter sequences.
///
/// With several delimiters, the one whose earliest occurrence comes first
/// wins; a tie goes to the delimiter configured first. Records are
/// delivered with or without the matched delimiter per `strip_delimiter`.
/// A record longer than `max_frame_length` is warned about and discarded
/// together with its delimiter.
pub struct DelimiterFrameDecoder {
    max_frame_length: usize,
    delimiters: Vec<Vec<u8>>,
    strip_delimiter: bool,
}

impl DelimiterFrameDecoder {
    /// Single-delimiter configuration.
    ///
    /// # Errors
    ///
    /// [`EngineError::EmptyDelimiter`] for an empty delimiter.
    pub fn new(
        max_frame_length: usize,
        delimiter: impl Into<Vec<u8>>,
        strip_delimiter: bool,
    ) -> Result<Self> {
        Self::with_delimiters(max_frame_length, vec![delimiter.into()], strip_delimiter)
    }

    /// Multi-delimiter configuration; order sets the tie-break.
    ///
    /// # Errors
    ///
    /// [`EngineError::EmptyDelimiter`] if any delimiter is empty.
    pub fn with_delimiters(
        max_frame_length: usize,
        delimiters: Vec<Vec<u8>>,
        strip_delimiter: bool,
    ) -> Result<Self> {
        if delimiters.is_empty() || delimiters.iter().any(Vec::is_empty) {
            return Err(EngineError::EmptyDelimiter);
        }
        Ok(Self {
            max_frame_length,
            delimiters,
            strip_delimiter,
        })
    }

    /// Earliest occurrence of `needle` in the readable region: a linear
    /// outer scan with a linear inner match at each position.
    fn index_of(ring: &SegmentedRing, needle: &[u8]) -> Option<usize> {
        let readable = ring.readable_bytes();
        if needle.len() > readable {
            return None;
        }
        for start in 0..=(readable - needle.len()) {
            if (0..needle.len()).all(|i| ring.byte_at(start + i) == needle[i]) {
                return Some(start);
            }
        }
        None
    }
}

impl Handler for DelimiterFrameDecoder {
    fn decode(&self, ctx: &Context<'_>, msg: Msg) -> Result<()> {
        let Msg::Buffer(buffer) = msg else {
            return Err(EngineError::BadMessageType(
                "delimiter decoder expects the session buffer",
            ));
        };

        loop {
            let record = {
                let mut ring = buffer.lock();
                if ring.readable_bytes() == 0 {
                    return Ok(());
                }

                let mut earliest: Option<(usize, usize)> = None;
                for (which, delimiter) in self.delimiters.iter().enumerate() {
                    if let Some(position) = Self::index_of(&ring, delimiter) {
                        let beats = earliest.map_or(true, |(best, _)| position < best);
                        if beats {
                            earliest = Some((position, which));
                        }
                    }
                }
                let Some((position, which)) = earliest else {
                    return Ok(());
                };
                let delimiter_len = self.delimiters[which].len();

                if position > self.max_frame_length {
                    warn!(
                        record_length = position,
                        max_frame_length = self.max_frame_length,
                        "record exceeds the configured maximum"
                    );
                    ring.retrieve(position + delimiter_len);
                    return Ok(());
                }

                if self.strip_delimiter {
                    let record = ring.read(position);
                    ring.retrieve(delimiter_len);
                    record
                } else {
                    ring.read(position + delimiter_len)
                }
            };

            ctx.fire_read(Msg::Bytes(Bytes::from(record.into_vec())))?;
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

    fn fixture(decoder: DelimiterFrameDecoder) -> Fixture {
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
    fn splits_on_newline_and_strips() {
        let fx = fixture(DelimiterFrameDecoder::new(8192, "\n", true).unwrap());
        fx.input.append(b"A\nBC\n");
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"A".to_vec(), b"BC".to_vec()]);
        assert_eq!(fx.input.readable_bytes(), 0);
    }

    #[test]
    fn keeps_delimiter_when_not_stripping() {
        let fx = fixture(DelimiterFrameDecoder::new(8192, "\n", false).unwrap());
        fx.input.append(b"A\nBC\n");
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"A\n".to_vec(), b"BC\n".to_vec()]);
    }

    #[test]
    fn waits_without_a_delimiter() {
        let fx = fixture(DelimiterFrameDecoder::new(8192, "\n", true).unwrap());
        fx.input.append(b"no newline yet");
        fx.pipeline.fire_read().unwrap();
        assert!(fx.frames.lock().is_empty());
        assert_eq!(fx.input.readable_bytes(), 14);
    }

    #[test]
    fn earliest_delimiter_wins() {
        let fx = fixture(
            DelimiterFrameDecoder::with_delimiters(
                8192,
                vec![b"\r\n".to_vec(), b"\n".to_vec()],
                true,
            )
            .unwrap(),
        );
        fx.input.append(b"one\ntwo\r\nthree\n");
        fx.pipeline.fire_read().unwrap();
        assert_eq!(
            *fx.frames.lock(),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn tie_goes_to_the_first_configured_delimiter() {
        // Both delimiters match at index 3; the two-byte one is listed
        // first, so "xyzAB" loses its whole separator.
        let fx = fixture(
            DelimiterFrameDecoder::with_delimiters(
                8192,
                vec![b"AB".to_vec(), b"A".to_vec()],
                true,
            )
            .unwrap(),
        );
        fx.input.append(b"xyzABrest");
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"xyz".to_vec()]);
        assert_eq!(fx.input.readable_bytes(), 4);
    }

    #[test]
    fn oversize_record_is_discarded_with_delimiter() {
        let fx = fixture(DelimiterFrameDecoder::new(4, "\n", true).unwrap());
        fx.input.append(b"toolongrecord\nok\n");
        fx.pipeline.fire_read().unwrap();
        // First decode run drops the oversize record and returns.
        assert!(fx.frames.lock().is_empty());
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"ok".to_vec()]);
    }

    #[test]
    fn split_record_across_feeds() {
        let fx = fixture(DelimiterFrameDecoder::new(8192, "\n", true).unwrap());
        fx.input.append(b"HEL");
        fx.pipeline.fire_read().unwrap();
        fx.input.append(b"LO\n");
        fx.pipeline.fire_read().unwrap();
        assert_eq!(*fx.frames.lock(), vec![b"HELLO".to_vec()]);
    }

    #[test]
    fn rejects_empty_delimiters() {
        assert!(matches!(
            DelimiterFrameDecoder::new(8192, "", true),
            Err(EngineError::EmptyDelimiter)
        ));
        assert!(matches!(
            DelimiterFrameDecoder::with_delimiters(8192, vec![], true),
            Err(EngineError::EmptyDelimiter)
        ));
    }
}
