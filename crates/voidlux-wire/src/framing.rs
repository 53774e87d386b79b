//! Length-prefixed frame codec.
//!
//! The decoder is a plain buffer state machine: feed it whatever the
//! socket produced, pull out zero or more complete frames, excess bytes
//! stay buffered for the next read.

use crate::{Result, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum accepted frame size: 16 MiB.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wraps an encoded envelope with the 4-byte big-endian length prefix.
pub fn encode_frame(envelope: &[u8]) -> Result<Bytes> {
    if envelope.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: envelope.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(4 + envelope.len());
    buf.put_u32(envelope.len() as u32);
    buf.put_slice(envelope);
    Ok(buf.freeze())
}

/// Incremental frame decoder with an internal reassembly buffer.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly-read bytes to the buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to extract the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An oversized length
    /// prefix is a protocol violation; the caller must close the
    /// connection since the stream can no longer be re-synchronized.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if self.buf.len() < 4 + len {
            return Ok(None);
        }

        self.buf.advance(4);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Bytes currently buffered (for diagnostics).
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Any sequence of payloads fed byte-by-byte decodes back intact.
        #[test]
        fn prop_fragmented_stream_reassembles(
            payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..256), 1..8),
            chunk in 1usize..16,
        ) {
            let mut stream = Vec::new();
            for p in &payloads {
                stream.extend_from_slice(&encode_frame(p).unwrap());
            }

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for piece in stream.chunks(chunk) {
                decoder.feed(piece);
                while let Some(frame) = decoder.next_frame().unwrap() {
                    decoded.push(frame.to_vec());
                }
            }

            prop_assert_eq!(decoded, payloads);
        }
    }
}
