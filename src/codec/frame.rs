//! Delimiter framing for device byte streams
//!
//! TCP has no message boundaries. This decoder splits the stream into raw
//! lines running from the start delimiter through the end delimiter
//! (inclusive) so they can be fed to [`super::Codec::decode`]:
//!
//! ```text
//! noise #dev1,1,DEVICE_LOGIN,0,secret|#dev1,2,...|
//!       └──────────── frame ──────────┘└── frame ..
//! ```
//!
//! Bytes outside a frame are discarded. A frame that grows past the
//! configured maximum without an end delimiter is dropped and the decoder
//! resynchronises on the next start delimiter; neither case closes the
//! connection.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::Delimiters;

/// Default maximum frame length in bytes
pub const DEFAULT_MAX_FRAME_LEN: usize = 4096;

/// Stream framing codec for device channels
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    start: u8,
    end: u8,
    max_len: usize,
    /// Frames dropped because they exceeded `max_len` or were not UTF-8
    dropped: u64,
}

impl FrameDecoder {
    /// Create a decoder for the given delimiters
    #[must_use]
    pub const fn new(delimiters: Delimiters, max_len: usize) -> Self {
        Self {
            start: delimiters.start,
            end: delimiters.end,
            max_len,
            dropped: 0,
        }
    }

    /// Number of frames dropped so far
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Decoder for FrameDecoder {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            let Some(start) = buf.iter().position(|b| *b == self.start) else {
                if buf.iter().any(|b| !b.is_ascii_whitespace()) {
                    tracing::debug!(bytes = buf.len(), "discarding bytes outside a frame");
                }
                buf.clear();
                return Ok(None);
            };
            if start > 0 {
                buf.advance(start);
            }

            let Some(end) = buf.iter().position(|b| *b == self.end) else {
                if buf.len() > self.max_len {
                    tracing::warn!(
                        bytes = buf.len(),
                        max = self.max_len,
                        "frame exceeds maximum length, dropping"
                    );
                    self.dropped += 1;
                    // skip this start byte and resync on the next one
                    buf.advance(1);
                    continue;
                }
                return Ok(None);
            };

            // a later start before the end means the earlier frame was truncated
            let restart = buf[1..end]
                .iter()
                .rposition(|b| *b == self.start)
                .map(|i| i + 1);
            if let Some(restart) = restart {
                tracing::warn!(bytes = restart, "truncated frame, resynchronising");
                self.dropped += 1;
                buf.advance(restart);
                continue;
            }

            let frame = buf.split_to(end + 1);
            if frame.len() > self.max_len {
                tracing::warn!(
                    bytes = frame.len(),
                    max = self.max_len,
                    "frame exceeds maximum length, dropping"
                );
                self.dropped += 1;
                continue;
            }

            match String::from_utf8(frame.to_vec()) {
                Ok(line) => return Ok(Some(line)),
                Err(e) => {
                    tracing::warn!(error = %e, "frame is not valid utf-8, dropping");
                    self.dropped += 1;
                }
            }
        }
    }
}

impl Encoder<String> for FrameDecoder {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> io::Result<()> {
        dst.extend_from_slice(line.as_bytes());
        Ok(())
    }
}
