//! Decoding of the engine's multiplexed stdout/stderr log stream.
//!
//! Each frame is an 8 byte header followed by its payload:
//!
//! ```text
//! [selector: u8][reserved: 3 bytes][payload length: u32 big-endian][payload ...]
//! ```
//!
//! Selector 1 is stdout, 2 is stderr; any other value is read as stdout.

use bytes::{Buf, BytesMut};

use crate::models::{LogFrame, StreamType};

pub const HEADER_LEN: usize = 8;

/// Largest payload `FrameDecoder` buffers whole. Longer frames are passed on
/// in pieces as their bytes arrive.
pub const MAX_BUFFERED_FRAME: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub selector: u8,
    pub reserved: [u8; 3],
    pub len: usize,
}

impl FrameHeader {
    /// Reads a header from the start of `bytes`, or `None` if fewer than
    /// [`HEADER_LEN`] bytes are available.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        Some(Self {
            selector: bytes[0],
            reserved: [bytes[1], bytes[2], bytes[3]],
            len,
        })
    }

    pub fn stream(&self) -> StreamType {
        StreamType::from_selector(self.selector)
    }
}

fn push_text(frames: &mut Vec<LogFrame>, stream: StreamType, bytes: &[u8]) {
    if let Some(frame) = LogFrame::new(stream, &String::from_utf8_lossy(bytes)) {
        frames.push(frame);
    }
}

/// Splits one chunk into log frames without carrying state between calls.
///
/// A trailing partial header is emitted as stdout text; a header whose payload
/// runs past the end of the chunk has the remaining bytes emitted under the
/// header's stream. Scanning stops at either point. Never fails.
pub fn demux(chunk: &[u8]) -> Vec<LogFrame> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < chunk.len() {
        let rest = &chunk[offset..];
        let Some(header) = FrameHeader::parse(rest) else {
            push_text(&mut frames, StreamType::Stdout, rest);
            break;
        };

        let payload = &rest[HEADER_LEN..];
        if header.len > payload.len() {
            push_text(&mut frames, header.stream(), payload);
            break;
        }

        push_text(&mut frames, header.stream(), &payload[..header.len]);
        offset += HEADER_LEN + header.len;
    }

    frames
}

/// Decodes a complete, non-multiplexed log body: one stdout frame per
/// non-blank line.
pub fn split_plain_text(body: &[u8]) -> Vec<LogFrame> {
    String::from_utf8_lossy(body)
        .split('\n')
        .filter_map(LogFrame::stdout)
        .collect()
}

/// Stateful demultiplexer that reassembles frames split across chunks.
///
/// Incomplete trailing frames are held back until the next chunk arrives.
/// A frame longer than [`MAX_BUFFERED_FRAME`] is emitted piecewise under its
/// header's stream instead. Whatever is still pending at
/// [`FrameDecoder::finish`] goes through the lossy [`demux`] fallback.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: BytesMut,
    /// Stream and remaining payload of an oversized frame being passed on.
    draining: Option<(StreamType, usize)>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> Vec<LogFrame> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while !self.pending.is_empty() {
            if let Some((stream, remaining)) = self.draining {
                let take = remaining.min(self.pending.len());
                let piece = self.pending.split_to(take);
                push_text(&mut frames, stream, &piece);
                self.draining = (remaining > take).then_some((stream, remaining - take));
                continue;
            }

            let Some(header) = FrameHeader::parse(&self.pending) else {
                break;
            };
            let total = HEADER_LEN + header.len;
            if self.pending.len() >= total {
                let frame = self.pending.split_to(total);
                push_text(&mut frames, header.stream(), &frame[HEADER_LEN..]);
            } else if header.len > MAX_BUFFERED_FRAME {
                self.pending.advance(HEADER_LEN);
                self.draining = Some((header.stream(), header.len));
            } else {
                break;
            }
        }

        frames
    }

    /// Flushes held-back bytes through the lossy fallback.
    pub fn finish(&mut self) -> Vec<LogFrame> {
        self.draining = None;
        let rest = self.pending.split();
        demux(&rest)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
