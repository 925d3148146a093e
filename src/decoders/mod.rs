pub mod demux;
pub mod stats;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::debug;

use crate::models::{ContainerMetrics, LogFrame};
use demux::{split_plain_text, FrameDecoder};
use stats::{RawStatsSample, StatsSampler};

/// Terminal payload pushed when a log stream ends gracefully.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Turns an engine byte stream into the units a session pushes, one event each.
pub trait TelemetryDecoder: Send + 'static {
    type Item: Serialize + Send;

    /// Decodes one upstream chunk. Undecodable input is dropped, never an error.
    fn decode(&mut self, chunk: &[u8]) -> Vec<Self::Item>;

    /// Drains whatever is still buffered once upstream has ended.
    fn finish(&mut self) -> Vec<Self::Item>;

    /// In-band marker sent after `finish` on graceful end, if the stream has one.
    fn sentinel(&self) -> Option<&'static str>;
}

/// Reassembles newline-terminated lines across chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every complete line (newline included) now available.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            lines.push(self.pending.split_to(pos + 1).freeze());
        }
        lines
    }

    /// Returns the unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }
}

/// Log decoding for either shape of engine log body.
#[derive(Debug)]
pub enum LogDecoder {
    /// stdout/stderr frames with 8 byte headers.
    Multiplexed(FrameDecoder),
    /// Undelimited text (TTY containers, static bodies), one frame per line.
    Plain(LineBuffer),
}

impl LogDecoder {
    pub fn multiplexed() -> Self {
        LogDecoder::Multiplexed(FrameDecoder::new())
    }

    pub fn plain() -> Self {
        LogDecoder::Plain(LineBuffer::new())
    }
}

impl TelemetryDecoder for LogDecoder {
    type Item = LogFrame;

    fn decode(&mut self, chunk: &[u8]) -> Vec<LogFrame> {
        match self {
            LogDecoder::Multiplexed(frames) => frames.decode(chunk),
            LogDecoder::Plain(lines) => lines
                .push(chunk)
                .iter()
                .flat_map(|line| split_plain_text(line))
                .collect(),
        }
    }

    fn finish(&mut self) -> Vec<LogFrame> {
        match self {
            LogDecoder::Multiplexed(frames) => frames.finish(),
            LogDecoder::Plain(lines) => lines
                .finish()
                .map(|rest| split_plain_text(&rest))
                .unwrap_or_default(),
        }
    }

    fn sentinel(&self) -> Option<&'static str> {
        Some(DONE_SENTINEL)
    }
}

/// Newline-delimited JSON stats decoding. Lines that fail to parse are skipped.
#[derive(Debug, Default)]
pub struct StatsDecoder {
    lines: LineBuffer,
    sampler: StatsSampler,
}

impl StatsDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<ContainerMetrics> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_slice::<RawStatsSample>(line) {
            Ok(sample) => Some(self.sampler.observe(sample)),
            Err(e) => {
                debug!("Skipping malformed stats line ({} bytes): {}", line.len(), e);
                None
            }
        }
    }
}

impl TelemetryDecoder for StatsDecoder {
    type Item = ContainerMetrics;

    fn decode(&mut self, chunk: &[u8]) -> Vec<ContainerMetrics> {
        let lines = self.lines.push(chunk);
        lines
            .iter()
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    fn finish(&mut self) -> Vec<ContainerMetrics> {
        let rest = self.lines.finish();
        rest.and_then(|line| self.decode_line(&line))
            .into_iter()
            .collect()
    }

    fn sentinel(&self) -> Option<&'static str> {
        None
    }
}
