//! The container engine as seen by the telemetry core.
//!
//! Subscriptions are returned as byte streams; dropping a stream releases the
//! engine-side connection.

pub mod docker;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::error::EngineError;

pub use docker::DockerEngine;

pub type ByteStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// How many historical log lines to replay before following.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    All,
    Lines(u64),
}

impl Tail {
    pub const DEFAULT: Tail = Tail::Lines(200);

    /// Parses `all` or a non-negative integer.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("all") {
            return Some(Tail::All);
        }
        value.parse().ok().map(Tail::Lines)
    }
}

impl Default for Tail {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Tail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tail::All => f.write_str("all"),
            Tail::Lines(n) => write!(f, "{}", n),
        }
    }
}

/// Log request. Both stdout and stderr are always requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    pub follow: bool,
    pub tail: Tail,
    pub timestamps: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: true,
            tail: Tail::DEFAULT,
            timestamps: true,
        }
    }
}

/// The body shapes an engine can answer a log request with.
pub enum LogSource {
    /// Continuous stdout/stderr frames with 8 byte headers.
    Multiplexed(ByteStream),
    /// Continuous unframed text (TTY containers).
    Raw(ByteStream),
    /// A complete body delivered at once.
    Static(Bytes),
}

impl fmt::Debug for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Multiplexed(_) => f.write_str("Multiplexed(..)"),
            LogSource::Raw(_) => f.write_str("Raw(..)"),
            LogSource::Static(body) => write!(f, "Static({} bytes)", body.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub id: String,
    pub running: bool,
    pub tty: bool,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync + 'static {
    /// Resolves a container by id or name.
    async fn inspect(&self, container: &str) -> Result<ContainerStatus, EngineError>;

    async fn logs(&self, container: &str, options: LogOptions) -> Result<LogSource, EngineError>;

    /// Newline-delimited JSON stats samples, streamed.
    async fn stats(&self, container: &str) -> Result<ByteStream, EngineError>;
}
