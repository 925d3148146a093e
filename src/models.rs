use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which container output stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
}

impl StreamType {
    /// Maps the engine's frame selector byte. Anything other than 2 is stdout.
    pub fn from_selector(selector: u8) -> Self {
        if selector == 2 {
            StreamType::Stderr
        } else {
            StreamType::Stdout
        }
    }
}

/// One decoded line of container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFrame {
    pub stream: StreamType,
    pub text: String,
}

impl LogFrame {
    /// Trims `text` and returns `None` when nothing is left.
    pub fn new(stream: StreamType, text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(Self {
            stream,
            text: text.to_string(),
        })
    }

    pub fn stdout(text: &str) -> Option<Self> {
        Self::new(StreamType::Stdout, text)
    }
}

/// Client-facing resource snapshot derived from two consecutive engine samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerMetrics {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
    pub timestamp: String,
}

/// JSON body for failures reported before (or instead of) a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl ToString) -> Self {
        self.details = Some(details.to_string());
        self
    }
}

/// The two telemetry channels a client can open for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Logs,
    Stats,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Logs => f.write_str("logs"),
            StreamKind::Stats => f.write_str("stats"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub container: String,
    pub kind: StreamKind,
    #[serde(rename = "openedAt")]
    pub opened_at: String,
}
