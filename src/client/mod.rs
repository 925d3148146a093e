//! Subscriber side of the telemetry streams.
//!
//! A [`StreamConsumer`] holds at most one live subscription. Replacing it with
//! [`StreamConsumer::connect`] cancels the previous one, and nothing retries on
//! its own: after a sentinel, an error or a closed response the consumer stays
//! [`ConnectionState::Disconnected`] until the caller reconnects. Buffered
//! history survives reconnects until [`StreamConsumer::clear`] is called.

mod buffer;
mod sse;

pub use buffer::BoundedBuffer;
pub use sse::{SseMessage, SseParser};

use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::decoders::DONE_SENTINEL;
use crate::engine::Tail;
use crate::models::{ContainerMetrics, LogFrame};

pub const LOG_BUFFER_CAPACITY: usize = 5000;
pub const METRICS_HISTORY_CAPACITY: usize = 60;

/// A payload type that can be received over a telemetry stream.
pub trait StreamPayload: DeserializeOwned + Clone + Send + 'static {
    /// Entries kept before the oldest is evicted.
    const CAPACITY: usize;
}

impl StreamPayload for LogFrame {
    const CAPACITY: usize = LOG_BUFFER_CAPACITY;
}

impl StreamPayload for ContainerMetrics {
    const CAPACITY: usize = METRICS_HISTORY_CAPACITY;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
enum StreamEvent {
    Opened,
    Message(SseMessage),
    Closed,
}

/// Buffer and connection state shared with the reader task.
///
/// Every event carries the generation of the subscription that produced it.
/// Events from a replaced subscription are ignored.
#[derive(Debug)]
struct ConsumerInner<T> {
    state: ConnectionState,
    buffer: BoundedBuffer<T>,
    generation: u64,
}

impl<T: StreamPayload> ConsumerInner<T> {
    fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            buffer: BoundedBuffer::new(T::CAPACITY),
            generation: 0,
        }
    }

    fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.generation
    }

    fn end(&mut self) {
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
    }

    /// Returns whether the reader should keep going.
    fn apply(&mut self, generation: u64, event: StreamEvent) -> bool {
        if generation != self.generation {
            return false;
        }

        match event {
            StreamEvent::Opened => {
                self.state = ConnectionState::Connected;
                true
            }
            StreamEvent::Message(message) if !message.is_message() => {
                debug!("Ignoring {:?} event", message.event);
                true
            }
            StreamEvent::Message(message) if message.data == DONE_SENTINEL => {
                self.state = ConnectionState::Disconnected;
                false
            }
            StreamEvent::Message(message) => {
                match serde_json::from_str::<T>(&message.data) {
                    Ok(item) => self.buffer.push(item),
                    Err(e) => debug!("Dropping malformed payload: {}", e),
                }
                true
            }
            StreamEvent::Closed => {
                self.state = ConnectionState::Disconnected;
                false
            }
        }
    }
}

pub struct StreamConsumer<T: StreamPayload> {
    http: reqwest::Client,
    url: String,
    inner: Arc<Mutex<ConsumerInner<T>>>,
    task: Option<JoinHandle<()>>,
}

pub type LogConsumer = StreamConsumer<LogFrame>;
pub type MetricsConsumer = StreamConsumer<ContainerMetrics>;

impl StreamConsumer<LogFrame> {
    pub fn logs(base_url: &str, container: &str, tail: Tail, follow: bool) -> Self {
        Self::new(format!(
            "{}/api/containers/{}/logs?tail={}&follow={}",
            base_url.trim_end_matches('/'),
            container,
            tail,
            follow
        ))
    }
}

impl StreamConsumer<ContainerMetrics> {
    pub fn metrics(base_url: &str, container: &str) -> Self {
        Self::new(format!(
            "{}/api/containers/{}/stats",
            base_url.trim_end_matches('/'),
            container
        ))
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<ContainerMetrics> {
        self.lock().buffer.latest().cloned()
    }
}

impl<T: StreamPayload> StreamConsumer<T> {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            inner: Arc::new(Mutex::new(ConsumerInner::new())),
            task: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Opens a new subscription, cancelling the current one first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let generation = self.lock().begin();
        info!("Subscribing to {}", self.url);

        self.task = Some(tokio::spawn(read_stream(
            self.http.clone(),
            self.url.clone(),
            self.inner.clone(),
            generation,
        )));
    }

    pub fn reconnect(&mut self) {
        self.connect();
    }

    pub fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.lock().end();
    }

    /// Empties the buffer without touching the connection.
    pub fn clear(&self) {
        self.lock().buffer.clear();
    }

    /// Buffered payloads, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().buffer.to_vec()
    }

    pub fn len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buffer.is_empty()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn lock(&self) -> MutexGuard<'_, ConsumerInner<T>> {
        lock(&self.inner)
    }
}

impl<T: StreamPayload> Drop for StreamConsumer<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn lock<T>(inner: &Mutex<ConsumerInner<T>>) -> MutexGuard<'_, ConsumerInner<T>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn read_stream<T: StreamPayload>(
    http: reqwest::Client,
    url: String,
    inner: Arc<Mutex<ConsumerInner<T>>>,
    generation: u64,
) {
    let apply = |event: StreamEvent| lock(&inner).apply(generation, event);

    let response = match http
        .get(&url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .and_then(|response| response.error_for_status())
    {
        Ok(response) => response,
        Err(e) => {
            warn!("Failed to subscribe to {}: {}", url, e);
            apply(StreamEvent::Closed);
            return;
        }
    };

    if !apply(StreamEvent::Opened) {
        return;
    }

    let mut body = response.bytes_stream();
    let mut parser = SseParser::new();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for message in parser.push(&bytes) {
                    if !apply(StreamEvent::Message(message)) {
                        info!("Subscription to {} finished", url);
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Subscription to {} failed: {}", url, e);
                break;
            }
        }
    }

    apply(StreamEvent::Closed);
}
