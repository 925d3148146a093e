//! Bridges one engine subscription to one server-sent event stream.
//!
//! A [`Session`] is a plain state machine: it is fed upstream events and
//! answers with the pushes to deliver. [`run_session`] drives it from a task,
//! racing upstream data against the client going away.

use std::convert::Infallible;
use std::time::Duration;

use axum::http::{header, HeaderValue};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::decoders::TelemetryDecoder;
use crate::engine::ByteStream;
use crate::error::EngineError;
use crate::models::StreamKind;
use crate::session::SessionGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Streaming,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    UpstreamEnd,
    UpstreamError,
    ClientAbort,
}

/// One unit to write to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Push<T> {
    Data(T),
    Sentinel(&'static str),
}

pub struct Session<D: TelemetryDecoder> {
    label: String,
    state: SessionState,
    decoder: Option<D>,
    close_reason: Option<CloseReason>,
}

impl<D: TelemetryDecoder> Session<D> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: SessionState::Opening,
            decoder: None,
            close_reason: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// The engine accepted the subscription; `decoder` matches its body shape.
    pub fn opened(&mut self, decoder: D) {
        if self.state == SessionState::Opening {
            self.decoder = Some(decoder);
            self.state = SessionState::Streaming;
        }
    }

    pub fn on_chunk(&mut self, chunk: &[u8]) -> Vec<Push<D::Item>> {
        match (&self.state, self.decoder.as_mut()) {
            (SessionState::Streaming, Some(decoder)) => {
                decoder.decode(chunk).into_iter().map(Push::Data).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Upstream ended: flush, then the sentinel if the stream has one.
    pub fn on_end(&mut self) -> Vec<Push<D::Item>> {
        if !self.close(CloseReason::UpstreamEnd) {
            return Vec::new();
        }
        let Some(decoder) = self.decoder.as_mut() else {
            return Vec::new();
        };
        let mut pushes: Vec<_> = decoder.finish().into_iter().map(Push::Data).collect();
        if let Some(sentinel) = decoder.sentinel() {
            pushes.push(Push::Sentinel(sentinel));
        }
        pushes
    }

    /// Upstream failed mid-stream. The client only sees the stream close.
    pub fn on_error(&mut self, error: &EngineError) -> Vec<Push<D::Item>> {
        if self.state != SessionState::Closed {
            warn!("Upstream error on {}: {}", self.label, error);
        }
        self.close(CloseReason::UpstreamError);
        Vec::new()
    }

    /// The client went away. Returns whether this call closed the session.
    pub fn on_abort(&mut self) -> bool {
        self.close(CloseReason::ClientAbort)
    }

    fn close(&mut self, reason: CloseReason) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        self.close_reason = Some(reason);
        info!("Closing {} ({:?})", self.label, reason);
        true
    }
}

fn to_event<T: serde::Serialize>(push: Push<T>) -> Option<Event> {
    match push {
        Push::Data(item) => match Event::default().json_data(item) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!("Dropping unserializable event: {}", e);
                None
            }
        },
        Push::Sentinel(sentinel) => Some(Event::default().data(sentinel)),
    }
}

/// Writes pushes in order. Returns false once the client is gone.
async fn deliver<T: serde::Serialize>(
    tx: &mpsc::Sender<Event>,
    pushes: Vec<Push<T>>,
) -> bool {
    for event in pushes.into_iter().filter_map(to_event) {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

/// Drives one session until upstream ends, fails, or the client disconnects.
///
/// The upstream stream is dropped (releasing the engine connection) as soon as
/// the outbound receiver is gone, even while upstream is idle.
pub async fn run_session<D: TelemetryDecoder>(
    mut session: Session<D>,
    decoder: D,
    mut upstream: ByteStream,
    tx: mpsc::Sender<Event>,
    guard: SessionGuard,
) -> Session<D> {
    let _guard = guard;
    session.opened(decoder);

    while session.state() != SessionState::Closed {
        let pushes = tokio::select! {
            _ = tx.closed() => {
                session.on_abort();
                break;
            }
            next = upstream.next() => match next {
                Some(Ok(chunk)) => session.on_chunk(&chunk),
                Some(Err(e)) => session.on_error(&e),
                None => session.on_end(),
            },
        };

        if !deliver(&tx, pushes).await {
            debug!("Client gone while writing");
            session.on_abort();
        }
    }

    drop(upstream);
    session
}

/// Tunables for outbound streams.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub outbound_buffer: usize,
    pub keep_alive: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            keep_alive: Duration::from_secs(15),
        }
    }
}

/// Spawns the session task for an opened subscription and returns the SSE
/// response feeding off it.
pub fn publish<D: TelemetryDecoder>(
    config: &PublisherConfig,
    kind: StreamKind,
    container: &str,
    guard: SessionGuard,
    decoder: D,
    upstream: ByteStream,
) -> Response {
    let (tx, mut rx) = mpsc::channel::<Event>(config.outbound_buffer.max(1));
    let session = Session::<D>::new(format!("{} session {} for {}", kind, guard.id(), container));

    tokio::spawn(async move {
        run_session(session, decoder, upstream, tx, guard).await;
    });

    let events = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok::<_, Infallible>(event);
        }
    };

    sse_response(events, config.keep_alive)
}

fn sse_response<S>(events: S, keep_alive: Duration) -> Response
where
    S: futures_util::Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    let response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response();

    // Prevent proxies from caching or buffering the stream
    let (mut parts, body) = response.into_parts();
    parts
        .headers
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    parts
        .headers
        .insert("x-accel-buffering", HeaderValue::from_static("no"));
    Response::from_parts(parts, body)
}
