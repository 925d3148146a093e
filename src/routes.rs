use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::debug;

use crate::decoders::{LogDecoder, StatsDecoder};
use crate::engine::{ByteStream, ContainerEngine, LogOptions, LogSource, Tail};
use crate::error::{ApiError, EngineError};
use crate::models::{ErrorBody, SessionSummary, StreamKind};
use crate::publisher::{publish, PublisherConfig};
use crate::session::{AdmissionError, SessionRegistry};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn ContainerEngine>,
    pub sessions: Arc<SessionRegistry>,
    pub publisher: PublisherConfig,
}

impl AppState {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        sessions: SessionRegistry,
        publisher: PublisherConfig,
    ) -> Self {
        Self {
            engine,
            sessions: Arc::new(sessions),
            publisher,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/containers/{id}/logs", get(stream_logs))
        .route("/api/containers/{id}/stats", get(stream_stats))
        .route("/api/sessions", get(list_sessions))
        // Streams set their own Cache-Control; this only covers JSON replies
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .route("/liveness_check", get(health_check))
        .route("/readiness_check", get(health_check))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
                .expose_headers([header::CONTENT_TYPE]),
        )
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        ApiError::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorBody::new("Too many open streams").with_details(e),
        )
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub tail: Option<String>,
    pub follow: Option<String>,
}

impl LogQuery {
    pub fn options(&self) -> LogOptions {
        let tail = match self.tail.as_deref() {
            None => Tail::DEFAULT,
            Some(raw) => Tail::parse(raw).unwrap_or_else(|| {
                debug!("Ignoring unparsable tail {:?}", raw);
                Tail::DEFAULT
            }),
        };
        LogOptions {
            follow: self.follow.as_deref() != Some("false"),
            tail,
            timestamps: true,
        }
    }
}

async fn open_logs(
    engine: &dyn ContainerEngine,
    container: &str,
    options: LogOptions,
) -> Result<(LogDecoder, ByteStream), EngineError> {
    let source = engine.logs(container, options).await?;
    Ok(match source {
        LogSource::Multiplexed(stream) => (LogDecoder::multiplexed(), stream),
        LogSource::Raw(stream) => (LogDecoder::plain(), stream),
        LogSource::Static(body) => (
            LogDecoder::plain(),
            futures_util::stream::once(async move { Ok::<_, EngineError>(body) }).boxed(),
        ),
    })
}

async fn stream_logs(
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let container = state
        .engine
        .inspect(&id)
        .await
        .map_err(|e| ApiError::engine("Failed to get logs", &e))?;

    let guard = state.sessions.open(&container.id, StreamKind::Logs)?;
    let (decoder, upstream) = open_logs(state.engine.as_ref(), &container.id, query.options())
        .await
        .map_err(|e| ApiError::engine("Failed to get logs", &e))?;

    Ok(publish(
        &state.publisher,
        StreamKind::Logs,
        &container.id,
        guard,
        decoder,
        upstream,
    ))
}

async fn stream_stats(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let container = state
        .engine
        .inspect(&id)
        .await
        .map_err(|e| ApiError::engine("Failed to get stats", &e))?;

    if !container.running {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorBody::new("Container is not running"),
        ));
    }

    let guard = state.sessions.open(&container.id, StreamKind::Stats)?;
    let upstream = state
        .engine
        .stats(&container.id)
        .await
        .map_err(|e| ApiError::engine("Failed to get stats", &e))?;

    Ok(publish(
        &state.publisher,
        StreamKind::Stats,
        &container.id,
        guard,
        StatsDecoder::new(),
        upstream,
    ))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.snapshot())
}
