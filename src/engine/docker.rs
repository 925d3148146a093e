//! Docker Engine API adapter.
//!
//! Container resolution goes through bollard. Log and stats bodies are read
//! straight off the Unix socket with a minimal HTTP/1.0 exchange, because the
//! log demultiplexing has to see the engine's raw frames. HTTP/1.0 keeps the
//! body unchunked and delimited by connection close.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::debug;

use super::{ByteStream, ContainerEngine, ContainerStatus, LogOptions, LogSource};
use crate::error::EngineError;

pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

const CLIENT_TIMEOUT_SECS: u64 = 120;
const READ_CHUNK: usize = 16 * 1024;
/// Cap on bodies read whole (error messages, static TTY logs).
const MAX_BODY: u64 = 16 * 1024 * 1024;

pub struct DockerEngine {
    docker: Docker,
    socket_path: PathBuf,
}

impl DockerEngine {
    pub fn connect(socket_path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let socket_path = socket_path.into();
        let docker = Docker::connect_with_unix(
            &socket_path.to_string_lossy(),
            CLIENT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )?;
        Ok(Self {
            docker,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn get(&self, path: &str) -> Result<RawResponse, EngineError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(EngineError::Unreachable)?;
        let (reader, mut writer) = stream.into_split();

        let request = format!("GET {} HTTP/1.0\r\nHost: docker\r\n\r\n", path);
        writer.write_all(request.as_bytes()).await?;

        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let status = parse_status_line(&line)?;

        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line.trim().is_empty() {
                break;
            }
        }

        Ok(RawResponse {
            status,
            body: reader,
            writer,
        })
    }

    /// Opens a streaming endpoint, mapping non-success statuses to errors.
    async fn open(&self, container: &str, path: &str) -> Result<RawResponse, EngineError> {
        let response = self.get(path).await?;
        match response.status {
            200..=299 => Ok(response),
            404 => Err(EngineError::NotFound(container.to_string())),
            status => {
                let body = response.read_all().await?;
                Err(EngineError::Status {
                    status,
                    message: error_message(&body),
                })
            }
        }
    }
}

struct RawResponse {
    status: u16,
    body: BufReader<OwnedReadHalf>,
    // Half-closing the socket makes the engine drop follow streams.
    writer: OwnedWriteHalf,
}

impl RawResponse {
    async fn read_all(self) -> Result<Bytes, EngineError> {
        let mut body = Vec::new();
        self.body.take(MAX_BODY).read_to_end(&mut body).await?;
        Ok(Bytes::from(body))
    }

    fn into_stream(self) -> ByteStream {
        let RawResponse { body, writer, .. } = self;
        Box::pin(async_stream::try_stream! {
            let _writer = writer;
            let mut body = body;
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = body.read(&mut buf).await.map_err(EngineError::Io)?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        })
    }
}

fn parse_status_line(line: &str) -> Result<u16, EngineError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| EngineError::Protocol(format!("bad status line: {}", line.trim()))),
        _ => Err(EngineError::Protocol(format!(
            "bad status line: {}",
            line.trim()
        ))),
    }
}

#[derive(Deserialize)]
struct EngineMessage {
    message: String,
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<EngineMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

/// Container ids and names only ever use these characters; anything else is
/// refused before it can reach a request line.
fn is_container_ref(container: &str) -> bool {
    !container.is_empty()
        && container
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn logs_path(container: &str, options: &LogOptions) -> String {
    format!(
        "/containers/{}/logs?follow={}&stdout=true&stderr=true&tail={}&timestamps={}",
        container, options.follow, options.tail, options.timestamps
    )
}

fn stats_path(container: &str) -> String {
    format!("/containers/{}/stats?stream=true", container)
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn inspect(&self, container: &str) -> Result<ContainerStatus, EngineError> {
        if !is_container_ref(container) {
            return Err(EngineError::NotFound(container.to_string()));
        }

        let info = self
            .docker
            .inspect_container(container, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => EngineError::NotFound(container.to_string()),
                other => EngineError::Docker(other),
            })?;

        Ok(ContainerStatus {
            id: info.id.unwrap_or_else(|| container.to_string()),
            running: info.state.and_then(|s| s.running).unwrap_or(false),
            tty: info.config.and_then(|c| c.tty).unwrap_or(false),
        })
    }

    async fn logs(&self, container: &str, options: LogOptions) -> Result<LogSource, EngineError> {
        let status = self.inspect(container).await?;
        debug!(
            "Opening log stream for {} (follow={}, tail={}, tty={})",
            status.id, options.follow, options.tail, status.tty
        );

        let response = self.open(container, &logs_path(&status.id, &options)).await?;
        if !status.tty {
            return Ok(LogSource::Multiplexed(response.into_stream()));
        }
        if options.follow {
            Ok(LogSource::Raw(response.into_stream()))
        } else {
            Ok(LogSource::Static(response.read_all().await?))
        }
    }

    async fn stats(&self, container: &str) -> Result<ByteStream, EngineError> {
        let status = self.inspect(container).await?;
        debug!("Opening stats stream for {}", status.id);
        let response = self.open(container, &stats_path(&status.id)).await?;
        Ok(response.into_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Tail;

    #[test]
    fn test_status_line_parsing() {
        assert_eq!(parse_status_line("HTTP/1.0 200 OK\r\n").unwrap(), 200);
        assert_eq!(parse_status_line("HTTP/1.1 404 Not Found\r\n").unwrap(), 404);
        assert!(parse_status_line("garbage\r\n").is_err());
        assert!(parse_status_line("").is_err());
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(br#"{"message":"No such container: web"}"#),
            "No such container: web"
        );
        assert_eq!(error_message(b"plain failure\n"), "plain failure");
    }

    #[test]
    fn test_container_ref_validation() {
        assert!(is_container_ref("web_1"));
        assert!(is_container_ref("3f4e2a1b9c0d"));
        assert!(is_container_ref("my.app-db"));
        assert!(!is_container_ref(""));
        assert!(!is_container_ref("web HTTP/1.0\r\n"));
        assert!(!is_container_ref("../images"));
    }

    #[test]
    fn test_request_paths() {
        let options = LogOptions {
            follow: false,
            tail: Tail::Lines(50),
            timestamps: true,
        };
        assert_eq!(
            logs_path("abc", &options),
            "/containers/abc/logs?follow=false&stdout=true&stderr=true&tail=50&timestamps=true"
        );
        assert_eq!(stats_path("abc"), "/containers/abc/stats?stream=true");
    }

    #[tokio::test]
    async fn test_streams_raw_body_from_socket() {
        use tokio::net::UnixListener;

        let dir = std::env::temp_dir().join(format!("dockwatch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let socket = dir.join("engine.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 1024];
            let _ = conn.read(&mut request).await.unwrap();
            conn.write_all(
                b"HTTP/1.0 200 OK\r\nContent-Type: application/vnd.docker.multiplexed-stream\r\n\r\n",
            )
            .await
            .unwrap();
            conn.write_all(&[1, 0, 0, 0, 0, 0, 0, 5]).await.unwrap();
            conn.write_all(b"hello").await.unwrap();
        });

        let engine = DockerEngine::connect(&socket).unwrap();
        let response = engine.open("abc", "/containers/abc/logs").await.unwrap();
        assert_eq!(response.status, 200);

        use futures_util::StreamExt;
        let body: Vec<u8> = response
            .into_stream()
            .map(|chunk| chunk.unwrap().to_vec())
            .concat()
            .await;
        assert_eq!(&body[..8], &[1, 0, 0, 0, 0, 0, 0, 5]);
        assert_eq!(&body[8..], b"hello");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
