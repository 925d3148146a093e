use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::engine::docker::DEFAULT_SOCKET;
use crate::publisher::PublisherConfig;
use crate::session::MAX_SESSIONS_PER_CONTAINER;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;
const DEFAULT_OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub docker_socket: PathBuf,
    pub max_sessions_per_container: usize,
    pub keep_alive: Duration,
    pub outbound_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            docker_socket: PathBuf::from(DEFAULT_SOCKET),
            max_sessions_per_container: MAX_SESSIONS_PER_CONTAINER,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, falling back to defaults for
    /// missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let docker_socket = lookup("DOCKER_SOCKET")
            .filter(|path| !path.is_empty())
            .or_else(|| {
                lookup("DOCKER_HOST")
                    .and_then(|host| host.strip_prefix("unix://").map(str::to_string))
            })
            .map(PathBuf::from)
            .unwrap_or(defaults.docker_socket);

        Self {
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            docker_socket,
            max_sessions_per_container: parsed::<usize>(&lookup, "MAX_SESSIONS_PER_CONTAINER")
                .filter(|max| *max > 0)
                .unwrap_or(defaults.max_sessions_per_container),
            keep_alive: parsed::<u64>(&lookup, "SSE_KEEP_ALIVE_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.keep_alive),
            outbound_buffer: parsed::<usize>(&lookup, "SSE_OUTBOUND_BUFFER")
                .filter(|size| *size > 0)
                .unwrap_or(defaults.outbound_buffer),
        }
    }

    pub fn publisher(&self) -> PublisherConfig {
        PublisherConfig {
            outbound_buffer: self.outbound_buffer,
            keep_alive: self.keep_alive,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 8080);
        assert_eq!(config.docker_socket, PathBuf::from("/var/run/docker.sock"));
        assert_eq!(config.max_sessions_per_container, 30);
        assert_eq!(config.keep_alive, Duration::from_secs(15));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("PORT", "9000"),
            ("DOCKER_SOCKET", "/tmp/engine.sock"),
            ("MAX_SESSIONS_PER_CONTAINER", "5"),
            ("SSE_KEEP_ALIVE_SECS", "3"),
            ("SSE_OUTBOUND_BUFFER", "8"),
        ]);
        assert_eq!(config.port, 9000);
        assert_eq!(config.docker_socket, PathBuf::from("/tmp/engine.sock"));
        assert_eq!(config.max_sessions_per_container, 5);
        assert_eq!(config.publisher().keep_alive, Duration::from_secs(3));
        assert_eq!(config.publisher().outbound_buffer, 8);
    }

    #[test]
    fn test_docker_host_fallback() {
        let rootless = config(&[("DOCKER_HOST", "unix:///run/user/1000/docker.sock")]);
        assert_eq!(
            rootless.docker_socket,
            PathBuf::from("/run/user/1000/docker.sock")
        );

        let tcp = config(&[("DOCKER_HOST", "tcp://10.0.0.1:2375")]);
        assert_eq!(tcp.docker_socket, PathBuf::from(DEFAULT_SOCKET));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config(&[
            ("PORT", "http"),
            ("MAX_SESSIONS_PER_CONTAINER", "0"),
            ("SSE_KEEP_ALIVE_SECS", "-1"),
        ]);
        assert_eq!(config, Config::default());
    }
}
