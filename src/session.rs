use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{SessionSummary, StreamKind};

pub const MAX_SESSIONS_PER_CONTAINER: usize = 30;

#[derive(Debug, Clone)]
struct SessionEntry {
    container: String,
    kind: StreamKind,
    opened_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("too many open {kind} streams for {container} (limit {limit})")]
    TooManySessions {
        container: String,
        kind: StreamKind,
        limit: usize,
    },
}

type SlotKey = (String, StreamKind);

#[derive(Debug, Default)]
struct Sessions {
    entries: DashMap<Uuid, SessionEntry>,
    /// Open sessions per container and kind. Admission checks and bumps a
    /// count under its shard lock.
    slots: DashMap<SlotKey, usize>,
}

impl Sessions {
    fn release_slot(&self, key: &SlotKey) {
        if let Some(mut open) = self.slots.get_mut(key) {
            *open = open.saturating_sub(1);
        }
        self.slots.remove_if(key, |_, open| *open == 0);
    }
}

/// Removes its session from the registry when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    id: Uuid,
    sessions: Arc<Sessions>,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some((id, entry)) = self.sessions.entries.remove(&self.id) {
            self.sessions
                .release_slot(&(entry.container.clone(), entry.kind));
            info!(
                "Session {} ({} for {}) released",
                id, entry.kind, entry.container
            );
        }
    }
}

/// Tracks every open telemetry session.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Arc<Sessions>,
    max_per_container: usize,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(MAX_SESSIONS_PER_CONTAINER)
    }
}

impl SessionRegistry {
    pub fn new(max_per_container: usize) -> Self {
        Self {
            sessions: Arc::new(Sessions::default()),
            max_per_container,
        }
    }

    /// Admits a new session unless `container` already has the maximum number
    /// of open sessions of this kind.
    pub fn open(&self, container: &str, kind: StreamKind) -> Result<SessionGuard, AdmissionError> {
        {
            let mut open = self
                .sessions
                .slots
                .entry((container.to_string(), kind))
                .or_insert(0);
            if *open >= self.max_per_container {
                warn!(
                    "Rejecting {} stream for {}: max sessions reached",
                    kind, container
                );
                return Err(AdmissionError::TooManySessions {
                    container: container.to_string(),
                    kind,
                    limit: self.max_per_container,
                });
            }
            *open += 1;
        }

        let id = Uuid::new_v4();
        self.sessions.entries.insert(
            id,
            SessionEntry {
                container: container.to_string(),
                kind,
                opened_at: Utc::now(),
            },
        );
        info!("Session {} opened ({} for {})", id, kind, container);

        Ok(SessionGuard {
            id,
            sessions: self.sessions.clone(),
        })
    }

    pub fn count(&self, container: &str, kind: StreamKind) -> usize {
        self.sessions
            .slots
            .get(&(container.to_string(), kind))
            .map(|open| *open)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.sessions.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.entries.is_empty()
    }

    /// Open sessions, oldest first.
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut entries: Vec<(Uuid, SessionEntry)> = self
            .sessions
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(_, entry)| entry.opened_at);

        entries
            .into_iter()
            .map(|(id, entry)| SessionSummary {
                id,
                container: entry.container,
                kind: entry.kind,
                opened_at: entry.opened_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            })
            .collect()
    }
}
