//! Session persistence: last-write-wins JSON documents with a TTL.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, SwitchboardError};
use crate::session::{Session, TransportType};

/// Durable session state. One document per session key; a `save`
/// replaces the whole document (last writer wins). Sessions idle past
/// the TTL are treated as absent.
#[async_trait]
pub trait SessionStateStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    async fn delete(&self, session_id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<SessionSummary>>;
    /// Remove expired sessions, returning how many were dropped.
    async fn sweep(&self) -> Result<usize>;
}

/// Listing entry for inspection tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub transport: TransportType,
    pub active_agent: String,
    pub turns: usize,
    pub last_activity_at: DateTime<Utc>,
}

impl SessionSummary {
    fn of(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            transport: session.transport,
            active_agent: session.active_agent.clone(),
            turns: session.history.len(),
            last_activity_at: session.last_activity_at,
        }
    }
}

fn is_expired(session: &Session, ttl: Duration) -> bool {
    let age = Utc::now() - session.last_activity_at;
    age.to_std().map(|a| a > ttl).unwrap_or(false)
}

/// Stable hash string for use as a session filename.
fn hash_id(session_id: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    session_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// File-based store: `<base>/<hash>.json`, one document per session,
/// written atomically (temp file + rename).
pub struct JsonSessionStore {
    base: PathBuf,
    ttl: Duration,
}

impl JsonSessionStore {
    pub fn new(base: PathBuf, ttl: Duration) -> Self {
        Self { base, ttl }
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.base.join(format!("{}.json", hash_id(session_id)))
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.base)
            .await
            .map_err(|e| SwitchboardError::StateStoreUnavailable(e.to_string()))
    }

    async fn read_doc(&self, path: &PathBuf) -> Result<Option<Session>> {
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SwitchboardError::StateStoreUnavailable(e.to_string()))?;
        let session: Session = serde_json::from_str(&data)
            .map_err(|e| SwitchboardError::Session(format!("corrupt session document: {e}")))?;
        Ok(Some(session))
    }
}

#[async_trait]
impl SessionStateStore for JsonSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.session_path(session_id);
        let Some(session) = self.read_doc(&path).await? else {
            return Ok(None);
        };
        if is_expired(&session, self.ttl) {
            debug!(session = %session_id, "Session expired, dropping on load");
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        debug!(
            session = %session_id,
            entries = session.history.len(),
            "Loaded session"
        );
        Ok(Some(session))
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.ensure_dir().await?;

        let data = serde_json::to_string_pretty(session)?;
        let path = self.session_path(&session.session_id);
        // Atomic write: write to temp then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes())
            .await
            .map_err(|e| SwitchboardError::StateStoreUnavailable(e.to_string()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SwitchboardError::StateStoreUnavailable(e.to_string()))?;

        debug!(session = %session.session_id, "Saved session");
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| SwitchboardError::StateStoreUnavailable(e.to_string()))?;
        }
        debug!(session = %session_id, "Deleted session");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        if !self.base.exists() {
            return Ok(Vec::new());
        }
        let mut entries = tokio::fs::read_dir(&self.base)
            .await
            .map_err(|e| SwitchboardError::StateStoreUnavailable(e.to_string()))?;

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SwitchboardError::StateStoreUnavailable(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_doc(&path).await {
                Ok(Some(session)) if !is_expired(&session, self.ttl) => {
                    summaries.push(SessionSummary::of(&session));
                }
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), %e, "Skipping unreadable session document"),
            }
        }
        summaries.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(summaries)
    }

    async fn sweep(&self) -> Result<usize> {
        if !self.base.exists() {
            return Ok(0);
        }
        let mut entries = tokio::fs::read_dir(&self.base)
            .await
            .map_err(|e| SwitchboardError::StateStoreUnavailable(e.to_string()))?;

        let mut dropped = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SwitchboardError::StateStoreUnavailable(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(Some(session)) = self.read_doc(&path).await {
                if is_expired(&session, self.ttl) {
                    let _ = tokio::fs::remove_file(&path).await;
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            debug!(dropped, "Swept expired sessions");
        }
        Ok(dropped)
    }
}

/// In-memory store for tests and single-process setups.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Option<Duration>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: Some(ttl),
        }
    }
}

#[async_trait]
impl SessionStateStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(session) => {
                if let Some(ttl) = self.ttl {
                    if is_expired(session, ttl) {
                        return Ok(None);
                    }
                }
                Ok(Some(session.clone()))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> =
            sessions.values().map(SessionSummary::of).collect();
        summaries.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(summaries)
    }

    async fn sweep(&self) -> Result<usize> {
        let Some(ttl) = self.ttl else { return Ok(0) };
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !is_expired(s, ttl));
        Ok(before - sessions.len())
    }
}
