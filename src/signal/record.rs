//! SessionRecord: every session we hold for one remote address, keyed by
//! basing secret, with at most one open at a time.

use crate::error::{Error, Result};
use crate::signal::ratchet::{BaseKeyType, SessionState};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Retirement bound: closed sessions beyond this count are evicted
const CLOSED_SESSIONS_MAX: usize = 40;

const RECORD_VERSION: &str = "v1";

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionRecord {
    sessions: HashMap<String, SessionState>,
}

#[derive(Serialize, Deserialize)]
struct RecordDocument {
    version: Option<String>,
    #[serde(rename = "_sessions", default)]
    sessions: HashMap<String, SessionState>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize to the stable persisted document
    pub fn serialize(&self) -> Result<String> {
        let doc = RecordDocument {
            version: Some(RECORD_VERSION.to_string()),
            sessions: self.sessions.clone(),
        };
        Ok(serde_json::to_string(&doc)?)
    }

    /// Parse a persisted document, migrating earlier versions first
    pub fn deserialize(data: &str) -> Result<Self> {
        let mut doc: serde_json::Value = serde_json::from_str(data)?;
        match doc.get("version").and_then(|v| v.as_str()) {
            Some(RECORD_VERSION) => {}
            None => migrate_v1(&mut doc),
            Some(other) => {
                return Err(Error::Session(format!(
                    "Unknown session record version: {}",
                    other
                )))
            }
        }

        let doc: RecordDocument = serde_json::from_value(doc)?;
        Ok(Self {
            sessions: doc.sessions,
        })
    }

    pub fn have_open_session(&self) -> bool {
        self.open_session().is_some()
    }

    pub fn open_session(&self) -> Option<&SessionState> {
        self.sessions.values().find(|s| s.index_info.closed == -1)
    }

    pub fn open_session_mut(&mut self) -> Option<&mut SessionState> {
        self.sessions
            .values_mut()
            .find(|s| s.index_info.closed == -1)
    }

    /// Look up a session by the peer's basing secret.
    ///
    /// Sessions based on our own key are reachable only through
    /// [`Self::sessions`]; asking for one by key is a caller bug.
    pub fn session(&self, base_key: &[u8]) -> Result<Option<&SessionState>> {
        match self.sessions.get(&STANDARD.encode(base_key)) {
            Some(session) if session.index_info.base_key_type == BaseKeyType::Ours => Err(
                Error::Session("Tried to lookup a session using our own base key".to_string()),
            ),
            session => Ok(session),
        }
    }

    /// All sessions, most recently used first: the trial-decryption order
    pub fn sessions(&self) -> Vec<&SessionState> {
        let mut sessions: Vec<&SessionState> = self.sessions.values().collect();
        sessions.sort_by(|a, b| b.index_info.used.cmp(&a.index_info.used));
        sessions
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// File `session` under its basing secret, replacing any previous state
    pub fn set_session(&mut self, session: SessionState) {
        self.sessions
            .insert(STANDARD.encode(&session.index_info.base_key), session);
        self.remove_old_sessions();
    }

    /// Close the open session, if any, retaining it for late messages
    pub fn archive_current_state(&mut self) {
        if let Some(open) = self.open_session_mut() {
            tracing::debug!(
                base_key = %STANDARD.encode(&open.index_info.base_key),
                "closing session"
            );
            open.index_info.closed = now_ms();
        }
    }

    /// Evict closed sessions, oldest first, until the bound holds
    fn remove_old_sessions(&mut self) {
        while self.sessions.len() > CLOSED_SESSIONS_MAX {
            let oldest = self
                .sessions
                .iter()
                .filter(|(_, s)| s.index_info.closed != -1)
                .min_by_key(|(_, s)| s.index_info.closed)
                .map(|(key, _)| key.clone());

            match oldest {
                Some(key) => {
                    tracing::info!(base_key = %key, "evicting retired session");
                    self.sessions.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn delete_all_sessions(&mut self) {
        self.sessions.clear();
    }
}

/// Version-less documents predate the `version` field: stamp missing
/// `closed` markers and tag the document.
fn migrate_v1(doc: &mut serde_json::Value) {
    tracing::info!("migrating legacy session record to v1");
    if let Some(sessions) = doc.get_mut("_sessions").and_then(|v| v.as_object_mut()) {
        for session in sessions.values_mut() {
            if let Some(index_info) = session.get_mut("index_info").and_then(|v| v.as_object_mut())
            {
                index_info.entry("closed").or_insert(json!(-1));
            }
        }
    }
    doc["version"] = json!(RECORD_VERSION);
}
