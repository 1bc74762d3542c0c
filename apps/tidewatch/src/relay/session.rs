//! Session store for downstream viewers. Records survive socket churn so a
//! viewer can resume; each record carries a cleanup task that removes it a
//! fixed TTL after its last access, and every access resets that task.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session token bound to a different client fingerprint")]
    FingerprintMismatch,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub fingerprint: String,
    /// Ordered; the first entry is the viewer's primary tracked subject.
    pub subscribed_subject_ids: Vec<String>,
    /// Outbound sequence checkpoint persisted when the owning connection
    /// is torn down; resume validates against this.
    pub last_seq: u64,
    pub last_access: Instant,
}

#[derive(Debug)]
pub enum ResumeOutcome {
    Matched {
        subject_ids: Vec<String>,
        last_seq: u64,
    },
    Mismatch,
}

pub struct SessionStore {
    ttl: Duration,
    records: DashMap<String, SessionRecord>,
    cleanups: DashMap<String, JoinHandle<()>>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: DashMap::new(),
            cleanups: DashMap::new(),
        }
    }

    /// Resolve a session token to its record, creating one on first use.
    /// An existing record only resolves for the fingerprint it was created
    /// with; anything else is treated as an invalid session.
    pub fn identify(
        self: &Arc<Self>,
        token: &str,
        fingerprint: &str,
        subject_ids: Vec<String>,
    ) -> Result<(), SessionError> {
        if let Some(mut record) = self.records.get_mut(token) {
            if record.fingerprint != fingerprint {
                return Err(SessionError::FingerprintMismatch);
            }
            record.subscribed_subject_ids = subject_ids;
            record.last_access = Instant::now();
        } else {
            self.records.insert(
                token.to_string(),
                SessionRecord {
                    session_id: token.to_string(),
                    fingerprint: fingerprint.to_string(),
                    subscribed_subject_ids: subject_ids,
                    last_seq: 0,
                    last_access: Instant::now(),
                },
            );
            debug!(session_id = token, "session record created");
        }
        self.schedule_cleanup(token);
        Ok(())
    }

    /// Validate a resume claim. Matching requires the exact session id and
    /// sequence checkpoint held server-side; either way any pending TTL
    /// cleanup for the id is cancelled.
    pub fn resume(&self, session_id: &str, seq: u64) -> ResumeOutcome {
        self.cancel_cleanup(session_id);
        match self.records.get_mut(session_id) {
            Some(mut record) if record.last_seq == seq => {
                record.last_access = Instant::now();
                ResumeOutcome::Matched {
                    subject_ids: record.subscribed_subject_ids.clone(),
                    last_seq: record.last_seq,
                }
            }
            _ => ResumeOutcome::Mismatch,
        }
    }

    /// Persist a connection's outbound sequence into its record and start
    /// the TTL clock. Called at viewer teardown; the record stays resumable
    /// until the TTL fires.
    pub fn checkpoint(self: &Arc<Self>, session_id: &str, seq: u64) {
        if let Some(mut record) = self.records.get_mut(session_id) {
            record.last_seq = seq;
            record.last_access = Instant::now();
        }
        self.schedule_cleanup(session_id);
    }

    pub fn schedule_cleanup(self: &Arc<Self>, session_id: &str) {
        self.cancel_cleanup(session_id);
        let store = Arc::clone(self);
        let id = session_id.to_string();
        let handle = tokio::spawn({
            let id = id.clone();
            async move {
                sleep(store.ttl).await;
                store.records.remove(&id);
                store.cleanups.remove(&id);
                debug!(session_id = %id, "session expired");
            }
        });
        self.cleanups.insert(id, handle);
    }

    pub fn cancel_cleanup(&self, session_id: &str) {
        if let Some((_, handle)) = self.cleanups.remove(session_id) {
            handle.abort();
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.records.get(session_id).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Fingerprint of the connecting client, derived from its observable
/// attributes. Stable across reconnects from the same client, so a stolen
/// session token from elsewhere fails identify.
pub fn fingerprint(remote_addr: &SocketAddr, user_agent: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(remote_addr.ip().to_string().as_bytes());
    if let Some(agent) = user_agent {
        hasher.update(agent.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
