//! Session Registry (C3): the process-global map of session-id to session
//! record, passed in as an explicit dependency rather than a module-level
//! singleton (per the design notes on process-wide maps).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use dashmap::DashMap;
use log::info;
use tokio::sync::mpsc::Sender;

use crate::session::record::{SessionRecord, SessionState};
use crate::sftp::SftpSessions;

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionRecord>>,
    detach_ttl: Duration,
    sftp_sessions: SftpSessions,
}

impl SessionRegistry {
    pub fn new(detach_ttl: Duration, sftp_sessions: SftpSessions) -> Self {
        Self {
            sessions: DashMap::new(),
            detach_ttl,
            sftp_sessions,
        }
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<SessionRecord>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the existing record if `id` is known (reconnection), or
    /// creates and inserts a fresh one.
    pub fn open(&self, id: Option<String>) -> Arc<SessionRecord> {
        if let Some(ref id) = id
            && let Some(existing) = self.lookup(id)
        {
            return existing;
        }
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let record = Arc::new(SessionRecord::new(id.clone()));
        self.sessions.insert(id, Arc::clone(&record));
        record
    }

    /// Rebinds `channel` to the session, clearing any pending detach TTL.
    /// Returns `None` if the session does not exist.
    pub async fn rebind(
        &self,
        id: &str,
        channel: Sender<Message>,
    ) -> Option<Arc<SessionRecord>> {
        let record = self.lookup(id)?;
        *record.client_channel.write().await = Some(channel);
        let mut state = record.state.write().await;
        if *state == SessionState::Detached {
            *state = SessionState::Ready;
        }
        drop(state);
        record.touch();
        Some(record)
    }

    /// Detaches the client channel from a session, leaving SSH/SFTP state
    /// alive until `detach_ttl` elapses.
    pub async fn detach(&self, id: &str) {
        if let Some(record) = self.lookup(id) {
            *record.client_channel.write().await = None;
            *record.state.write().await = SessionState::Detached;
            info!("session {id} detached, ttl {:?}", self.detach_ttl);
        }
    }

    /// Idempotent teardown: drains SSH writes, closes the shell and SSH
    /// connection, deletes any SFTP session record (spec: the SFTP Session
    /// Record is destroyed by `sftp_close` or session teardown), and
    /// deletes the record. Safe to call from any failure site and more
    /// than once.
    pub async fn destroy(&self, id: &str, reason: &str) {
        let Some((_, record)) = self.sessions.remove(id) else {
            return;
        };
        self.sftp_sessions.remove(id);
        {
            let mut state = record.state.write().await;
            if *state == SessionState::Gone {
                return;
            }
            *state = SessionState::Tearing;
        }
        if let Some(stop) = record.shutdown.write().await.take() {
            let _ = stop.send(());
        }
        *record.ssh_command.write().await = None;
        *record.client_channel.write().await = None;
        *record.state.write().await = SessionState::Gone;
        info!("session {id} destroyed: {reason}");
    }

    /// Sweeps detached sessions whose TTL has elapsed, per the invariant
    /// that a session with no client channel is destroyed no later than
    /// `detach_ttl + 1min` after detach.
    pub async fn sweep_expired_detached(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let ttl_ms = self.detach_ttl.as_millis() as i64;
        let expired: Vec<String> = {
            let mut expired = Vec::new();
            for entry in self.sessions.iter() {
                let record = entry.value();
                if *record.state.read().await == SessionState::Detached
                    && now - record.last_activity_ms() > ttl_ms
                {
                    expired.push(entry.key().clone());
                }
            }
            expired
        };
        for id in expired {
            self.destroy(&id, "detach ttl expired").await;
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Background sweeper task; intended to be spawned once at startup.
pub async fn run_sweeper(registry: Arc<SessionRegistry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        registry.sweep_expired_detached().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_then_reattaches_by_id() {
        let registry = SessionRegistry::new(Duration::from_secs(600), crate::sftp::new_sftp_sessions());
        let first = registry.open(Some("s1".to_string()));
        let second = registry.open(Some("s1".to_string()));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let registry = SessionRegistry::new(Duration::from_secs(600), crate::sftp::new_sftp_sessions());
        registry.open(Some("s1".to_string()));
        registry.destroy("s1", "test").await;
        registry.destroy("s1", "test again").await;
        assert!(registry.lookup("s1").is_none());
    }

    #[tokio::test]
    async fn detach_then_sweep_destroys_after_ttl() {
        let registry = SessionRegistry::new(Duration::from_millis(10), crate::sftp::new_sftp_sessions());
        let record = registry.open(Some("s1".to_string()));
        registry.detach("s1").await;
        record.last_activity.store(0, Ordering::SeqCst);
        registry.sweep_expired_detached().await;
        assert!(registry.lookup("s1").is_none());
    }
}
