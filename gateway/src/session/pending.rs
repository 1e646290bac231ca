//! Auth Handshake (C4) support: the pending-connection table bridging the
//! `connect {connectionId}` step to the following `authenticate` step.

use std::time::Duration;

use dashmap::DashMap;
use log::info;

#[derive(Clone)]
pub struct PendingConnection {
    pub timestamp: i64,
    pub session_id: Option<String>,
}

pub struct PendingConnectionTable {
    entries: DashMap<String, PendingConnection>,
    ttl: Duration,
}

impl PendingConnectionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Registers a pending connection, returning `"reconnected"` if this
    /// `connectionId` was already pending (the client retried the first
    /// step) or `"need_auth"` for a fresh registration.
    pub fn register(&self, connection_id: String, session_id: Option<String>) -> &'static str {
        let now = chrono::Utc::now().timestamp_millis();
        let status = if self.entries.contains_key(&connection_id) {
            "reconnected"
        } else {
            "need_auth"
        };
        self.entries.insert(
            connection_id,
            PendingConnection {
                timestamp: now,
                session_id,
            },
        );
        status
    }

    pub fn take(&self, connection_id: &str) -> Option<PendingConnection> {
        self.entries.remove(connection_id).map(|(_, v)| v)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.entries.contains_key(connection_id)
    }

    /// Garbage-collects entries older than `ttl` (30 minutes by the spec's
    /// literal numbers).
    pub fn sweep(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let ttl_ms = self.ttl.as_millis() as i64;
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.timestamp <= ttl_ms);
        let removed = before - self.entries.len();
        if removed > 0 {
            info!("swept {removed} expired pending connections");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Background sweeper, run every 15 minutes per the spec's literal cadence.
pub async fn run_sweeper(table: std::sync::Arc<PendingConnectionTable>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        table.sweep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registration_needs_auth_second_is_reconnected() {
        let table = PendingConnectionTable::new(Duration::from_secs(1800));
        assert_eq!(table.register("c1".to_string(), None), "need_auth");
        assert_eq!(table.register("c1".to_string(), None), "reconnected");
    }

    #[test]
    fn take_removes_the_entry() {
        let table = PendingConnectionTable::new(Duration::from_secs(1800));
        table.register("c1".to_string(), Some("s1".to_string()));
        assert!(table.take("c1").is_some());
        assert!(!table.contains("c1"));
    }

    #[test]
    fn sweep_evicts_entries_past_ttl() {
        let table = PendingConnectionTable::new(Duration::from_millis(0));
        table.register("c1".to_string(), None);
        std::thread::sleep(Duration::from_millis(5));
        table.sweep();
        assert!(table.is_empty());
    }
}
