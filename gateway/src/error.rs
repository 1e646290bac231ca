use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

/// Numeric error codes carried on the wire, partitioned per the envelope contract:
/// 1000s validation, 2000s auth, 3000s connection, 4000s system.
pub mod code {
    pub const VALIDATION_ENVELOPE: i32 = 1001;
    pub const VALIDATION_CONSTRAINT: i32 = 1003;
    pub const VALIDATION_UNKNOWN_TYPE: i32 = 1004;
    pub const VALIDATION_FIELD: i32 = 1005;

    pub const AUTH_INVALID_CONNECTION_ID: i32 = 2001;
    pub const AUTH_CREDENTIALS_REJECTED: i32 = 2002;
    pub const AUTH_DECRYPT_FAILED: i32 = 2003;
    pub const AUTH_MISSING_FIELD: i32 = 2004;

    pub const CONNECTION_REFUSED: i32 = 3001;
    pub const CONNECTION_TIMEOUT: i32 = 3002;
    pub const CONNECTION_HOST_KEY: i32 = 3003;
    pub const CONNECTION_UNKNOWN: i32 = 3004;

    pub const SYSTEM_IO: i32 = 4001;
    pub const SYSTEM_NOT_FOUND: i32 = 4002;
    pub const SYSTEM_EXISTS: i32 = 4003;
    pub const SYSTEM_INTERNAL: i32 = 4004;
}

/// Internal kind set driving retry/stop decisions, distinct from the wire code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Validation,
    Timeout,
    System,
    Unknown,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("network timeout: {0}")]
    NetworkTimeout(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("host key verification failed: {0}")]
    HostKeyFailed(String),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::Auth(_) => ErrorKind::Validation,
            GatewayError::ConnectionRefused(_)
            | GatewayError::AuthFailed(_)
            | GatewayError::HostKeyFailed(_)
            | GatewayError::Ssh(_) => ErrorKind::Connection,
            GatewayError::NetworkTimeout(_) => ErrorKind::Timeout,
            GatewayError::Sftp(_) | GatewayError::Io(_) => ErrorKind::System,
            GatewayError::Anyhow(_) | GatewayError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            GatewayError::Validation(_) => code::VALIDATION_CONSTRAINT,
            GatewayError::Auth(_) => code::AUTH_DECRYPT_FAILED,
            GatewayError::ConnectionRefused(_) => code::CONNECTION_REFUSED,
            GatewayError::NetworkTimeout(_) => code::CONNECTION_TIMEOUT,
            GatewayError::AuthFailed(_) => code::AUTH_CREDENTIALS_REJECTED,
            GatewayError::HostKeyFailed(_) => code::CONNECTION_HOST_KEY,
            GatewayError::Ssh(_) => code::CONNECTION_UNKNOWN,
            GatewayError::Sftp(_) | GatewayError::Io(_) => code::SYSTEM_IO,
            GatewayError::Anyhow(_) | GatewayError::Unknown(_) => code::SYSTEM_INTERNAL,
        }
    }
}

/// One of `connection_refused | network_timeout | auth_failed | host_key_failed | unknown`,
/// the classified string the client renders (C5/C10).
pub fn classify_connect_error(err: &russh::Error) -> (&'static str, String) {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();
    let label = if lower.contains("refused") {
        "connection_refused"
    } else if lower.contains("timed out") || lower.contains("timeout") {
        "network_timeout"
    } else if lower.contains("auth") {
        "auth_failed"
    } else if lower.contains("key") {
        "host_key_failed"
    } else {
        "unknown"
    };
    (label, message)
}

/// Error envelope payload, per the data model's `{type:"error", data:{...}}` shape.
#[derive(Serialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "errorCode")]
    pub error_code: i32,
    #[serde(rename = "errorMessage")]
    pub error_message: String,
    pub timestamp: i64,
}

impl ErrorEnvelope {
    pub fn new(error_code: i32, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Truncates sensitive wire fields before they reach a log line, per the
/// user-facing rule (`password|secret|key|auth|jwt|token`, 20 chars max).
pub fn redact_sensitive(field_name: &str, value: &str) -> String {
    let lower = field_name.to_ascii_lowercase();
    let sensitive = ["password", "secret", "key", "auth", "jwt", "token"]
        .iter()
        .any(|needle| lower.contains(needle));
    if sensitive {
        let truncated: String = value.chars().take(20).collect();
        format!("{truncated}...<redacted>")
    } else {
        value.to_string()
    }
}

const MAX_RETRIES: u32 = 3;
const COUNTER_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

struct CounterEntry {
    count: AtomicU32,
    last_seen: std::sync::Mutex<Instant>,
}

/// Per-session+component retry counters for connection-kind errors, expiring
/// after 24h of inactivity. Mirrors the registry's `DashMap`-backed sharing.
pub struct ErrorClassifier {
    counters: DashMap<(String, &'static str), CounterEntry>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Records a failure for `(session_id, component)`; returns `true` when the
    /// session should stop retrying (`maxRetries` reached).
    pub fn record(&self, session_id: &str, component: &'static str, kind: ErrorKind) -> bool {
        if kind != ErrorKind::Connection {
            return false;
        }
        let key = (session_id.to_string(), component);
        let entry = self.counters.entry(key).or_insert_with(|| CounterEntry {
            count: AtomicU32::new(0),
            last_seen: std::sync::Mutex::new(Instant::now()),
        });
        *entry.last_seen.lock().unwrap() = Instant::now();
        let count = entry.count.fetch_add(1, Ordering::SeqCst) + 1;
        count >= MAX_RETRIES
    }

    pub fn sweep_expired(&self) {
        self.counters.retain(|_, entry| {
            entry.last_seen.lock().unwrap().elapsed() < COUNTER_EXPIRY
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_signals_stop_after_max_retries() {
        let classifier = ErrorClassifier::new();
        assert!(!classifier.record("s1", "ssh_connect", ErrorKind::Connection));
        assert!(!classifier.record("s1", "ssh_connect", ErrorKind::Connection));
        assert!(classifier.record("s1", "ssh_connect", ErrorKind::Connection));
    }

    #[test]
    fn classifier_ignores_non_connection_kinds() {
        let classifier = ErrorClassifier::new();
        for _ in 0..10 {
            assert!(!classifier.record("s1", "validator", ErrorKind::Validation));
        }
    }

    #[test]
    fn redacts_password_field_but_not_plain_field() {
        assert!(redact_sensitive("password", "hunter2hunter2hunter2").contains("<redacted>"));
        assert_eq!(redact_sensitive("username", "alice"), "alice");
    }
}
