//! Session Registry (C3) data model: the per-session record and its state
//! machine, mirroring the source's `Created -> Connected -> Ready -> Tearing
//! -> Gone`, with a `Detached` side-branch for reconnection.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::Sender;
use tokio::sync::{oneshot, RwLock};

use crate::ssh::connector::SshHandle;
use crate::ssh::session::SshCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connected,
    Ready,
    Tearing,
    Detached,
    Gone,
}

/// `{host, port, username, connectionId?}`, immutable after first connect.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub connection_id: Option<String>,
}

/// `{paused, totalBytes, pauseCount, resumeCount}` for the shell pump (C6).
#[derive(Default)]
pub struct Backpressure {
    pub paused: AtomicBool,
    pub total_bytes: AtomicU64,
    pub pause_count: AtomicU32,
    pub resume_count: AtomicU32,
}

/// `{clientLegMs, hostLegMs, method, measuredAt}` from the last composite
/// latency measurement (C7).
pub struct LatencyRecord {
    pub client_leg_ms: i64,
    pub host_leg_ms: i64,
    pub method: &'static str,
    pub measured_at: i64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One entry in the session registry. `sshConn`/`shellStream` are
/// represented by the `ssh_command` sender into the shell-pump task, which
/// is the record's sole mutator for the live SSH side.
pub struct SessionRecord {
    pub id: String,
    pub state: RwLock<SessionState>,
    pub connection_info: RwLock<Option<ConnectionInfo>>,
    pub client_ip: RwLock<Option<std::net::IpAddr>>,
    pub created_at: i64,
    pub last_activity: AtomicI64,
    /// None while detached or before connect; set once the shell is Ready.
    pub ssh_command: RwLock<Option<Sender<SshCommand>>>,
    /// The raw SSH handle, shared across the shell pump, `ssh_exec`, and the
    /// SFTP subsystem — `russh` multiplexes independent channels over it.
    pub ssh_handle: RwLock<Option<SshHandle>>,
    /// Fires to tear down the SSH side; consumed once.
    pub shutdown: RwLock<Option<oneshot::Sender<()>>>,
    /// The writer task's sender for this session's client channel; `None`
    /// while detached.
    pub client_channel: RwLock<Option<Sender<axum::extract::ws::Message>>>,
    pub backpressure: Backpressure,
    pub last_latency: RwLock<Option<LatencyRecord>>,
    pub protocol_version: RwLock<Option<String>>,
}

impl SessionRecord {
    pub fn new(id: String) -> Self {
        let now = now_ms();
        Self {
            id,
            state: RwLock::new(SessionState::Created),
            connection_info: RwLock::new(None),
            client_ip: RwLock::new(None),
            created_at: now,
            last_activity: AtomicI64::new(now),
            ssh_command: RwLock::new(None),
            ssh_handle: RwLock::new(None),
            shutdown: RwLock::new(None),
            client_channel: RwLock::new(None),
            backpressure: Backpressure::default(),
            last_latency: RwLock::new(None),
            protocol_version: RwLock::new(None),
        }
    }

    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub async fn is_live(&self) -> bool {
        !matches!(*self.state.read().await, SessionState::Gone)
            && (self.ssh_command.read().await.is_some()
                || self.client_channel.read().await.is_some())
    }
}
