pub mod ops;
pub mod recursive_delete;
pub mod transfer;

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use russh_sftp::client::SftpSession;
use tokio::sync::RwLock;

/// SFTP Session Record (C8): keyed by `sessionId`, created by `sftp_init`,
/// destroyed by `sftp_close` or session teardown.
pub struct SftpSessionRecord {
    pub sftp: SftpSession,
    pub current_path: RwLock<String>,
    pub created_at: SystemTime,
}

pub type SftpSessions = Arc<DashMap<String, Arc<SftpSessionRecord>>>;

/// Operation Record (C8/C9): per long-running call, keyed by the
/// client-supplied `operationId`; tracks cancellation and bytes transferred.
pub struct OperationRecord {
    pub cancelled: AtomicBool,
    pub bytes_transferred: AtomicU64,
}

impl OperationRecord {
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            bytes_transferred: AtomicU64::new(0),
        }
    }
}

impl Default for OperationRecord {
    fn default() -> Self {
        Self::new()
    }
}

pub type OperationTable = Arc<DashMap<String, Arc<OperationRecord>>>;

pub fn new_sftp_sessions() -> SftpSessions {
    Arc::new(DashMap::new())
}

pub fn new_operation_table() -> OperationTable {
    Arc::new(DashMap::new())
}
