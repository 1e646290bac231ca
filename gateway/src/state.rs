use std::sync::Arc;
use std::time::Duration;

use crate::crypto::KeyRing;
use crate::env::Env;
use crate::error::ErrorClassifier;
use crate::metrics::GatewayMetrics;
use crate::session::pending::PendingConnectionTable;
use crate::session::registry::SessionRegistry;
use crate::sftp::{new_operation_table, new_sftp_sessions, OperationTable, SftpSessions};

#[derive(Clone)]
pub struct AppState {
    pub env: Arc<Env>,
    pub sessions: Arc<SessionRegistry>,
    pub pending: Arc<PendingConnectionTable>,
    pub keys: Arc<KeyRing>,
    pub sftp_sessions: SftpSessions,
    pub operations: OperationTable,
    pub errors: Arc<ErrorClassifier>,
    pub metrics: Arc<GatewayMetrics>,
}

impl AppState {
    pub fn new(env: Arc<Env>) -> Self {
        let detach_ttl = Duration::from_secs(env.session_detach_ttl_secs);
        let pending_ttl = Duration::from_secs(env.pending_connection_ttl_secs);
        let keys = KeyRing::with_default_key(&env.encryption_key);
        let sftp_sessions = new_sftp_sessions();
        Self {
            sessions: Arc::new(SessionRegistry::new(detach_ttl, sftp_sessions.clone())),
            pending: Arc::new(PendingConnectionTable::new(pending_ttl)),
            keys: Arc::new(keys),
            sftp_sessions,
            operations: new_operation_table(),
            errors: Arc::new(ErrorClassifier::new()),
            metrics: Arc::new(GatewayMetrics::new()),
            env,
        }
    }
}
