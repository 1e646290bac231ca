//! Ambient metrics: coarse session and throughput counters, logged
//! periodically rather than exported — there is no metrics endpoint in scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::info;

#[derive(Default)]
pub struct GatewayMetrics {
    pub sessions_created: AtomicU64,
    pub sessions_torn_down: AtomicU64,
    pub bytes_host_to_client: AtomicU64,
    pub bytes_client_to_host: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_torn_down(&self) {
        self.sessions_torn_down.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_host_to_client(&self, bytes: u64) {
        self.bytes_host_to_client.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_client_to_host(&self, bytes: u64) {
        self.bytes_client_to_host.fetch_add(bytes, Ordering::Relaxed);
    }

    fn log_line(&self) -> String {
        format!(
            "sessions_created={} sessions_torn_down={} bytes_host_to_client={} bytes_client_to_host={}",
            self.sessions_created.load(Ordering::Relaxed),
            self.sessions_torn_down.load(Ordering::Relaxed),
            self.bytes_host_to_client.load(Ordering::Relaxed),
            self.bytes_client_to_host.load(Ordering::Relaxed),
        )
    }
}

/// Background logger; intended to be spawned once at startup alongside the
/// session and pending-connection sweepers.
pub async fn run_logger(metrics: std::sync::Arc<GatewayMetrics>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        info!("gateway metrics: {}", metrics.log_line());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = GatewayMetrics::new();
        metrics.record_session_created();
        metrics.record_host_to_client(1024);
        metrics.record_host_to_client(512);
        assert_eq!(metrics.sessions_created.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.bytes_host_to_client.load(Ordering::Relaxed), 1536);
    }
}
