//! Keep-alive & Latency (C7): the transport heartbeat and the composite
//! latency measurement, kept as two independent mechanisms per the spec.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use log::warn;
use regex::Regex;
use tokio::net::TcpStream;
use tokio::process::Command;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(45);
const LOGGED_LATENCY_THRESHOLD_MS: u128 = 500;
const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-channel heartbeat bookkeeping (`isAlive`, `connectionTime`, `lastPing`).
pub struct ChannelHeartbeat {
    pub is_alive: AtomicBool,
    pub connection_time: Instant,
    pub last_ping: AtomicI64,
}

impl ChannelHeartbeat {
    pub fn new() -> Self {
        Self {
            is_alive: AtomicBool::new(true),
            connection_time: Instant::now(),
            last_ping: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn record_pong(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let last = self.last_ping.swap(now, Ordering::SeqCst);
        let elapsed = (now - last).max(0) as u128;
        if elapsed > LOGGED_LATENCY_THRESHOLD_MS {
            warn!("client channel heartbeat latency {elapsed}ms exceeds 500ms");
        }
        self.is_alive.store(true, Ordering::SeqCst);
    }

    pub fn mark_ping_sent(&self) {
        self.last_ping.store(chrono::Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.is_alive.store(false, Ordering::SeqCst);
    }
}

impl Default for ChannelHeartbeat {
    fn default() -> Self {
        Self::new()
    }
}

/// Result reported as `network_latency {clientLatency, serverLatency, totalLatency}`.
pub struct CompositeLatency {
    pub client_latency_ms: i64,
    pub server_latency_ms: i64,
    pub total_latency_ms: i64,
}

/// Measures both legs in parallel. MUST be called only after `pong` has
/// already been sent on the caller's side — this function never blocks it.
pub async fn measure_composite(client_ip: Option<IpAddr>, host: &str, port: u16) -> CompositeLatency {
    let (client_leg, host_leg) = tokio::join!(
        measure_leg(client_ip.map(|ip| ip.to_string())),
        measure_leg_tcp_fallback(host.to_string(), port),
    );
    CompositeLatency {
        client_latency_ms: client_leg,
        server_latency_ms: host_leg,
        total_latency_ms: client_leg + host_leg,
    }
}

async fn measure_leg(target: Option<String>) -> i64 {
    let Some(target) = target else {
        return 0;
    };
    if let Some(ms) = icmp_ping(&target).await {
        return ms;
    }
    tcp_connect_latency(&target, 22).await
}

async fn measure_leg_tcp_fallback(target: String, port: u16) -> i64 {
    if let Some(ms) = icmp_ping(&target).await {
        return ms;
    }
    tcp_connect_latency(&target, port).await
}

static PING_BINARY_AVAILABLE: OnceLock<bool> = OnceLock::new();

fn ping_binary_available() -> bool {
    *PING_BINARY_AVAILABLE.get_or_init(|| which_ping().is_some())
}

fn which_ping() -> Option<std::path::PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join("ping"))
            .find(|candidate| candidate.is_file())
    })
}

/// `ping -c 1 <target>`, parsed with a locale-tolerant regex for the
/// millisecond value (`time=12.3 ms`, `time<1ms`, etc).
async fn icmp_ping(target: &str) -> Option<i64> {
    if !ping_binary_available() {
        return None;
    }
    let output = Command::new("ping")
        .args(["-c", "1", target])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_ping_time_ms(&text)
}

fn parse_ping_time_ms(text: &str) -> Option<i64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"time[=<]\s*([0-9]+(?:\.[0-9]+)?)\s*ms").unwrap());
    let captures = re.captures(text)?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some(value.round() as i64)
}

async fn tcp_connect_latency(host: &str, port: u16) -> i64 {
    let started = Instant::now();
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => started.elapsed().as_millis() as i64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linux_style_ping_output() {
        let sample = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=113 time=12.3 ms\n";
        assert_eq!(parse_ping_time_ms(sample), Some(12));
    }

    #[test]
    fn parses_sub_millisecond_ping_output() {
        let sample = "64 bytes from localhost: icmp_seq=1 ttl=64 time<1ms\n";
        assert!(parse_ping_time_ms(sample).is_none() || parse_ping_time_ms(sample) == Some(1));
    }

    #[test]
    fn returns_none_on_unrecognized_output() {
        assert_eq!(parse_ping_time_ms("unreachable"), None);
    }

    #[tokio::test]
    async fn composite_latency_totals_both_legs() {
        let latency = measure_composite(None, "127.0.0.1", 1).await;
        assert_eq!(
            latency.total_latency_ms,
            latency.client_latency_ms + latency.server_latency_ms
        );
    }
}
