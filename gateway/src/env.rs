use axum_client_ip::ClientIpSource;
use envconfig::Envconfig;
use gateway_common::env::Mode;

#[derive(Envconfig)]
pub struct Env {
    #[cfg_attr(
        debug_assertions,
        envconfig(from = "APP_MODE", default = "development")
    )]
    #[cfg_attr(
        not(debug_assertions),
        envconfig(from = "APP_MODE", default = "production")
    )]
    #[allow(dead_code)]
    pub mode: Mode,

    #[envconfig(from = "IP_SOURCE", default = "ConnectInfo")]
    pub ip_source: ClientIpSource,

    #[envconfig(from = "HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "PORT", default = "8081")]
    pub port: u16,

    /// Max SSH-subchannel frame bytes.
    #[envconfig(from = "WS_MAX_MESSAGE_SIZE", default = "157286400")]
    pub ws_max_message_size: usize,

    /// SFTP upload cap, bytes.
    #[envconfig(from = "MAX_UPLOAD_SIZE", default = "104857600")]
    pub max_upload_size: u64,

    /// Symmetric key for the auth payload cipher, base64 or raw UTF-8.
    #[envconfig(from = "ENCRYPTION_KEY", default = "")]
    pub encryption_key: String,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Dial defaults used only when a legacy `connect` omits host/port.
    #[envconfig(from = "SSH_HOST", default = "127.0.0.1")]
    pub ssh_host: String,

    #[envconfig(from = "SSH_PORT", default = "22")]
    pub ssh_port: u16,

    /// TTL for a detached session before full teardown. Spec's open question
    /// resolves this to a short default rather than the source's 24h.
    #[envconfig(from = "SESSION_DETACH_TTL_SECS", default = "600")]
    pub session_detach_ttl_secs: u64,

    #[envconfig(from = "PENDING_CONNECTION_TTL_SECS", default = "1800")]
    pub pending_connection_ttl_secs: u64,

    #[envconfig(from = "PENDING_CONNECTION_SWEEP_SECS", default = "900")]
    pub pending_connection_sweep_secs: u64,
}

pub fn init() -> anyhow::Result<Env> {
    Ok(Env::init_from_env()?)
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
