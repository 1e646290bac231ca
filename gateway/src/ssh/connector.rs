//! SSH Connector (C5): dials the backend SSH host with a strongest-first
//! algorithm preference list, a bounded dial window, and server keepalive;
//! classifies failures into the user-facing taxonomy.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::{cipher, kex, mac, Preferred};

use crate::error::{classify_connect_error, GatewayError};
use crate::ssh::client::GatewaySshClient;

const READY_TIMEOUT: Duration = Duration::from_secs(20);
const DIAL_TIMEOUT: Duration = Duration::from_secs(25);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_MAX: usize = 3;

#[derive(Clone, Debug)]
pub enum SshCredentials {
    Password(String),
    PrivateKey {
        key_pem: String,
        passphrase: Option<String>,
    },
}

#[derive(Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credentials: SshCredentials,
}

pub type SshHandle = Arc<Handle<GatewaySshClient>>;

/// Strongest-first, but widened past the teacher's curve25519-only list: the
/// gateway's clients expect `diffie-hellman-group14-sha256`, AES-CTR/AES-GCM
/// ciphers, and SHA-2 HMACs to always be on offer.
fn preferred_algorithms() -> Preferred {
    Preferred {
        kex: Cow::Owned(vec![
            kex::CURVE25519_PRE_RFC_8731,
            kex::EXTENSION_SUPPORT_AS_CLIENT,
            kex::DH_GEX_SHA256,
            kex::DH_G14_SHA256,
        ]),
        cipher: Cow::Owned(vec![
            cipher::AES_256_GCM,
            cipher::AES_256_CTR,
            cipher::AES_128_CTR,
        ]),
        mac: Cow::Owned(vec![mac::HMAC_SHA256, mac::HMAC_SHA512]),
        ..Default::default()
    }
}

/// Dials and authenticates against the SSH host. Wraps the whole attempt in
/// the 25s outer dial timeout (`readyTimeout` of 20s governs the TCP+KEX
/// phase inside `russh`'s own connect).
pub async fn connect(config: SshConfig) -> Result<SshHandle, GatewayError> {
    tokio::time::timeout(DIAL_TIMEOUT, connect_inner(config))
        .await
        .map_err(|_| GatewayError::NetworkTimeout("ssh dial exceeded 25s".to_string()))?
}

async fn connect_inner(config: SshConfig) -> Result<SshHandle, GatewayError> {
    let client_config = Arc::new(client::Config {
        inactivity_timeout: Some(READY_TIMEOUT),
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        preferred: preferred_algorithms(),
        ..<_>::default()
    });

    let mut handle = client::connect(
        client_config,
        (config.host.as_str(), config.port),
        GatewaySshClient,
    )
    .await
    .map_err(map_connect_error)?;

    let auth_result = match config.credentials {
        SshCredentials::Password(password) => {
            handle
                .authenticate_password(config.username.clone(), password)
                .await
        }
        SshCredentials::PrivateKey { key_pem, passphrase } => {
            let key_pair = russh::keys::decode_secret_key(&key_pem, passphrase.as_deref())
                .map_err(|err| GatewayError::AuthFailed(err.to_string()))?;
            handle
                .authenticate_publickey(
                    config.username.clone(),
                    russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), None),
                )
                .await
        }
    }
    .map_err(map_connect_error)?;

    if !auth_result.success() {
        return Err(GatewayError::AuthFailed(
            "ssh authentication failed".to_string(),
        ));
    }

    Ok(Arc::new(handle))
}

fn map_connect_error(err: russh::Error) -> GatewayError {
    let (label, message) = classify_connect_error(&err);
    match label {
        "connection_refused" => GatewayError::ConnectionRefused(message),
        "network_timeout" => GatewayError::NetworkTimeout(message),
        "auth_failed" => GatewayError::AuthFailed(message),
        "host_key_failed" => GatewayError::HostKeyFailed(message),
        _ => GatewayError::Ssh(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_algorithms_include_strongest_first_kex() {
        let prefs = preferred_algorithms();
        assert_eq!(prefs.kex[0], kex::CURVE25519_PRE_RFC_8731);
    }

    #[test]
    fn preferred_algorithms_always_include_group14_sha256_kex() {
        let prefs = preferred_algorithms();
        assert!(prefs.kex.contains(&kex::DH_G14_SHA256));
    }

    #[test]
    fn preferred_algorithms_include_aes_ctr_and_gcm_ciphers() {
        let prefs = preferred_algorithms();
        assert!(prefs.cipher.contains(&cipher::AES_256_GCM));
        assert!(prefs.cipher.contains(&cipher::AES_256_CTR));
    }

    #[test]
    fn preferred_algorithms_include_sha2_hmacs() {
        let prefs = preferred_algorithms();
        assert!(prefs.mac.contains(&mac::HMAC_SHA256));
        assert!(prefs.mac.contains(&mac::HMAC_SHA512));
    }
}
