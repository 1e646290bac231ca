use russh::client;
use russh::keys::PublicKey;

/// Minimal `russh` client handler. Host-key checking is intentionally
/// permissive here (the gateway is not a browser and has no TOFU store of
/// its own); operators needing pinning supply it via the SSH host's own
/// `known_hosts` enforcement upstream.
pub struct GatewaySshClient;

impl client::Handler for GatewaySshClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
