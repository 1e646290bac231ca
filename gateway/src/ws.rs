//! The `/ssh` WebSocket upgrade handler: wires the framing/validator layer
//! (C1/C2) to the session registry, auth handshake, SSH connector, shell
//! pump, and SFTP subsystem. One task reads and dispatches; long-running
//! SFTP operations and the connect dial run as independent tasks that post
//! back through the single-writer client channel.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum_client_ip::ClientIp;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use serde_json::json;
use tokio::sync::mpsc::{self, Sender};
use tokio_util::sync::CancellationToken;

use crate::crypto::CryptoError;
use crate::error::{code, redact_sensitive, ErrorEnvelope, GatewayError};
use crate::keepalive::{ChannelHeartbeat, HEARTBEAT_INTERVAL, PONG_TIMEOUT};
use crate::protocol::frame::{BinaryFrame, TextFrame, TAG_PONG};
use crate::protocol::messages::*;
use crate::protocol::validator::{self, ValidationError};
use crate::session::record::SessionState;
use crate::sftp::recursive_delete;
use crate::sftp::{transfer, OperationRecord, SftpSessionRecord};
use crate::ssh::connector::{self, SshConfig, SshCredentials};
use crate::ssh::session::SshCommand;
use crate::ssh::shell;
use crate::state::AppState;

pub async fn ws_ssh_handler(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ip = gateway_common::ip::extract_ip_from_headers(&headers).unwrap_or(ip);
    ws.max_message_size(state.env.ws_max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, ip))
}

async fn handle_socket(socket: WebSocket, state: AppState, ip: IpAddr) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(256);
    let heartbeat = Arc::new(ChannelHeartbeat::new());
    let shutdown = CancellationToken::new();

    let writer_task = tokio::spawn(run_writer(ws_tx, rx, state.clone()));
    let heartbeat_task = tokio::spawn(run_heartbeat(
        tx.clone(),
        Arc::clone(&heartbeat),
        shutdown.clone(),
    ));

    let owned = dispatch_loop(&mut ws_rx, &state, &tx, &heartbeat, ip, &shutdown).await;

    shutdown.cancel();
    drop(tx);
    let _ = writer_task.await;
    heartbeat_task.abort();

    for session_id in owned {
        state.sessions.detach(&session_id).await;
        debug!("ws connection closed, session {session_id} detached");
    }
}

/// Drains the client channel onto the socket. `total_bytes` is the session's
/// outbound-buffer accounting (C6 backpressure): a host-data frame is only
/// released once it's actually flushed here, not merely handed to this
/// channel, so a slow client throttles the SSH read side instead of
/// deadlocking it.
async fn run_writer(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Message>, state: AppState) {
    while let Some(msg) = rx.recv().await {
        let drain = host_data_drain(&msg);
        if let Err(err) = ws_tx.send(msg).await {
            warn!("failed to send to client channel: {err}");
            break;
        }
        if let Some((session_id, len)) = drain
            && let Some(session) = state.sessions.lookup(&session_id)
        {
            session.backpressure.total_bytes.fetch_sub(len, Ordering::SeqCst);
        }
    }
}

/// If `msg` is a `TAG_HOST_DATA` binary frame, returns the session it belongs
/// to and the encoded byte length `deliver_chunk` accounted against that
/// session's backpressure counter.
fn host_data_drain(msg: &Message) -> Option<(String, u64)> {
    let Message::Binary(data) = msg else { return None };
    let frame = BinaryFrame::decode(data).ok()?;
    if frame.tag != crate::protocol::frame::TAG_HOST_DATA {
        return None;
    }
    Some((frame.session_id, data.len() as u64))
}

/// Sends native WS pings every 15s; a pong not observed within 45s cancels
/// `shutdown`, which unwinds the connection.
async fn run_heartbeat(tx: Sender<Message>, heartbeat: Arc<ChannelHeartbeat>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => return,
        }

        heartbeat.mark_ping_sent();
        if tx.send(Message::Ping(Bytes::new())).await.is_err() {
            return;
        }

        let deadline = Instant::now() + PONG_TIMEOUT;
        loop {
            if heartbeat.is_alive.load(Ordering::SeqCst) {
                break;
            }
            if Instant::now() >= deadline {
                warn!("client channel missed pong within 45s, terminating");
                shutdown.cancel();
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }
}

/// Reads and dispatches client frames until the socket closes or `shutdown`
/// fires; returns the set of session ids this connection owned, for detach.
async fn dispatch_loop(
    ws_rx: &mut SplitStream<WebSocket>,
    state: &AppState,
    tx: &Sender<Message>,
    heartbeat: &Arc<ChannelHeartbeat>,
    ip: IpAddr,
    shutdown: &CancellationToken,
) -> HashSet<String> {
    let mut owned: HashSet<String> = HashSet::new();

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            _ = shutdown.cancelled() => break,
        };
        let Some(msg) = msg else { break };
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!("client channel read error: {err}");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                dispatch_text(&text, state, tx, &mut owned, ip).await;
            }
            Message::Binary(data) => {
                dispatch_binary(&data, state).await;
            }
            Message::Pong(_) => heartbeat.record_pong(),
            Message::Ping(_) => {}
            Message::Close(_) => break,
        }
    }

    owned
}

async fn send_text(tx: &Sender<Message>, kind: &str, data: serde_json::Value) {
    let frame = TextFrame::new(kind, data);
    if let Ok(encoded) = crate::protocol::frame::encode_text(&frame) {
        let _ = tx.send(Message::Text(encoded.into())).await;
    }
}

async fn send_error(tx: &Sender<Message>, code: i32, message: impl Into<String>) {
    let envelope = ErrorEnvelope::new(code, message);
    send_text(tx, "error", serde_json::to_value(envelope).expect("ErrorEnvelope always serializes")).await;
}

async fn dispatch_text(
    raw: &str,
    state: &AppState,
    tx: &Sender<Message>,
    owned: &mut HashSet<String>,
    ip: IpAddr,
) {
    let frame = match crate::protocol::frame::decode_text(raw) {
        Ok(frame) => frame,
        Err(err) => {
            send_error(tx, code::VALIDATION_ENVELOPE, err.to_string()).await;
            return;
        }
    };

    let message = match validator::validate(&frame, state.env.max_upload_size) {
        Ok(message) => message,
        Err(ValidationError { code, message, field }) => {
            warn!("validation failed: {message} (field: {field:?})");
            send_error(tx, code, message).await;
            return;
        }
    };

    match message {
        ClientMessage::Connect(data) => handle_connect(data, state, tx, owned, ip).await,
        ClientMessage::Authenticate(data) => handle_authenticate(data, state, tx, owned, ip).await,
        ClientMessage::Data(data) => handle_data(data, state).await,
        ClientMessage::Resize(data) => handle_resize(data, state).await,
        ClientMessage::Disconnect(data) => {
            state.sessions.destroy(&data.session_id, "client disconnect").await;
            owned.remove(&data.session_id);
        }
        ClientMessage::Ping(data) => handle_ping(data, state, tx, ip).await,
        ClientMessage::SshExec(data) => handle_ssh_exec(data, state, tx),
        ClientMessage::SftpInit(data) => handle_sftp_init(data, state, tx).await,
        ClientMessage::SftpList(data) => handle_sftp_list(data, state, tx),
        ClientMessage::SftpUpload(data) => handle_sftp_upload(data, state, tx),
        ClientMessage::SftpDownload(data) => handle_sftp_download(data, state, tx),
        ClientMessage::SftpDownloadFolder(data) => handle_sftp_download_folder(data, state, tx),
        ClientMessage::SftpMkdir(data) => handle_sftp_mkdir(data, state, tx),
        ClientMessage::SftpDelete(data) => handle_sftp_delete(data, state, tx),
        ClientMessage::SftpFastDelete(data) => handle_sftp_fast_delete(data, state, tx),
        ClientMessage::SftpChmod(data) => handle_sftp_chmod(data, state, tx),
        ClientMessage::SftpRename(data) => handle_sftp_rename(data, state, tx),
        ClientMessage::SftpStat(data) => handle_sftp_stat(data, state, tx),
        ClientMessage::SftpClose(data) => handle_sftp_close(data, state, tx).await,
    }
}

async fn dispatch_binary(data: &[u8], state: &AppState) {
    let frame = match BinaryFrame::decode(data) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("malformed binary frame: {err}");
            return;
        }
    };

    let Some(session) = state.sessions.lookup(&frame.session_id) else {
        debug!("binary frame for unknown session {}", frame.session_id);
        return;
    };

    match frame.tag {
        crate::protocol::frame::TAG_CLIENT_INPUT => {
            if let Some(sender) = session.ssh_command.read().await.clone() {
                let _ = sender.send(SshCommand::Data(frame.payload.to_vec())).await;
                state.metrics.record_client_to_host(frame.payload.len() as u64);
            }
            session.touch();
        }
        crate::protocol::frame::TAG_RESIZE => {
            if let Some((cols, rows)) = BinaryFrame::decode_resize(&frame.payload) {
                if let Some(sender) = session.ssh_command.read().await.clone() {
                    let _ = sender.send(SshCommand::Resize { cols, rows }).await;
                }
            }
        }
        other => debug!("unhandled binary tag {other:#x}"),
    }
}

async fn handle_data(data: DataFrameData, state: &AppState) {
    let Some(session) = state.sessions.lookup(&data.session_id) else {
        return;
    };
    if let Some(sender) = session.ssh_command.read().await.clone() {
        let _ = sender.send(SshCommand::Data(data.data.into_bytes())).await;
    }
    session.touch();
}

async fn handle_resize(data: ResizeData, state: &AppState) {
    let Some(session) = state.sessions.lookup(&data.session_id) else {
        return;
    };
    if let Some(sender) = session.ssh_command.read().await.clone() {
        let _ = sender
            .send(SshCommand::Resize {
                cols: data.cols,
                rows: data.rows,
            })
            .await;
    }
}

async fn handle_connect(
    data: ConnectData,
    state: &AppState,
    tx: &Sender<Message>,
    owned: &mut HashSet<String>,
    ip: IpAddr,
) {
    if let Some(connection_id) = data.connection_id.clone() {
        let status = state.pending.register(connection_id.clone(), data.session_id.clone());
        send_text(
            tx,
            "connection_id_registered",
            json!({"connectionId": connection_id, "status": status}),
        )
        .await;
        return;
    }

    // A `connect` naming a known sessionId is a reconnect: rebind the existing
    // session's client channel rather than dialing SSH again and spawning a
    // second shell pump alongside the still-running one.
    if let Some(session_id) = data.session_id.clone()
        && state.sessions.lookup(&session_id).is_some()
    {
        handle_reconnect(session_id, state, tx, owned, ip).await;
        return;
    }

    let (address, username) = match (data.address, data.username) {
        (Some(address), Some(username)) => (address, username),
        _ => {
            send_error(tx, code::VALIDATION_FIELD, "address and username are required").await;
            return;
        }
    };

    debug!(
        "connect attempt: address={address} username={username} authType={} password={} privateKey={}",
        data.auth_type,
        redact_opt("password", data.password.as_deref()),
        redact_opt("privateKey", data.private_key.as_deref()),
    );

    let credentials = match credentials_from(&data.auth_type, data.password, data.private_key, data.passphrase) {
        Ok(credentials) => credentials,
        Err(message) => {
            send_error(tx, code::VALIDATION_FIELD, message).await;
            return;
        }
    };

    open_session(
        data.session_id,
        SshConfig {
            host: address,
            port: data.port,
            username,
            credentials,
        },
        state,
        tx,
        owned,
        ip,
    )
    .await;
}

/// Rebinds an existing session's client channel to this connection. Used for
/// a `connect` frame carrying a known `sessionId` and no `connectionId`.
async fn handle_reconnect(
    session_id: String,
    state: &AppState,
    tx: &Sender<Message>,
    owned: &mut HashSet<String>,
    ip: IpAddr,
) {
    match state.sessions.rebind(&session_id, tx.clone()).await {
        Some(session) => {
            *session.client_ip.write().await = Some(ip);
            owned.insert(session.id.clone());
            send_text(tx, "connected", json!({"sessionId": session.id})).await;
        }
        None => {
            send_error(tx, code::VALIDATION_FIELD, "session not found").await;
        }
    }
}

async fn handle_authenticate(
    data: AuthenticateData,
    state: &AppState,
    tx: &Sender<Message>,
    owned: &mut HashSet<String>,
    ip: IpAddr,
) {
    let Some(pending) = state.pending.take(&data.connection_id) else {
        send_error(tx, code::AUTH_INVALID_CONNECTION_ID, "invalid or expired connection id").await;
        return;
    };

    let plaintext = match state.keys.decrypt(&data.key_id, &data.encrypted_payload) {
        Ok(plaintext) => plaintext,
        Err(CryptoError::UnknownKeyId) => {
            send_error(tx, code::AUTH_DECRYPT_FAILED, "unknown keyId").await;
            return;
        }
        Err(_) => {
            send_error(tx, code::AUTH_DECRYPT_FAILED, "cannot decrypt auth payload").await;
            return;
        }
    };

    let payload: DecryptedAuthPayload = match serde_json::from_slice(&plaintext) {
        Ok(payload) => payload,
        Err(err) => {
            send_error(tx, code::AUTH_DECRYPT_FAILED, format!("malformed auth payload: {err}")).await;
            return;
        }
    };

    debug!(
        "authenticate attempt: address={} username={} authType={} password={} privateKey={}",
        payload.address,
        payload.username,
        payload.auth_type,
        redact_opt("password", payload.password.as_deref()),
        redact_opt("privateKey", payload.private_key.as_deref()),
    );

    let credentials = match credentials_from(&payload.auth_type, payload.password, payload.private_key, payload.passphrase) {
        Ok(credentials) => credentials,
        Err(message) => {
            send_error(tx, code::AUTH_MISSING_FIELD, message).await;
            return;
        }
    };

    open_session(
        pending.session_id,
        SshConfig {
            host: payload.address,
            port: payload.port,
            username: payload.username,
            credentials,
        },
        state,
        tx,
        owned,
        ip,
    )
    .await;
}

/// `"none"` for an absent field, otherwise `redact_sensitive`'s truncated form.
fn redact_opt(field_name: &str, value: Option<&str>) -> String {
    value.map(|v| redact_sensitive(field_name, v)).unwrap_or_else(|| "none".to_string())
}

fn credentials_from(
    auth_type: &str,
    password: Option<String>,
    private_key: Option<String>,
    passphrase: Option<String>,
) -> Result<SshCredentials, &'static str> {
    match auth_type {
        "password" => password.map(SshCredentials::Password).ok_or("password is required"),
        "privateKey" | "private_key" | "publickey" | "public_key" => private_key
            .map(|key_pem| SshCredentials::PrivateKey { key_pem, passphrase })
            .ok_or("privateKey is required"),
        other => Err(match other {
            "" => "authType is required",
            _ => "unsupported authType",
        }),
    }
}

/// Dials SSH, registers the session, opens the shell pump, and replies
/// `connected`. Shared by both the legacy and secure auth handshakes.
async fn open_session(
    session_id: Option<String>,
    config: SshConfig,
    state: &AppState,
    tx: &Sender<Message>,
    owned: &mut HashSet<String>,
    ip: IpAddr,
) {
    let session = state.sessions.open(session_id);
    owned.insert(session.id.clone());
    *session.client_channel.write().await = Some(tx.clone());
    *session.client_ip.write().await = Some(ip);
    *session.state.write().await = SessionState::Connected;

    let host = config.host.clone();
    let port = config.port;
    let username = config.username.clone();

    let handle = match connector::connect(config).await {
        Ok(handle) => handle,
        Err(err) => {
            let is_final = state.errors.record(&session.id, "ssh_connect", err.kind());
            warn!("session {} ssh connect failed: {err}", session.id);
            send_error(tx, err.code(), err.to_string()).await;
            if is_final {
                state.sessions.destroy(&session.id, "connect retries exhausted").await;
                owned.remove(&session.id);
            }
            return;
        }
    };

    *session.connection_info.write().await = Some(crate::session::record::ConnectionInfo {
        host,
        port,
        username,
        connection_id: None,
    });
    *session.ssh_handle.write().await = Some(handle.clone());
    *session.state.write().await = SessionState::Ready;
    state.metrics.record_session_created();

    let (cmd_tx, cmd_rx) = mpsc::channel::<SshCommand>(256);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
    *session.ssh_command.write().await = Some(cmd_tx);
    *session.shutdown.write().await = Some(stop_tx);

    let pump_session = Arc::clone(&session);
    let pump_id = session.id.clone();
    tokio::spawn(async move {
        shell::pump(pump_session, pump_id, handle, cmd_rx, stop_rx).await;
    });

    send_text(tx, "connected", json!({"sessionId": session.id})).await;
}

async fn handle_ping(data: PingData, state: &AppState, tx: &Sender<Message>, ip: IpAddr) {
    let session_id = data.session_id.clone().unwrap_or_default();
    let pong = BinaryFrame::new(TAG_PONG, session_id.clone(), Bytes::new());
    let _ = tx.send(Message::Binary(pong.encode().into())).await;

    if !data.measure_latency {
        return;
    }

    let (host, port) = match state.sessions.lookup(&session_id) {
        Some(session) => match session.connection_info.read().await.as_ref() {
            Some(info) => (info.host.clone(), info.port),
            None => (state.env.ssh_host.clone(), state.env.ssh_port),
        },
        None => (state.env.ssh_host.clone(), state.env.ssh_port),
    };

    let tx = tx.clone();
    tokio::spawn(async move {
        let latency = crate::keepalive::measure_composite(Some(ip), &host, port).await;
        send_text(
            &tx,
            "network_latency",
            json!({
                "clientLatency": latency.client_latency_ms,
                "serverLatency": latency.server_latency_ms,
                "totalLatency": latency.total_latency_ms,
            }),
        )
        .await;
    });
}

fn handle_ssh_exec(data: SshExecData, state: &AppState, tx: &Sender<Message>) {
    let Some(session) = state.sessions.lookup(&data.session_id) else {
        return;
    };
    let tx = tx.clone();
    let session_id = data.session_id.clone();
    tokio::spawn(async move {
        let Some(handle) = session.ssh_handle.read().await.clone() else {
            send_error(&tx, code::CONNECTION_UNKNOWN, "session has no active ssh connection").await;
            return;
        };
        if let Err(err) = run_exec(handle, &session_id, &data.command, &tx).await {
            warn!("ssh_exec[{session_id}] failed: {err}");
            send_error(&tx, err.code(), err.to_string()).await;
        }
    });
}

async fn run_exec(
    handle: connector::SshHandle,
    session_id: &str,
    command: &str,
    tx: &Sender<Message>,
) -> Result<(), GatewayError> {
    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command.as_bytes()).await?;

    while let Some(msg) = channel.wait().await {
        match msg {
            russh::ChannelMsg::Data { ref data } => {
                let frame = BinaryFrame::new(
                    crate::protocol::frame::TAG_HOST_DATA,
                    session_id,
                    Bytes::copy_from_slice(data),
                );
                let _ = tx.send(Message::Binary(frame.encode().into())).await;
            }
            russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
            russh::ChannelMsg::ExitStatus { .. } => break,
            _ => {}
        }
    }
    let _ = channel.close().await;
    Ok(())
}

async fn handle_sftp_init(data: SftpInitData, state: &AppState, tx: &Sender<Message>) {
    let Some(session) = state.sessions.lookup(&data.session_id) else {
        send_error(tx, code::VALIDATION_FIELD, "unknown sessionId").await;
        return;
    };
    let Some(handle) = session.ssh_handle.read().await.clone() else {
        send_error(tx, code::CONNECTION_UNKNOWN, "session has no active ssh connection").await;
        return;
    };

    let channel = match handle.channel_open_session().await {
        Ok(channel) => channel,
        Err(err) => {
            send_error(tx, code::CONNECTION_UNKNOWN, err.to_string()).await;
            return;
        }
    };
    if let Err(err) = channel.request_subsystem(true, "sftp").await {
        send_error(tx, code::CONNECTION_UNKNOWN, err.to_string()).await;
        return;
    }
    let sftp = match russh_sftp::client::SftpSession::new(channel.into_stream()).await {
        Ok(sftp) => sftp,
        Err(err) => {
            send_error(tx, code::SYSTEM_IO, err.to_string()).await;
            return;
        }
    };

    state.sftp_sessions.insert(
        data.session_id.clone(),
        Arc::new(SftpSessionRecord {
            sftp,
            current_path: tokio::sync::RwLock::new("/".to_string()),
            created_at: std::time::SystemTime::now(),
        }),
    );

    send_text(tx, "sftp_ready", json!({"sessionId": data.session_id})).await;
}

async fn handle_sftp_close(data: SftpCloseData, state: &AppState, tx: &Sender<Message>) {
    state.sftp_sessions.remove(&data.session_id);
    complete_operation(tx, &data.operation_id, Ok(())).await;
}

fn handle_sftp_stat(data: SftpStatData, state: &AppState, tx: &Sender<Message>) {
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let tx = tx.clone();
    tokio::spawn(async move {
        match crate::sftp::ops::stat(&sftp_session.sftp, &data.path).await {
            Ok(entry) => {
                send_text(
                    &tx,
                    "sftp_success",
                    json!({"operationId": data.operation_id, "entry": entry}),
                )
                .await;
            }
            Err(err) => complete_operation(&tx, &data.operation_id, Err(err)).await,
        }
    });
}

fn operation_guard(state: &AppState, operation_id: &str) -> Arc<OperationRecord> {
    let record = Arc::new(OperationRecord::new());
    state.operations.insert(operation_id.to_string(), Arc::clone(&record));
    record
}

async fn complete_operation(tx: &Sender<Message>, operation_id: &str, result: Result<(), GatewayError>) {
    match result {
        Ok(()) => {
            send_text(
                tx,
                "sftp_success",
                serde_json::to_value(SftpSuccess {
                    operation_id: operation_id.to_string(),
                })
                .expect("SftpSuccess always serializes"),
            )
            .await;
        }
        Err(err) => {
            send_text(
                tx,
                "sftp_error",
                serde_json::to_value(SftpErrorPayload {
                    operation_id: operation_id.to_string(),
                    message: err.to_string(),
                })
                .expect("SftpErrorPayload always serializes"),
            )
            .await;
        }
    }
}

fn handle_sftp_list(data: SftpListData, state: &AppState, tx: &Sender<Message>) {
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let tx = tx.clone();
    tokio::spawn(async move {
        match crate::sftp::ops::list(&sftp_session.sftp, &data.path).await {
            Ok(entries) => {
                send_text(
                    &tx,
                    "sftp_success",
                    json!({"operationId": data.operation_id, "entries": entries}),
                )
                .await;
            }
            Err(err) => complete_operation(&tx, &data.operation_id, Err(err)).await,
        }
    });
}

fn handle_sftp_mkdir(data: SftpMkdirData, state: &AppState, tx: &Sender<Message>) {
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = crate::sftp::ops::mkdir(&sftp_session.sftp, &data.path).await;
        complete_operation(&tx, &data.operation_id, result).await;
    });
}

fn handle_sftp_rename(data: SftpRenameData, state: &AppState, tx: &Sender<Message>) {
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = crate::sftp::ops::rename(&sftp_session.sftp, &data.old_path, &data.new_path).await;
        complete_operation(&tx, &data.operation_id, result).await;
    });
}

fn handle_sftp_chmod(data: SftpChmodData, state: &AppState, tx: &Sender<Message>) {
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = crate::sftp::ops::chmod(&sftp_session.sftp, &data.path, data.mode).await;
        complete_operation(&tx, &data.operation_id, result).await;
    });
}

fn handle_sftp_upload(data: SftpUploadData, state: &AppState, tx: &Sender<Message>) {
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let operation = operation_guard(state, &data.operation_id);
    let tx = tx.clone();
    let remote_path = format!("{}/{}", data.path.trim_end_matches('/'), data.filename);
    tokio::spawn(async move {
        let result = transfer::upload(
            &sftp_session.sftp,
            &data.operation_id,
            &remote_path,
            &data.content,
            &operation,
            &tx,
        )
        .await;
        complete_operation(&tx, &data.operation_id, result).await;
    });
}

fn handle_sftp_download(data: SftpOpBase, state: &AppState, tx: &Sender<Message>) {
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let operation = operation_guard(state, &data.operation_id);
    let tx = tx.clone();
    tokio::spawn(async move {
        let path = sftp_session.current_path.read().await.clone();
        let decision = match transfer::begin_download(&sftp_session.sftp, &path).await {
            Ok(decision) => decision,
            Err(err) => {
                complete_operation(&tx, &data.operation_id, Err(err)).await;
                return;
            }
        };
        match decision {
            transfer::DownloadDecision::NeedsConfirm(size) => {
                send_text(
                    &tx,
                    "sftp_confirm",
                    serde_json::to_value(SftpConfirm {
                        operation_id: data.operation_id.clone(),
                        size,
                        message: "file exceeds 50MB, confirm to continue".to_string(),
                    })
                    .expect("SftpConfirm always serializes"),
                )
                .await;
            }
            transfer::DownloadDecision::Proceed(size) => {
                let result = transfer::stream_download(
                    &sftp_session.sftp,
                    &path,
                    &data.operation_id,
                    size,
                    &operation,
                    &tx,
                )
                .await;
                complete_operation(&tx, &data.operation_id, result).await;
            }
        }
    });
}

fn handle_sftp_download_folder(data: SftpOpBase, state: &AppState, tx: &Sender<Message>) {
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let operation = operation_guard(state, &data.operation_id);
    let tx = tx.clone();
    tokio::spawn(async move {
        let path = sftp_session.current_path.read().await.clone();
        let result = transfer::download_folder(&sftp_session.sftp, &path, &data.operation_id, &operation, &tx).await;
        complete_operation(&tx, &data.operation_id, result).await;
    });
}

fn handle_sftp_delete(data: SftpPathOpData, state: &AppState, tx: &Sender<Message>) {
    let Some(session) = state.sessions.lookup(&data.session_id) else {
        return;
    };
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = if data.is_directory {
            match session.ssh_handle.read().await.clone() {
                Some(handle) => recursive_delete::delete(&handle, &sftp_session.sftp, &data.path).await,
                None => recursive_delete::recursive_sftp_delete(&sftp_session.sftp, &data.path).await,
            }
        } else {
            sftp_session
                .sftp
                .remove_file(&data.path)
                .await
                .map_err(GatewayError::from)
        };
        complete_operation(&tx, &data.operation_id, result).await;
    });
}

fn handle_sftp_fast_delete(data: SftpMkdirData, state: &AppState, tx: &Sender<Message>) {
    let Some(session) = state.sessions.lookup(&data.session_id) else {
        return;
    };
    let Some(sftp_session) = state.sftp_sessions.get(&data.session_id).map(|e| Arc::clone(e.value())) else {
        return;
    };
    let tx = tx.clone();
    tokio::spawn(async move {
        let result = match session.ssh_handle.read().await.clone() {
            Some(handle) => recursive_delete::delete(&handle, &sftp_session.sftp, &data.path).await,
            None => recursive_delete::recursive_sftp_delete(&sftp_session.sftp, &data.path).await,
        };
        complete_operation(&tx, &data.operation_id, result).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_from_password_requires_password_field() {
        let err = credentials_from("password", None, None, None).unwrap_err();
        assert_eq!(err, "password is required");

        let creds = credentials_from("password", Some("hunter2".into()), None, None).unwrap();
        assert!(matches!(creds, SshCredentials::Password(p) if p == "hunter2"));
    }

    #[test]
    fn credentials_from_accepts_private_key_spellings() {
        for variant in ["privateKey", "private_key", "publickey", "public_key"] {
            let creds = credentials_from(
                variant,
                None,
                Some("-----BEGIN KEY-----".into()),
                Some("pass".into()),
            )
            .unwrap();
            match creds {
                SshCredentials::PrivateKey { key_pem, passphrase } => {
                    assert_eq!(key_pem, "-----BEGIN KEY-----");
                    assert_eq!(passphrase.as_deref(), Some("pass"));
                }
                _ => panic!("expected private key credentials"),
            }
        }

        let err = credentials_from("privateKey", None, None, None).unwrap_err();
        assert_eq!(err, "privateKey is required");
    }

    #[test]
    fn credentials_from_rejects_unknown_auth_type() {
        assert_eq!(
            credentials_from("", None, None, None).unwrap_err(),
            "authType is required"
        );
        assert_eq!(
            credentials_from("kerberos", None, None, None).unwrap_err(),
            "unsupported authType"
        );
    }

    #[test]
    fn redact_opt_truncates_present_sensitive_field_and_passes_through_absent() {
        let redacted = redact_opt("password", Some("hunter2hunter2hunter2hunter2"));
        assert!(redacted.contains("<redacted>"));
        assert_eq!(redact_opt("password", None), "none");
    }

    #[test]
    fn host_data_drain_identifies_host_data_frames_only() {
        let host_frame = BinaryFrame::new(
            crate::protocol::frame::TAG_HOST_DATA,
            "s1",
            Bytes::from_static(b"hello"),
        );
        let encoded = host_frame.encode();
        let len = encoded.len() as u64;
        let msg = Message::Binary(encoded.into());
        assert_eq!(host_data_drain(&msg), Some(("s1".to_string(), len)));

        let resize_frame = BinaryFrame::new(crate::protocol::frame::TAG_RESIZE, "s1", Bytes::new());
        let msg = Message::Binary(resize_frame.encode().into());
        assert_eq!(host_data_drain(&msg), None);

        assert_eq!(host_data_drain(&Message::Text("not binary".into())), None);
    }

    fn test_state() -> AppState {
        // SAFETY for tests only: every `Env` field has an `envconfig` default,
        // so this succeeds with no environment variables set.
        AppState::new(Arc::new(crate::env::init().expect("env defaults are always valid")))
    }

    #[tokio::test]
    async fn connect_with_known_session_id_rebinds_instead_of_redialing() {
        let state = test_state();
        state.sessions.open(Some("s1".to_string()));
        let (tx, mut rx) = mpsc::channel::<Message>(8);
        let mut owned = HashSet::new();

        handle_connect(
            ConnectData {
                session_id: Some("s1".to_string()),
                connection_id: None,
                address: None,
                port: 22,
                username: None,
                auth_type: "password".to_string(),
                password: None,
                private_key: None,
                passphrase: None,
            },
            &state,
            &tx,
            &mut owned,
            "127.0.0.1".parse().unwrap(),
        )
        .await;

        assert!(owned.contains("s1"));
        let session = state.sessions.lookup("s1").unwrap();
        assert!(session.client_channel.read().await.is_some());
        let msg = rx.try_recv().expect("expected a connected envelope");
        assert!(matches!(msg, Message::Text(_)));
    }

    #[tokio::test]
    async fn connect_with_unknown_session_id_and_no_credentials_is_rejected() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel::<Message>(8);
        let mut owned = HashSet::new();

        handle_connect(
            ConnectData {
                session_id: Some("unknown".to_string()),
                connection_id: None,
                address: None,
                port: 22,
                username: None,
                auth_type: "password".to_string(),
                password: None,
                private_key: None,
                passphrase: None,
            },
            &state,
            &tx,
            &mut owned,
            "127.0.0.1".parse().unwrap(),
        )
        .await;

        assert!(owned.is_empty());
        let msg = rx.try_recv().expect("expected an error envelope");
        assert!(matches!(msg, Message::Text(_)));
    }
}
