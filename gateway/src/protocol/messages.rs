//! Message Validator (C2) wire types: one struct per `data` payload, the
//! shape the sanitized envelope is deserialized into after validation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectData {
    pub session_id: Option<String>,
    pub connection_id: Option<String>,
    pub address: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_auth_type() -> String {
    "password".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateData {
    pub connection_id: String,
    pub encrypted_payload: String,
    pub key_id: String,
}

/// Decrypted secure-handshake payload, per the auth handshake contract (C4).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedAuthPayload {
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFrameData {
    pub session_id: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeData {
    pub session_id: String,
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectData {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingData {
    pub session_id: Option<String>,
    #[serde(default)]
    pub web_socket_latency: i64,
    #[serde(default)]
    pub measure_latency: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshExecData {
    pub session_id: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpInitData {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpOpBase {
    pub session_id: String,
    pub operation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpListData {
    pub session_id: String,
    pub operation_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpUploadData {
    pub session_id: String,
    pub operation_id: String,
    pub filename: String,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpPathOpData {
    pub session_id: String,
    pub operation_id: String,
    pub path: String,
    #[serde(default)]
    pub is_directory: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpMkdirData {
    pub session_id: String,
    pub operation_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpChmodData {
    pub session_id: String,
    pub operation_id: String,
    pub path: String,
    pub mode: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpRenameData {
    pub session_id: String,
    pub operation_id: String,
    pub old_path: String,
    pub new_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpCloseData {
    pub session_id: String,
    pub operation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpStatData {
    pub session_id: String,
    pub operation_id: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub enum ClientMessage {
    Connect(ConnectData),
    Authenticate(AuthenticateData),
    Data(DataFrameData),
    Resize(ResizeData),
    Disconnect(DisconnectData),
    Ping(PingData),
    SshExec(SshExecData),
    SftpInit(SftpInitData),
    SftpList(SftpListData),
    SftpUpload(SftpUploadData),
    SftpDownload(SftpOpBase),
    SftpDownloadFolder(SftpOpBase),
    SftpMkdir(SftpMkdirData),
    SftpDelete(SftpPathOpData),
    SftpFastDelete(SftpMkdirData),
    SftpChmod(SftpChmodData),
    SftpRename(SftpRenameData),
    SftpStat(SftpStatData),
    SftpClose(SftpCloseData),
}

/// SFTP directory entry, per `list`'s `{name, isDirectory, size, modifiedTime, permissions}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: u64,
    pub modified_time: i64,
    pub permissions: u32,
}

/// `sftp_progress` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpProgress {
    pub operation_id: String,
    pub progress: u32,
    pub processed: u64,
    pub total: u64,
}

/// `sftp_progress` payload for folder archive transfers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderProgress {
    pub operation_id: String,
    pub bytes_transferred: u64,
    pub estimated_size: u64,
    pub phase: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpSuccess {
    pub operation_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpErrorPayload {
    pub operation_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpConfirm {
    pub operation_id: String,
    pub size: u64,
    pub message: String,
}

pub const CONFIRM_DOWNLOAD_THRESHOLD: u64 = 50 * 1024 * 1024;
pub const SFTP_CHUNK_SIZE: usize = 64 * 1024;

/// Binary payload carried by a `0x02` chunk during an SFTP file download.
pub struct SftpFileChunk {
    pub operation_id: String,
    pub data: Bytes,
}
