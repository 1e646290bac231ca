//! Message Validator (C2): declarative per-type schema checks, sanitization,
//! and the numeric-coded error envelope on failure.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::error::code;
use crate::protocol::frame::TextFrame;
use crate::protocol::messages::*;

static SESSION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap());

const MAX_COMMAND_LEN: usize = 4096;

/// Base64 expands raw bytes by 4/3; this converts the configured
/// `MAX_UPLOAD_SIZE` (raw bytes) into the matching cap on the wire's
/// base64 `content` field length.
fn max_upload_content_len(max_upload_size: u64) -> usize {
    ((max_upload_size.saturating_add(2) / 3) * 4) as usize
}

/// A validation failure: code, message, and the first offending field path.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: i32,
    pub message: String,
    pub field: Option<String>,
}

impl ValidationError {
    fn new(code: i32, message: impl Into<String>, field: Option<&str>) -> Self {
        Self {
            code,
            message: message.into(),
            field: field.map(String::from),
        }
    }
}

fn validate_session_id(id: &str, field: &str) -> Result<(), ValidationError> {
    if !SESSION_ID_RE.is_match(id) {
        return Err(ValidationError::new(
            code::VALIDATION_FIELD,
            "session id must match ^[A-Za-z0-9_-]{1,128}$",
            Some(field),
        ));
    }
    Ok(())
}

fn validate_port(port: u16, field: &str) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::new(
            code::VALIDATION_CONSTRAINT,
            "port must be between 1 and 65535",
            Some(field),
        ));
    }
    Ok(())
}

/// Validates the base envelope, then dispatches to the per-type schema and
/// returns the parsed, sanitized message. Unknown properties are dropped by
/// virtue of `serde`'s field-by-field extraction; defaults (`port=22`,
/// `authType="password"`) are applied on the typed struct.
pub fn validate(frame: &TextFrame, max_upload_size: u64) -> Result<ClientMessage, ValidationError> {
    if !frame.data.is_object() {
        return Err(ValidationError::new(
            code::VALIDATION_ENVELOPE,
            "data must be a JSON object",
            Some("data"),
        ));
    }

    match frame.kind.as_str() {
        "connect" => validate_connect(&frame.data).map(ClientMessage::Connect),
        "authenticate" => validate_authenticate(&frame.data).map(ClientMessage::Authenticate),
        "data" => parse::<DataFrameData>(&frame.data).map(ClientMessage::Data),
        "resize" => validate_resize(&frame.data).map(ClientMessage::Resize),
        "disconnect" => parse::<DisconnectData>(&frame.data).map(ClientMessage::Disconnect),
        "ping" => parse::<PingData>(&frame.data).map(ClientMessage::Ping),
        "ssh_exec" => validate_ssh_exec(&frame.data).map(ClientMessage::SshExec),
        "sftp_init" => parse::<SftpInitData>(&frame.data).map(ClientMessage::SftpInit),
        "sftp_list" => parse::<SftpListData>(&frame.data).map(ClientMessage::SftpList),
        "sftp_upload" => validate_upload(&frame.data, max_upload_size).map(ClientMessage::SftpUpload),
        "sftp_download" => parse::<SftpOpBase>(&frame.data).map(ClientMessage::SftpDownload),
        "sftp_download_folder" => {
            parse::<SftpOpBase>(&frame.data).map(ClientMessage::SftpDownloadFolder)
        }
        "sftp_mkdir" => parse::<SftpMkdirData>(&frame.data).map(ClientMessage::SftpMkdir),
        "sftp_delete" => parse::<SftpPathOpData>(&frame.data).map(ClientMessage::SftpDelete),
        "sftp_fast_delete" => {
            parse::<SftpMkdirData>(&frame.data).map(ClientMessage::SftpFastDelete)
        }
        "sftp_chmod" => parse::<SftpChmodData>(&frame.data).map(ClientMessage::SftpChmod),
        "sftp_rename" => parse::<SftpRenameData>(&frame.data).map(ClientMessage::SftpRename),
        "sftp_stat" => parse::<SftpStatData>(&frame.data).map(ClientMessage::SftpStat),
        "sftp_close" => parse::<SftpCloseData>(&frame.data).map(ClientMessage::SftpClose),
        other => Err(ValidationError::new(
            code::VALIDATION_UNKNOWN_TYPE,
            format!("unsupported message type: {other}"),
            Some("type"),
        )),
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T, ValidationError> {
    serde_json::from_value(data.clone()).map_err(|err| {
        ValidationError::new(code::VALIDATION_ENVELOPE, err.to_string(), None)
    })
}

/// Whether `address`/`username` are required for a `connect` frame cannot be
/// decided here: a frame carrying only a known `sessionId` is a reconnect
/// (spec.md §4.3's reconnection contract, scenario 3) and must be accepted
/// without them. That decision depends on session-registry state the
/// validator doesn't have, so `handle_connect` enforces it once it knows
/// whether `sessionId` names a live session.
fn validate_connect(data: &Value) -> Result<ConnectData, ValidationError> {
    let connect: ConnectData = parse(data)?;
    if let Some(ref session_id) = connect.session_id {
        validate_session_id(session_id, "data.sessionId")?;
    }
    validate_port(connect.port, "data.port")?;
    Ok(connect)
}

fn validate_authenticate(data: &Value) -> Result<AuthenticateData, ValidationError> {
    let auth: AuthenticateData = parse(data)?;
    if auth.connection_id.trim().is_empty() {
        return Err(ValidationError::new(
            code::VALIDATION_FIELD,
            "connectionId is required",
            Some("data.connectionId"),
        ));
    }
    if auth.encrypted_payload.trim().is_empty() {
        return Err(ValidationError::new(
            code::VALIDATION_FIELD,
            "encryptedPayload is required",
            Some("data.encryptedPayload"),
        ));
    }
    Ok(auth)
}

fn validate_resize(data: &Value) -> Result<ResizeData, ValidationError> {
    let resize: ResizeData = parse(data)?;
    validate_session_id(&resize.session_id, "data.sessionId")?;
    Ok(resize)
}

fn validate_ssh_exec(data: &Value) -> Result<SshExecData, ValidationError> {
    let exec: SshExecData = parse(data)?;
    validate_session_id(&exec.session_id, "data.sessionId")?;
    if exec.command.len() > MAX_COMMAND_LEN {
        return Err(ValidationError::new(
            code::VALIDATION_CONSTRAINT,
            format!("command exceeds {MAX_COMMAND_LEN} bytes"),
            Some("data.command"),
        ));
    }
    Ok(exec)
}

fn validate_upload(data: &Value, max_upload_size: u64) -> Result<SftpUploadData, ValidationError> {
    let upload: SftpUploadData = parse(data)?;
    validate_session_id(&upload.session_id, "data.sessionId")?;
    if upload.content.len() > max_upload_content_len(max_upload_size) {
        return Err(ValidationError::new(
            code::VALIDATION_CONSTRAINT,
            format!("upload content exceeds {max_upload_size} byte cap"),
            Some("data.content"),
        ));
    }
    Ok(upload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TEST_MAX_UPLOAD: u64 = 100 * 1024 * 1024;

    fn frame(kind: &str, data: Value) -> TextFrame {
        TextFrame::new(kind, data)
    }

    fn validate(frame: &TextFrame) -> Result<ClientMessage, ValidationError> {
        super::validate(frame, TEST_MAX_UPLOAD)
    }

    #[test]
    fn unknown_type_is_rejected_with_1004() {
        let err = validate(&frame("frobnicate", json!({}))).unwrap_err();
        assert_eq!(err.code, code::VALIDATION_UNKNOWN_TYPE);
    }

    #[test]
    fn connect_with_only_session_id_passes_validation_for_handler_to_resolve() {
        // Whether this is a reconnect (sessionId known) or an incomplete
        // fresh connect is a registry-state question, not a schema one; the
        // validator just needs to not reject it outright.
        let msg = validate(&frame(
            "connect",
            json!({"sessionId": "s1", "port": 22}),
        ))
        .unwrap();
        assert!(matches!(msg, ClientMessage::Connect(_)));
    }

    #[test]
    fn connect_applies_default_port_and_auth_type() {
        let msg = validate(&frame(
            "connect",
            json!({"address": "10.0.0.2", "username": "u", "password": "p"}),
        ))
        .unwrap();
        match msg {
            ClientMessage::Connect(c) => {
                assert_eq!(c.port, 22);
                assert_eq!(c.auth_type, "password");
            }
            _ => panic!("expected Connect"),
        }
    }

    #[test]
    fn secure_connect_defers_address_requirement() {
        let msg = validate(&frame(
            "connect",
            json!({"sessionId": "s2", "connectionId": "c2"}),
        ))
        .unwrap();
        assert!(matches!(msg, ClientMessage::Connect(_)));
    }

    #[test]
    fn invalid_session_id_is_rejected() {
        let err = validate(&frame(
            "resize",
            json!({"sessionId": "bad id!", "cols": 80, "rows": 24}),
        ))
        .unwrap_err();
        assert_eq!(err.code, code::VALIDATION_FIELD);
    }

    #[test]
    fn validator_is_idempotent_on_already_sanitized_input() {
        let data = json!({"address": "10.0.0.2", "username": "u", "password": "p", "port": 22, "authType": "password"});
        let first = validate(&frame("connect", data.clone())).unwrap();
        let second = validate(&frame("connect", data)).unwrap();
        match (first, second) {
            (ClientMessage::Connect(a), ClientMessage::Connect(b)) => {
                assert_eq!(a.port, b.port);
                assert_eq!(a.auth_type, b.auth_type);
            }
            _ => panic!("expected Connect"),
        }
    }

    #[test]
    fn upload_content_over_configured_cap_is_rejected() {
        let oversized = "A".repeat(max_upload_content_len(TEST_MAX_UPLOAD) + 1);
        let err = validate(&frame(
            "sftp_upload",
            json!({"sessionId": "s1", "operationId": "o1", "path": "/tmp", "filename": "f", "content": oversized}),
        ))
        .unwrap_err();
        assert_eq!(err.code, code::VALIDATION_CONSTRAINT);
    }

    #[test]
    fn upload_content_within_a_smaller_configured_cap_is_accepted() {
        let content = "A".repeat(max_upload_content_len(1024));
        let msg = super::validate(
            &frame(
                "sftp_upload",
                json!({"sessionId": "s1", "operationId": "o1", "path": "/tmp", "filename": "f", "content": content}),
            ),
            1024,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::SftpUpload(_)));
    }

    #[test]
    fn sftp_stat_parses_into_its_own_variant() {
        let msg = validate(&frame(
            "sftp_stat",
            json!({"sessionId": "s1", "operationId": "o1", "path": "/tmp"}),
        ))
        .unwrap();
        assert!(matches!(msg, ClientMessage::SftpStat(_)));
    }
}
