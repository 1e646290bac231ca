//! SFTP Subsystem (C8): chunked upload, chunked download with the large-file
//! confirmation handshake, and tar+gzip directory-archive download.

use std::io;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_compression::tokio::write::GzipEncoder;
use axum::extract::ws::Message;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use log::{debug, warn};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::Sender;

use crate::error::GatewayError;
use crate::protocol::frame::{BinaryFrame, TextFrame, TAG_SFTP_CHUNK};
use crate::protocol::messages::{FolderProgress, SftpProgress, CONFIRM_DOWNLOAD_THRESHOLD, SFTP_CHUNK_SIZE};
use crate::sftp::OperationRecord;

/// Returned by [`begin_download`]: whether the caller may stream immediately
/// or must wait for an `sftp_confirm` round-trip.
pub enum DownloadDecision {
    Proceed(u64),
    NeedsConfirm(u64),
}

async fn send_text(client_channel: &Sender<Message>, kind: &str, data: serde_json::Value) {
    let frame = TextFrame::new(kind, data);
    if let Ok(encoded) = crate::protocol::frame::encode_text(&frame) {
        let _ = client_channel.send(Message::Text(encoded.into())).await;
    }
}

/// Writes `content` (base64-encoded in the request) to `remote_path` in
/// `SFTP_CHUNK_SIZE` pieces, emitting `sftp_progress` after each and honoring
/// cancellation between chunks.
pub async fn upload(
    sftp: &SftpSession,
    operation_id: &str,
    remote_path: &str,
    content_b64: &str,
    operation: &Arc<OperationRecord>,
    client_channel: &Sender<Message>,
) -> Result<(), GatewayError> {
    let content = BASE64
        .decode(content_b64)
        .map_err(|err| GatewayError::Validation(format!("invalid base64 upload content: {err}")))?;
    let total = content.len() as u64;

    let mut file = sftp
        .open_with_flags(
            remote_path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        )
        .await
        .map_err(GatewayError::from)?;

    let mut processed: u64 = 0;
    for chunk in content.chunks(SFTP_CHUNK_SIZE) {
        if operation.cancelled.load(Ordering::SeqCst) {
            debug!("sftp upload {operation_id} cancelled after {processed} bytes");
            return Err(GatewayError::Unknown("operation cancelled".to_string()));
        }

        file.write_all(chunk).await.map_err(|err| GatewayError::Unknown(err.to_string()))?;
        processed += chunk.len() as u64;
        operation.bytes_transferred.store(processed, Ordering::SeqCst);

        let progress = if total == 0 { 100 } else { ((processed * 100) / total) as u32 };
        send_text(
            client_channel,
            "sftp_progress",
            serde_json::to_value(SftpProgress {
                operation_id: operation_id.to_string(),
                progress,
                processed,
                total,
            })
            .expect("SftpProgress always serializes"),
        )
        .await;
    }

    file.shutdown().await.map_err(|err| GatewayError::Unknown(err.to_string()))?;
    Ok(())
}

/// Stats the remote file and decides whether the large-download confirmation
/// round-trip is required. Rejects directories.
pub async fn begin_download(sftp: &SftpSession, remote_path: &str) -> Result<DownloadDecision, GatewayError> {
    let attrs = sftp.metadata(remote_path).await.map_err(GatewayError::from)?;
    if attrs.is_dir() {
        return Err(GatewayError::Validation(format!("{remote_path} is a directory")));
    }
    let size = attrs.size.unwrap_or(0);
    if size > CONFIRM_DOWNLOAD_THRESHOLD {
        Ok(DownloadDecision::NeedsConfirm(size))
    } else {
        Ok(DownloadDecision::Proceed(size))
    }
}

/// Streams the file in `SFTP_CHUNK_SIZE` binary frames tagged
/// [`TAG_SFTP_CHUNK`], the frame's session-id slot carrying `operationId`.
pub async fn stream_download(
    sftp: &SftpSession,
    remote_path: &str,
    operation_id: &str,
    total: u64,
    operation: &Arc<OperationRecord>,
    client_channel: &Sender<Message>,
) -> Result<(), GatewayError> {
    let mut file = sftp.open(remote_path).await.map_err(GatewayError::from)?;
    let mut buf = vec![0u8; SFTP_CHUNK_SIZE];
    let mut processed: u64 = 0;

    loop {
        if operation.cancelled.load(Ordering::SeqCst) {
            debug!("sftp download {operation_id} cancelled after {processed} bytes");
            return Err(GatewayError::Unknown("operation cancelled".to_string()));
        }

        let read = file.read(&mut buf).await.map_err(|err| GatewayError::Unknown(err.to_string()))?;
        if read == 0 {
            break;
        }

        let frame = BinaryFrame::new(TAG_SFTP_CHUNK, operation_id, Bytes::copy_from_slice(&buf[..read]));
        if client_channel.send(Message::Binary(frame.encode().into())).await.is_err() {
            return Err(GatewayError::Unknown("client channel closed mid-download".to_string()));
        }

        processed += read as u64;
        operation.bytes_transferred.store(processed, Ordering::SeqCst);

        let progress = if total == 0 { 100 } else { ((processed * 100) / total) as u32 };
        send_text(
            client_channel,
            "sftp_progress",
            serde_json::to_value(SftpProgress {
                operation_id: operation_id.to_string(),
                progress,
                processed,
                total,
            })
            .expect("SftpProgress always serializes"),
        )
        .await;
    }

    Ok(())
}

/// An [`AsyncWrite`] that frames every flushed buffer as a
/// [`TAG_SFTP_CHUNK`] binary frame and forwards it to the client channel,
/// tracking bytes transferred and honoring cancellation.
struct ChannelWriter {
    operation_id: String,
    client_channel: Sender<Message>,
    operation: Arc<OperationRecord>,
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.operation.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "operation cancelled")));
        }
        let frame = BinaryFrame::new(TAG_SFTP_CHUNK, self.operation_id.clone(), Bytes::copy_from_slice(buf));
        if self
            .client_channel
            .try_send(Message::Binary(frame.encode().into()))
            .is_err()
        {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "client channel closed")));
        }
        self.operation
            .bytes_transferred
            .fetch_add(buf.len() as u64, Ordering::SeqCst);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Walks `remote_path` over SFTP, appending every file into a tar stream
/// wrapped in a gzip encoder, itself wrapped in [`ChannelWriter`].
/// Progress is reported periodically as `sftp_progress` folder frames.
pub async fn download_folder(
    sftp: &SftpSession,
    remote_path: &str,
    operation_id: &str,
    operation: &Arc<OperationRecord>,
    client_channel: &Sender<Message>,
) -> Result<(), GatewayError> {
    let writer = ChannelWriter {
        operation_id: operation_id.to_string(),
        client_channel: client_channel.clone(),
        operation: Arc::clone(operation),
    };
    let gzip = GzipEncoder::new(writer);
    let mut builder = tokio_tar::Builder::new(gzip);

    send_folder_progress(client_channel, operation_id, 0, 0, "scanning").await;
    append_directory(&mut builder, sftp, remote_path, "").await?;

    let mut gzip = builder
        .into_inner()
        .await
        .map_err(|err| GatewayError::Unknown(err.to_string()))?;
    gzip.shutdown().await.map_err(|err| GatewayError::Unknown(err.to_string()))?;

    let transferred = operation.bytes_transferred.load(Ordering::SeqCst);
    send_folder_progress(client_channel, operation_id, transferred, transferred, "complete").await;
    Ok(())
}

fn append_directory<'a, W>(
    builder: &'a mut tokio_tar::Builder<W>,
    sftp: &'a SftpSession,
    remote_path: &'a str,
    archive_prefix: &'a str,
) -> Pin<Box<dyn std::future::Future<Output = Result<(), GatewayError>> + Send + 'a>>
where
    W: AsyncWrite + Unpin + Send,
{
    Box::pin(async move {
        let entries = sftp.read_dir(remote_path).await.map_err(GatewayError::from)?;
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child_remote = format!("{}/{}", remote_path.trim_end_matches('/'), name);
            let child_archive = if archive_prefix.is_empty() {
                name.clone()
            } else {
                format!("{archive_prefix}/{name}")
            };

            if entry.file_type().is_dir() {
                append_directory(builder, sftp, &child_remote, &child_archive).await?;
            } else {
                let mut file = sftp.open(&child_remote).await.map_err(GatewayError::from)?;
                let mut contents = Vec::new();
                file.read_to_end(&mut contents)
                    .await
                    .map_err(|err| GatewayError::Unknown(err.to_string()))?;

                let mut header = tokio_tar::Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(entry.metadata().permissions.unwrap_or(0o644));
                header.set_cksum();

                builder
                    .append_data(&mut header, &child_archive, contents.as_slice())
                    .await
                    .map_err(|err| GatewayError::Unknown(err.to_string()))?;
            }
        }
        Ok(())
    })
}

async fn send_folder_progress(
    client_channel: &Sender<Message>,
    operation_id: &str,
    bytes_transferred: u64,
    estimated_size: u64,
    phase: &'static str,
) {
    send_text(
        client_channel,
        "sftp_progress",
        serde_json::to_value(FolderProgress {
            operation_id: operation_id.to_string(),
            bytes_transferred,
            estimated_size,
            phase,
        })
        .expect("FolderProgress always serializes"),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_decision_picks_confirm_above_threshold() {
        let small = CONFIRM_DOWNLOAD_THRESHOLD - 1;
        let large = CONFIRM_DOWNLOAD_THRESHOLD + 1;
        assert!(matches!(decide_for_size(small), DownloadDecision::Proceed(_)));
        assert!(matches!(decide_for_size(large), DownloadDecision::NeedsConfirm(_)));
    }

    fn decide_for_size(size: u64) -> DownloadDecision {
        if size > CONFIRM_DOWNLOAD_THRESHOLD {
            DownloadDecision::NeedsConfirm(size)
        } else {
            DownloadDecision::Proceed(size)
        }
    }

    #[test]
    fn cancelled_operation_fails_channel_writer() {
        use tokio::sync::mpsc;
        let operation = Arc::new(OperationRecord::new());
        operation.cancelled.store(true, Ordering::SeqCst);
        let (tx, _rx) = mpsc::channel(1);
        let mut writer = ChannelWriter {
            operation_id: "op1".to_string(),
            client_channel: tx,
            operation,
        };
        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());
        let result = Pin::new(&mut writer).poll_write(&mut cx, b"data");
        assert!(matches!(result, Poll::Ready(Err(_))));
    }
}
