//! Shell I/O Pump (C6): bidirectional bridge between the SSH shell channel
//! and the client channel, with byte-accurate backpressure against the
//! client channel's outbound buffer.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use log::{debug, info, warn};
use russh::ChannelMsg;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::oneshot;

use crate::protocol::frame::{BinaryFrame, TAG_HOST_DATA};
use crate::session::record::SessionRecord;
use crate::ssh::connector::SshHandle;
use crate::ssh::session::SshCommand;

const PAUSE_THRESHOLD: u64 = 4 * 1024 * 1024;
const RESUME_THRESHOLD: u64 = 2 * 1024 * 1024;
const BACKPRESSURE_POLL: Duration = Duration::from_millis(100);
const THROUGHPUT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

pub const PTY_TERM: &str = "xterm-color";

/// Drives one session's shell channel until EOF, close, or shutdown.
/// `session` carries the backpressure counters and the client-channel
/// sender (read fresh on every chunk so a reconnect mid-pump is honored).
pub async fn pump(
    session: Arc<SessionRecord>,
    session_id: String,
    handle: SshHandle,
    mut cmd_rx: Receiver<SshCommand>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut channel = match handle.channel_open_session().await {
        Ok(c) => c,
        Err(err) => {
            warn!("ssh[{session_id}] failed to open channel: {err}");
            return;
        }
    };

    if let Err(err) = channel
        .request_pty(true, PTY_TERM, 80, 24, 0, 0, &[])
        .await
    {
        warn!("ssh[{session_id}] pty request failed: {err}");
        return;
    }
    if let Err(err) = channel.request_shell(true).await {
        warn!("ssh[{session_id}] shell request failed: {err}");
        return;
    }

    info!("ssh[{session_id}] shell ready");

    let mut bytes_since_sample: u64 = 0;
    let mut sample_interval = tokio::time::interval(THROUGHPUT_SAMPLE_INTERVAL);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                info!("ssh[{session_id}] shutdown signal received");
                break;
            }
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    SshCommand::Data(buf) => {
                        if let Err(err) = channel.data(std::io::Cursor::new(buf)).await {
                            warn!("ssh[{session_id}] write to shell failed: {err}");
                            break;
                        }
                    }
                    SshCommand::Resize { cols, rows } => {
                        if let Err(err) = channel.window_change(cols, rows, 0, 0).await {
                            warn!("ssh[{session_id}] resize failed: {err}");
                        }
                    }
                }
            }
            _ = sample_interval.tick() => {
                debug!("ssh[{session_id}] throughput sample: {bytes_since_sample} bytes/30s");
                bytes_since_sample = 0;
            }
            msg = channel.wait() => {
                let Some(msg) = msg else {
                    info!("ssh[{session_id}] channel closed");
                    break;
                };
                match msg {
                    ChannelMsg::Data { ref data } => {
                        bytes_since_sample += data.len() as u64;
                        deliver_chunk(&session, &session_id, data).await;
                        wait_for_drain(&session, &session_id).await;
                    }
                    ChannelMsg::Eof => {
                        debug!("ssh[{session_id}] received EOF");
                        break;
                    }
                    ChannelMsg::ExitStatus { exit_status } => {
                        info!("ssh[{session_id}] exited with status {exit_status}");
                        let _ = channel.eof().await;
                        break;
                    }
                    ChannelMsg::Close => {
                        debug!("ssh[{session_id}] close received");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = channel.close().await;
    info!("ssh[{session_id}] shell pump exited");
}

/// Frames and hands a host->client chunk to the writer task, accounting its
/// size against the backpressure counter. Dropped silently if the channel
/// isn't currently attached (session is detached; reconnect will resync).
async fn deliver_chunk(session: &SessionRecord, session_id: &str, data: &[u8]) {
    let sender: Option<Sender<Message>> = session.client_channel.read().await.clone();
    let Some(sender) = sender else {
        debug!("ssh[{session_id}] no attached client channel, dropping chunk");
        return;
    };

    let frame = BinaryFrame::new(TAG_HOST_DATA, session_id, Bytes::copy_from_slice(data));
    let encoded = frame.encode();
    let len = encoded.len() as u64;

    session
        .backpressure
        .total_bytes
        .fetch_add(len, Ordering::SeqCst);

    if sender.send(Message::Binary(encoded.into())).await.is_err() {
        debug!("ssh[{session_id}] client channel closed, chunk dropped");
        session
            .backpressure
            .total_bytes
            .fetch_sub(len, Ordering::SeqCst);
    }

    session.touch();
}

/// Pauses consumption from the SSH channel while the client channel's
/// outbound buffer stays above the high-water mark, polling every 100ms.
async fn wait_for_drain(session: &SessionRecord, session_id: &str) {
    let buffered = session.backpressure.total_bytes.load(Ordering::SeqCst);
    if buffered <= PAUSE_THRESHOLD {
        return;
    }

    session.backpressure.paused.store(true, Ordering::SeqCst);
    session
        .backpressure
        .pause_count
        .fetch_add(1, Ordering::SeqCst);
    debug!("ssh[{session_id}] backpressure: pausing at {buffered} buffered bytes");

    loop {
        tokio::time::sleep(BACKPRESSURE_POLL).await;
        let buffered = session.backpressure.total_bytes.load(Ordering::SeqCst);
        if buffered < RESUME_THRESHOLD {
            break;
        }
    }

    session.backpressure.paused.store(false, Ordering::SeqCst);
    session
        .backpressure
        .resume_count
        .fetch_add(1, Ordering::SeqCst);
    debug!("ssh[{session_id}] backpressure: resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn wait_for_drain_is_a_noop_below_threshold() {
        let session = SessionRecord::new("s1".to_string());
        session.backpressure.total_bytes.store(1024, Ordering::SeqCst);
        wait_for_drain(&session, "s1").await;
        assert_eq!(session.backpressure.pause_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wait_for_drain_pauses_then_resumes() {
        let session = Arc::new(SessionRecord::new("s1".to_string()));
        session
            .backpressure
            .total_bytes
            .store(PAUSE_THRESHOLD + 1, Ordering::SeqCst);

        let draining = Arc::clone(&session);
        let drain_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            draining
                .backpressure
                .total_bytes
                .store(RESUME_THRESHOLD - 1, Ordering::SeqCst);
        });

        wait_for_drain(&session, "s1").await;
        drain_task.await.unwrap();

        assert_eq!(session.backpressure.pause_count.load(Ordering::SeqCst), 1);
        assert_eq!(session.backpressure.resume_count.load(Ordering::SeqCst), 1);
    }
}
