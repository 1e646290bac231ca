//! Recursive Delete Engine (C9): a shell `rm -rf` fast path behind a
//! conservative path safety gate, falling through to an SFTP recursive walk.

use futures_util::future::join_all;
use log::{info, warn};
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;

use crate::error::GatewayError;
use crate::ssh::connector::SshHandle;

const DANGER_SET: &[&str] = &[
    "/", "/root", "/home", "/etc", "/usr", "/var", "/bin", "/sbin", "/lib", "/lib64", "/opt",
    "/srv", "/proc", "/sys", "/dev", "/boot", "/run", "/mnt", "/media", "/snap",
];

/// Collapses `//` and strips a trailing `/` (except for the root itself).
pub fn canonicalize_path(path: &str) -> String {
    let collapsed: String = {
        let mut out = String::with_capacity(path.len());
        let mut prev_slash = false;
        for ch in path.chars() {
            if ch == '/' {
                if prev_slash {
                    continue;
                }
                prev_slash = true;
            } else {
                prev_slash = false;
            }
            out.push(ch);
        }
        out
    };
    if collapsed.len() > 1 && collapsed.ends_with('/') {
        collapsed.trim_end_matches('/').to_string()
    } else {
        collapsed
    }
}

fn depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

/// The safety gate: path must be absolute, canonicalized, depth >= 2, not in
/// the hardcoded danger set, and free of `..`, newline, carriage return, tab.
pub fn is_safe_for_shell_delete(raw_path: &str) -> bool {
    if !raw_path.starts_with('/') {
        return false;
    }
    if raw_path.contains("..") || raw_path.contains('\n') || raw_path.contains('\r') || raw_path.contains('\t')
    {
        return false;
    }
    let canonical = canonicalize_path(raw_path);
    if depth(&canonical) < 2 {
        return false;
    }
    !DANGER_SET.contains(&canonical.as_str())
}

/// Tier 1: `/bin/rm -rf -- <path>` executed over an SSH exec channel. The
/// safety gate is re-checked here too — the caller asserting safety is not
/// trusted.
pub async fn shell_fast_delete(handle: &SshHandle, path: &str) -> Result<bool, GatewayError> {
    if !is_safe_for_shell_delete(path) {
        warn!("refusing shell fast-delete for unsafe path: {path}");
        return Ok(false);
    }

    let canonical = canonicalize_path(path);
    let command = format!("/bin/rm -rf -- {}", shell_words::quote(&canonical));

    let mut channel = handle.channel_open_session().await?;
    channel.exec(true, command.as_bytes()).await?;

    let mut exit_status = None;
    while let Some(msg) = channel.wait().await {
        if let russh::ChannelMsg::ExitStatus { exit_status: status } = msg {
            exit_status = Some(status);
        }
    }

    Ok(exit_status == Some(0))
}

/// Tier 2: SFTP recursive walk. `NOT_FOUND` on any node is tolerated
/// (concurrent deletion); the first other failing child error is reported
/// with its path attached.
pub fn recursive_sftp_delete<'a>(
    sftp: &'a SftpSession,
    path: &'a str,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), GatewayError>> + Send + 'a>> {
    Box::pin(async move {
        let metadata = match sftp.metadata(path).await {
            Ok(m) => m,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(GatewayError::from(err)),
        };

        if !metadata.is_dir() {
            return match sftp.remove_file(path).await {
                Ok(()) => Ok(()),
                Err(err) if is_not_found(&err) => Ok(()),
                Err(err) => Err(GatewayError::from(err)),
            };
        }

        let entries = match sftp.read_dir(path).await {
            Ok(entries) => entries,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(GatewayError::from(err)),
        };

        let children: Vec<String> = entries
            .into_iter()
            .map(|entry| entry.file_name())
            .filter(|name| name != "." && name != "..")
            .map(|name| format!("{}/{}", path.trim_end_matches('/'), name))
            .collect();

        let results = join_all(
            children
                .iter()
                .map(|child| recursive_sftp_delete(sftp, child)),
        )
        .await;

        for result in results {
            result?;
        }

        match sftp.remove_dir(path).await {
            Ok(()) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(GatewayError::from(err)),
        }
    })
}

fn is_not_found(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile)
}

/// Tries the shell fast path when the gate allows it; falls through to the
/// SFTP recursive walk otherwise or on failure.
pub async fn delete(
    ssh: &SshHandle,
    sftp: &SftpSession,
    path: &str,
) -> Result<(), GatewayError> {
    if is_safe_for_shell_delete(path)
        && let Ok(true) = shell_fast_delete(ssh, path).await
    {
        info!("recursive delete of {path} completed via shell fast path");
        return Ok(());
    }
    recursive_sftp_delete(sftp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn danger_set_paths_are_rejected() {
        for path in ["/", "/root", "/etc", "/home"] {
            assert!(!is_safe_for_shell_delete(path), "{path} should be unsafe");
        }
    }

    #[test]
    fn shallow_paths_are_rejected() {
        assert!(!is_safe_for_shell_delete("/tmp"));
    }

    #[test]
    fn traversal_and_control_chars_are_rejected() {
        assert!(!is_safe_for_shell_delete("/home/u/../etc"));
        assert!(!is_safe_for_shell_delete("/home/u/tmp\nrm -rf /"));
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(!is_safe_for_shell_delete("home/u/tmp"));
    }

    #[test]
    fn safe_deep_path_is_allowed() {
        assert!(is_safe_for_shell_delete("/home/u/tmp"));
    }

    #[test]
    fn canonicalize_collapses_slashes_and_trailing_slash() {
        assert_eq!(canonicalize_path("/home//u/tmp/"), "/home/u/tmp");
        assert_eq!(canonicalize_path("/"), "/");
    }
}
