//! SFTP Subsystem (C8): the non-transfer operations — list, mkdir, rename,
//! chmod, stat, close.

use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;

use crate::error::GatewayError;
use crate::protocol::messages::SftpEntry;

fn to_millis(time: Option<u32>) -> i64 {
    time.map(|secs| secs as i64 * 1000).unwrap_or(0)
}

/// `readdir`, filtering `.`/`..`, per the `list` operation's semantics.
pub async fn list(sftp: &SftpSession, path: &str) -> Result<Vec<SftpEntry>, GatewayError> {
    let entries = sftp.read_dir(path).await.map_err(GatewayError::from)?;
    let mut result = Vec::new();
    for entry in entries {
        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }
        let metadata = entry.metadata();
        result.push(SftpEntry {
            name,
            is_directory: entry.file_type().is_dir(),
            size: metadata.size.unwrap_or(0),
            modified_time: to_millis(metadata.mtime),
            permissions: metadata.permissions.unwrap_or(0),
        });
    }
    Ok(result)
}

/// Single-level create; surfaces an "already exists" error distinctly.
pub async fn mkdir(sftp: &SftpSession, path: &str) -> Result<(), GatewayError> {
    match sftp.create_dir(path).await {
        Ok(()) => Ok(()),
        Err(russh_sftp::client::error::Error::Status(status))
            if status.status_code == StatusCode::Failure =>
        {
            Err(GatewayError::Unknown(format!("{path} already exists")))
        }
        Err(err) => Err(GatewayError::from(err)),
    }
}

pub async fn rename(sftp: &SftpSession, old_path: &str, new_path: &str) -> Result<(), GatewayError> {
    sftp.rename(old_path, new_path).await.map_err(GatewayError::from)
}

pub async fn chmod(sftp: &SftpSession, path: &str, mode: u32) -> Result<(), GatewayError> {
    let mut attrs = sftp.metadata(path).await.map_err(GatewayError::from)?;
    attrs.permissions = Some(mode);
    sftp.set_metadata(path, attrs).await.map_err(GatewayError::from)
}

pub async fn stat(sftp: &SftpSession, path: &str) -> Result<SftpEntry, GatewayError> {
    let attrs = sftp.metadata(path).await.map_err(GatewayError::from)?;
    let name = path.rsplit('/').next().unwrap_or(path).to_string();
    Ok(SftpEntry {
        name,
        is_directory: attrs.is_dir(),
        size: attrs.size.unwrap_or(0),
        modified_time: to_millis(attrs.mtime),
        permissions: attrs.permissions.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_millis_converts_seconds_and_defaults_to_zero() {
        assert_eq!(to_millis(Some(2)), 2000);
        assert_eq!(to_millis(None), 0);
    }
}
