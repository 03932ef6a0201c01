use std::path::Path;

use async_trait::async_trait;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncWriteExt;

use crate::transfer::{FileTransfer, TransferError};

/// SFTP session opened on its own channel of a [`super::RusshSession`].
pub struct RusshTransfer {
    sftp: SftpSession,
}

impl RusshTransfer {
    pub(super) fn new(sftp: SftpSession) -> RusshTransfer {
        RusshTransfer { sftp }
    }
}

#[async_trait]
impl FileTransfer for RusshTransfer {
    async fn is_dir(&self, remote_path: &str) -> Result<bool, TransferError> {
        // a failed stat means "cannot enter", same as a failed chdir
        match self.sftp.metadata(remote_path).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(_) => Ok(false),
        }
    }

    async fn create_dir(&self, remote_path: &str) -> Result<(), TransferError> {
        self.sftp
            .create_dir(remote_path)
            .await
            .map_err(|err| TransferError::remote(remote_path, err))
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), TransferError> {
        let local_error = |source| TransferError::Local {
            path: local_path.to_path_buf(),
            source,
        };
        let mut local = tokio::fs::File::open(local_path).await.map_err(local_error)?;
        let mut remote = self
            .sftp
            .create(remote_path)
            .await
            .map_err(|err| TransferError::remote(remote_path, err))?;

        tokio::io::copy(&mut local, &mut remote)
            .await
            .map_err(|err| TransferError::remote(remote_path, err))?;
        remote
            .shutdown()
            .await
            .map_err(|err| TransferError::remote(remote_path, err))
    }

    async fn read_dir(&self, remote_dir: &str) -> Result<Vec<String>, TransferError> {
        let entries = self
            .sftp
            .read_dir(remote_dir)
            .await
            .map_err(|err| TransferError::remote(remote_dir, err))?;
        Ok(entries.map(|entry| entry.file_name()).collect())
    }
}
