use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("could not read local path {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("remote operation on {path} failed: {message}")]
    Remote { path: String, message: String },
    #[error("path {0} is not valid UTF-8")]
    InvalidPath(PathBuf),
    #[error("file transfer session failed: {0}")]
    Session(String),
}

impl TransferError {
    pub fn remote(path: impl Into<String>, err: impl ToString) -> Self {
        TransferError::Remote {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// File transfer over an established session. Implementors provide the
/// primitives; uploads and recursive directory creation are built on top.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    async fn is_dir(&self, remote_path: &str) -> Result<bool, TransferError>;

    async fn create_dir(&self, remote_path: &str) -> Result<(), TransferError>;

    /// Copies `local_path` to exactly `remote_path`, replacing any file there.
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<(), TransferError>;

    /// Entry names of `remote_dir` in whatever order the server reports them.
    async fn read_dir(&self, remote_dir: &str) -> Result<Vec<String>, TransferError>;

    /// Copies one file into an existing remote directory, keeping its basename.
    async fn upload_file(&self, local_path: &Path, remote_dir: &str) -> Result<(), TransferError> {
        let name = file_name(local_path)?;
        let remote_path = join_remote(remote_dir, &name);
        debug!("Uploading {} to {}", local_path.display(), remote_path);
        self.put(local_path, &remote_path).await
    }

    /// Creates `remote_dir` and any missing parents.
    async fn mkdir_recursive(&self, remote_dir: &str) -> Result<(), TransferError> {
        let remote_dir = remote_dir.trim_end_matches('/');
        if remote_dir.is_empty() || self.is_dir(remote_dir).await? {
            return Ok(());
        }
        if let Some((parent, _)) = remote_dir.rsplit_once('/') {
            self.mkdir_recursive(parent).await?;
        }
        self.create_dir(remote_dir).await
    }

    /// Mirrors `local_dir` to `remote_parent/<basename of local_dir>`.
    /// The first failing file aborts the upload; nothing is rolled back.
    async fn upload_directory(
        &self,
        local_dir: &Path,
        remote_parent: &str,
    ) -> Result<(), TransferError> {
        let root = join_remote(remote_parent, &file_name(local_dir)?);
        let mut pending = vec![(local_dir.to_path_buf(), root)];

        while let Some((local, remote)) = pending.pop() {
            let (files, dirs) = local_entries(&local).await?;
            for file in files {
                self.mkdir_recursive(&remote).await?;
                self.upload_file(&file, &remote).await?;
            }
            for dir in dirs.into_iter().rev() {
                let remote_child = join_remote(&remote, &file_name(&dir)?);
                pending.push((dir, remote_child));
            }
        }

        Ok(())
    }

    /// Entry names of `remote_dir`, sorted lexicographically.
    async fn list_directory(&self, remote_dir: &str) -> Result<Vec<String>, TransferError> {
        let mut entries: Vec<String> = self
            .read_dir(remote_dir)
            .await?
            .into_iter()
            .filter(|name| name != "." && name != "..")
            .collect();
        entries.sort();
        Ok(entries)
    }
}

pub fn join_remote(remote_dir: &str, name: &str) -> String {
    let trimmed = remote_dir.trim_end_matches('/');
    format!("{}/{}", trimmed, name)
}

fn file_name(path: &Path) -> Result<String, TransferError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| TransferError::InvalidPath(path.to_path_buf()))
}

/// Files and subdirectories of a local directory, each sorted by path.
async fn local_entries(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), TransferError> {
    let local_error = |source| TransferError::Local {
        path: dir.to_path_buf(),
        source,
    };
    let mut read_dir = tokio::fs::read_dir(dir).await.map_err(local_error)?;
    let mut files = Vec::new();
    let mut dirs = Vec::new();

    while let Some(entry) = read_dir.next_entry().await.map_err(local_error)? {
        let path = entry.path();
        // follows symlinks, like a plain directory walk would
        let metadata = tokio::fs::metadata(&path).await.map_err(|source| TransferError::Local {
            path: path.clone(),
            source,
        })?;
        if metadata.is_dir() {
            dirs.push(path);
        } else {
            files.push(path);
        }
    }

    files.sort();
    dirs.sort();
    Ok((files, dirs))
}

#[cfg(test)]
mod tests {
    use super::join_remote;

    #[test]
    fn join_remote_tolerates_trailing_slash() {
        assert_eq!(join_remote("/tmp/robot_proj/", "main.py"), "/tmp/robot_proj/main.py");
        assert_eq!(join_remote("/tmp/robot_proj", "src"), "/tmp/robot_proj/src");
        assert_eq!(join_remote("/", "etc"), "/etc");
    }
}
