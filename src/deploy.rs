use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    executor::{CommandError, RemoteExecutor},
    manifest::{DeployManifest, ManifestError},
    robot::{scripts, STAGING_DIR},
    shell::{quote, RemoteCommand},
    transfer::{FileTransfer, TransferError},
    writable::{ensure_writable_then_restore, query_state},
};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl DeployError {
    fn fatal(message: &str) -> Self {
        DeployError::Fatal(message.to_string())
    }
}

impl From<ManifestError> for DeployError {
    fn from(err: ManifestError) -> Self {
        DeployError::Fatal(err.to_string())
    }
}

/// Receives human readable progress while an operation runs.
pub trait DeployObserver: Send + Sync {
    fn progress(&self, message: &str);

    /// The robot program is about to restart; its old log is stale.
    fn clear_log(&self);
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub command_timeout: Duration,
    /// Local root the manifest's `coreLibFiles` globs are relative to.
    pub core_lib_root: PathBuf,
    pub staging_dir: String,
    /// Pause after clearing the log so the old program's tail output drains.
    pub settle_delay: Duration,
}

impl DeployOptions {
    pub fn new(command_timeout: Duration, core_lib_root: PathBuf) -> DeployOptions {
        DeployOptions {
            command_timeout,
            core_lib_root,
            staging_dir: STAGING_DIR.to_string(),
            settle_delay: Duration::from_millis(100),
        }
    }
}

/// Runs the full deploy sequence against one connection. Steps run strictly
/// in order; the first failure aborts the rest and nothing already applied
/// is rolled back, except that a read-only root is always made read-only
/// again.
pub struct DeploymentOrchestrator<'a, E, F, O>
where
    E: RemoteExecutor + ?Sized,
    F: FileTransfer + ?Sized,
    O: DeployObserver + ?Sized,
{
    executor: &'a E,
    transfer: &'a F,
    observer: &'a O,
    options: &'a DeployOptions,
}

impl<'a, E, F, O> DeploymentOrchestrator<'a, E, F, O>
where
    E: RemoteExecutor + ?Sized,
    F: FileTransfer + ?Sized,
    O: DeployObserver + ?Sized,
{
    pub fn new(
        executor: &'a E,
        transfer: &'a F,
        observer: &'a O,
        options: &'a DeployOptions,
    ) -> Self {
        DeploymentOrchestrator {
            executor,
            transfer,
            observer,
            options,
        }
    }

    pub async fn deploy(&self, project_folder: &Path) -> Result<(), DeployError> {
        info!("Deploying {}", project_folder.display());
        self.observer.progress("Ensuring robot filesystem is writable...");
        let original = query_state(self.executor, self.options.command_timeout).await;

        let timeout = self.options.command_timeout;
        let outcome = ensure_writable_then_restore(self.executor, original, timeout, || {
            self.deploy_steps(project_folder)
        })
        .await;

        match &outcome {
            Ok(()) => info!("Deployment of {} finished", project_folder.display()),
            Err(err) => warn!("Deployment of {} failed: {}", project_folder.display(), err),
        }
        outcome
    }

    async fn deploy_steps(&self, project_folder: &Path) -> Result<(), DeployError> {
        self.observer.progress("Stopping old robot program...");
        self.run_step(scripts::STOP_PROGRAM, "Failed to stop old program.").await?;

        self.observer.clear_log();
        tokio::time::sleep(self.options.settle_delay).await;

        self.observer.progress("Deleting old project...");
        self.run_step(scripts::DELETE_PROGRAM, "Failed to delete old program.").await?;

        self.observer.progress("Uploading new project to robot...");
        let manifest = DeployManifest::load(project_folder).await?;
        let paths = manifest.resolve(project_folder, &self.options.core_lib_root)?;

        let staging = quote(&self.options.staging_dir);
        let reset = format!("rm -rf {0}/;mkdir -p {0}", staging);
        self.run_step(&reset, "Unable to prepare the upload directory on the robot.").await?;
        self.upload_all(&paths).await?;

        self.observer.progress("Updating program on robot...");
        let mut update = RemoteCommand::new(scripts::UPDATE_PROGRAM);
        update.arg(self.options.staging_dir.as_str());
        self.run_step(&update.render(), "Unable to update program on the robot.").await?;

        self.observer.progress("Starting new robot program...");
        self.run_step(scripts::START_PROGRAM, "Failed to start new program on robot.").await?;

        self.observer.progress("Restoring filesystem state...");
        Ok(())
    }

    async fn upload_all(&self, paths: &[PathBuf]) -> Result<(), DeployError> {
        for path in paths {
            let is_dir = tokio::fs::metadata(path)
                .await
                .map_or(false, |metadata| metadata.is_dir());
            let uploaded = if is_dir {
                self.transfer.upload_directory(path, &self.options.staging_dir).await
            } else {
                self.transfer.upload_file(path, &self.options.staging_dir).await
            };
            if let Err(err) = uploaded {
                warn!("Upload of {} failed: {}", path.display(), err);
                return Err(DeployError::fatal("Unable to copy files to the robot."));
            }
        }
        Ok(())
    }

    /// Runs one command; a nonzero exit becomes `Fatal(failure)`.
    async fn run_step(&self, command: &str, failure: &str) -> Result<(), DeployError> {
        let result = self.executor.execute(command, self.options.command_timeout).await?;
        if !result.success() {
            warn!("`{}` exited with {}", command, result.exit_code);
            return Err(DeployError::fatal(failure));
        }
        Ok(())
    }
}

/// Stops and starts the robot program without touching its files.
pub async fn restart_program<E, O>(
    executor: &E,
    observer: &O,
    timeout: Duration,
) -> Result<(), DeployError>
where
    E: RemoteExecutor + ?Sized,
    O: DeployObserver + ?Sized,
{
    observer.progress("Stopping robot program...");
    executor
        .execute(scripts::STOP_PROGRAM, timeout)
        .await
        .map_err(|_| DeployError::fatal("Failed to stop robot program."))?;

    observer.clear_log();
    tokio::time::sleep(Duration::from_millis(100)).await;

    observer.progress("Starting robot program...");
    executor
        .execute(scripts::START_PROGRAM, timeout)
        .await
        .map_err(|_| DeployError::fatal("Failed to start robot program."))?;
    Ok(())
}
