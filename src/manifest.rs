use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Name of the project descriptor inside a project folder.
pub const MANIFEST_FILE: &str = "arpirobot-proj.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Unable to open project file.")]
    Unreadable,
    #[error("Invalid project version. Update the deploy tool and try again.")]
    UnsupportedVersion,
    #[error("Project file is invalid. Make sure all required sections exist")]
    MissingSections,
    #[error("Invalid file pattern `{0}` in project file.")]
    BadPattern(String),
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    version: Option<i64>,
    #[serde(rename = "deployFiles")]
    deploy_files: Option<Vec<String>>,
    #[serde(rename = "coreLibFiles")]
    core_lib_files: Option<Vec<String>>,
}

/// Which files of a project get deployed. Read fresh for every deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployManifest {
    pub version: u8,
    /// Globs relative to the project folder.
    pub deploy_files: Vec<String>,
    /// Globs relative to the local support-library root.
    pub core_lib_files: Vec<String>,
}

impl DeployManifest {
    pub fn parse(content: &str) -> Result<DeployManifest, ManifestError> {
        let raw: RawManifest =
            serde_json::from_str(content).map_err(|_| ManifestError::Unreadable)?;
        let version = match raw.version {
            Some(1) => 1,
            Some(2) => 2,
            _ => return Err(ManifestError::UnsupportedVersion),
        };
        match (raw.deploy_files, raw.core_lib_files) {
            (Some(deploy_files), Some(core_lib_files)) => Ok(DeployManifest {
                version,
                deploy_files,
                core_lib_files,
            }),
            _ => Err(ManifestError::MissingSections),
        }
    }

    pub async fn load(project_folder: &Path) -> Result<DeployManifest, ManifestError> {
        let path = project_folder.join(MANIFEST_FILE);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| ManifestError::Unreadable)?;
        Self::parse(&content)
    }

    /// Every local path the manifest selects: project globs first, then
    /// support-library globs, each in pattern order.
    pub fn resolve(
        &self,
        project_folder: &Path,
        core_lib_root: &Path,
    ) -> Result<Vec<PathBuf>, ManifestError> {
        let legacy = self.version == 1;
        let mut paths = Vec::new();
        for expression in &self.deploy_files {
            paths.extend(resolve_glob(expression, project_folder, legacy)?);
        }
        for expression in &self.core_lib_files {
            paths.extend(resolve_glob(expression, core_lib_root, legacy)?);
        }
        debug!("Manifest resolved to {} paths", paths.len());
        Ok(paths)
    }
}

/// Expands `expression` below `base`. Version 1 projects wrote `dir/**` to
/// mean everything under `dir`, which is `dir/**/*` in glob terms. Otherwise
/// a trailing `**` selects directories only, the matched directory included.
pub fn resolve_glob(
    expression: &str,
    base: &Path,
    legacy: bool,
) -> Result<Vec<PathBuf>, ManifestError> {
    if legacy && expression.ends_with("**") {
        return expand(&format!("{}/*", expression), base);
    }

    let prefix = match expression {
        "**" => Some(""),
        _ => expression.strip_suffix("/**"),
    };
    let Some(prefix) = prefix else {
        return expand(expression, base);
    };

    let mut dirs = if prefix.is_empty() {
        vec![base.to_path_buf()]
    } else {
        expand(prefix, base)?
    };
    dirs.retain(|path| path.is_dir());
    for path in expand(expression, base)? {
        if path.is_dir() && !dirs.contains(&path) {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

fn expand(expression: &str, base: &Path) -> Result<Vec<PathBuf>, ManifestError> {
    let escaped = Pattern::escape(&base.to_string_lossy());
    let pattern = format!("{}/{}", escaped.trim_end_matches('/'), expression);
    let entries =
        glob::glob(&pattern).map_err(|_| ManifestError::BadPattern(expression.to_string()))?;

    // unreadable entries are skipped, as a directory walk would
    Ok(entries.filter_map(Result::ok).collect())
}
