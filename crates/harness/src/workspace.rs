//! Project directories for scenarios: an existing tree or a scaffolded temp dir

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ScenarioError;
use crate::spec::{ProjectSource, ScaffoldCommand};

/// A project directory acquired for one scenario run
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    temp: Option<TempDir>,
    keep: bool,
}

impl Workspace {
    /// Use an existing directory; it is never removed.
    pub fn existing(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(ScenarioError::Workspace(format!(
                "project directory {} does not exist",
                path.display()
            )));
        }
        Ok(Self {
            root: path.to_path_buf(),
            temp: None,
            keep: true,
        })
    }

    /// Run a scaffold command in a fresh temp dir.
    pub async fn scaffold(command: &ScaffoldCommand) -> Result<Self, ScenarioError> {
        let temp = tempfile::Builder::new()
            .prefix("formprobe-")
            .tempdir()
            .map_err(|e| ScenarioError::Workspace(format!("cannot create temp dir: {}", e)))?;

        info!(program = %command.program, dir = %temp.path().display(), "scaffolding project");
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(temp.path())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let run = cmd.output();

        let timeout = Duration::from_millis(command.timeout_ms);
        let output = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ScenarioError::Workspace(format!(
                    "failed to run scaffold command {}: {}",
                    command.program, e
                )))
            }
            Err(_) => {
                return Err(ScenarioError::Workspace(format!(
                    "scaffold command {} did not finish within {}ms",
                    command.program, command.timeout_ms
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScenarioError::Workspace(format!(
                "scaffold command {} failed ({}): {}",
                command.program,
                output.status,
                stderr.trim()
            )));
        }

        let root = match &command.subdir {
            Some(subdir) => temp.path().join(subdir),
            None => temp.path().to_path_buf(),
        };
        if !root.is_dir() {
            return Err(ScenarioError::Workspace(format!(
                "scaffold command did not create {}",
                root.display()
            )));
        }

        Ok(Self {
            root,
            temp: Some(temp),
            keep: command.keep_workspace,
        })
    }

    /// Acquire the project described by `source`. Relative directories are
    /// resolved against `base_dir`.
    pub async fn acquire(source: &ProjectSource, base_dir: &Path) -> Result<Self, ScenarioError> {
        match source {
            ProjectSource::Directory(dir) => Self::existing(base_dir.join(dir)),
            ProjectSource::Scaffold(command) => Self::scaffold(command).await,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Remove a scaffolded temp dir unless it is to be kept.
    ///
    /// Returns the path that was left on disk, if any.
    pub fn cleanup(self) -> std::io::Result<Option<PathBuf>> {
        match self.temp {
            None => Ok(None),
            Some(temp) if self.keep => {
                let kept = temp.into_path();
                info!("keeping scaffolded project at {}", kept.display());
                Ok(Some(kept))
            }
            Some(temp) => {
                let path = temp.path().to_path_buf();
                temp.close().map_err(|e| {
                    warn!("failed to remove {}: {}", path.display(), e);
                    e
                })?;
                debug!("removed {}", path.display());
                Ok(None)
            }
        }
    }
}
