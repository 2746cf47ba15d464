//! Local artifact builds.
//!
//! Binary deployments cross-compile with `cargo` for the server's
//! architecture and copy the executable into a scratch directory owned by
//! the returned [`BuildOutput`]. Static deployments run the configured shell
//! command and hand back the configured output directory in place.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::project::{ArtifactKind, BinaryBuild, StaticBuild};

/// Future returned by [`Builder::build`].
pub type BuildFuture<'a> = Pin<Box<dyn Future<Output = Result<BuildOutput, BuildError>> + Send + 'a>>;

/// Errors raised while producing an artifact.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Raised when the build tool cannot be started.
    #[error("failed to start {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the build tool exits unsuccessfully.
    #[error("build failed: `{command}` exited with {status}")]
    Failed {
        /// Rendered command line.
        command: String,
        /// Exit status description.
        status: String,
        /// Exit code, when the process was not killed by a signal.
        code: Option<i32>,
    },
    /// Raised when the build succeeded but the artifact is missing.
    #[error("build produced no artifact at {path}")]
    MissingOutput {
        /// Expected artifact location.
        path: Utf8PathBuf,
    },
    /// Raised when staging the artifact fails.
    #[error("failed to stage artifact: {message}")]
    Staging {
        /// Underlying error message.
        message: String,
    },
    /// Raised when the build is cancelled.
    #[error("build cancelled")]
    Cancelled,
}

/// A built artifact. Scratch storage, when present, is removed when the
/// output is dropped.
#[derive(Debug)]
pub struct BuildOutput {
    path: Utf8PathBuf,
    _scratch: Option<TempDir>,
}

impl BuildOutput {
    /// Artifact that lives inside `scratch` and is deleted with it.
    #[must_use]
    pub const fn scoped(path: Utf8PathBuf, scratch: TempDir) -> Self {
        Self {
            path,
            _scratch: Some(scratch),
        }
    }

    /// Artifact owned by the project; never deleted.
    #[must_use]
    pub const fn persistent(path: Utf8PathBuf) -> Self {
        Self {
            path,
            _scratch: None,
        }
    }

    /// Local path of the artifact.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Produces the artifact a deployment ships.
pub trait Builder: Send + Sync {
    /// Builds `artifact`, aborting when `cancel` fires.
    fn build<'a>(
        &'a self,
        artifact: &'a ArtifactKind,
        cancel: &'a CancellationToken,
    ) -> BuildFuture<'a>;
}

/// A fully described local process invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildCommand {
    /// Program to run.
    pub program: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one.
    pub env: Vec<(String, String)>,
    /// Working directory.
    pub dir: Utf8PathBuf,
}

impl fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Builds artifacts from a project checkout on the local machine.
#[derive(Clone, Debug)]
pub struct LocalBuilder {
    root: Utf8PathBuf,
}

impl LocalBuilder {
    /// Creates a builder rooted at the project directory.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The `cargo` invocation for a binary build.
    #[must_use]
    pub fn cargo_command(&self, build: &BinaryBuild) -> BuildCommand {
        let mut env: Vec<(String, String)> = Vec::new();
        if !build.link_flags.is_empty() {
            env.push((String::from("RUSTFLAGS"), build.link_flags.join(" ")));
        }
        env.extend(
            build
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        BuildCommand {
            program: String::from("cargo"),
            args: vec![
                String::from("build"),
                String::from("--release"),
                String::from("--target"),
                build.architecture.rust_target().to_owned(),
                String::from("--bin"),
                build.entry.clone(),
            ],
            env,
            dir: self.root.clone(),
        }
    }

    /// The shell invocation for a static build.
    #[must_use]
    pub fn static_command(&self, build: &StaticBuild) -> BuildCommand {
        BuildCommand {
            program: String::from("sh"),
            args: vec![String::from("-c"), build.command.clone()],
            env: Vec::new(),
            dir: self.root.join(&build.dir),
        }
    }

    #[instrument(skip(self, build, cancel), fields(entry = %build.entry, target = build.architecture.rust_target()))]
    async fn build_binary(
        &self,
        build: &BinaryBuild,
        cancel: &CancellationToken,
    ) -> Result<BuildOutput, BuildError> {
        let command = self.cargo_command(build);
        run(&command, cancel).await?;

        let built = self
            .root
            .join("target")
            .join(build.architecture.rust_target())
            .join("release")
            .join(&build.entry);
        if !tokio::fs::try_exists(&built).await.unwrap_or(false) {
            return Err(BuildError::MissingOutput { path: built });
        }

        let scratch = tempfile::Builder::new()
            .prefix("berth-build-")
            .tempdir()
            .map_err(|err| BuildError::Staging {
                message: err.to_string(),
            })?;
        let staged_dir =
            Utf8PathBuf::from_path_buf(scratch.path().to_path_buf()).map_err(|path| {
                BuildError::Staging {
                    message: format!("non UTF-8 scratch path {}", path.display()),
                }
            })?;
        let staged = staged_dir.join(&build.output);
        let size = tokio::fs::copy(&built, &staged)
            .await
            .map_err(|err| BuildError::Staging {
                message: err.to_string(),
            })?;
        info!(path = %staged, bytes = size, "binary built");
        Ok(BuildOutput::scoped(staged, scratch))
    }

    #[instrument(skip(self, build, cancel), fields(dir = %build.dir))]
    async fn build_static(
        &self,
        build: &StaticBuild,
        cancel: &CancellationToken,
    ) -> Result<BuildOutput, BuildError> {
        let command = self.static_command(build);
        run(&command, cancel).await?;

        let output = command.dir.join(&build.output);
        let is_dir = tokio::fs::metadata(&output)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(BuildError::MissingOutput { path: output });
        }
        info!(path = %output, "static tree built");
        Ok(BuildOutput::persistent(output))
    }
}

impl Builder for LocalBuilder {
    fn build<'a>(
        &'a self,
        artifact: &'a ArtifactKind,
        cancel: &'a CancellationToken,
    ) -> BuildFuture<'a> {
        Box::pin(async move {
            match artifact {
                ArtifactKind::Binary { build, .. } => self.build_binary(build, cancel).await,
                ArtifactKind::StaticTree { build } => self.build_static(build, cancel).await,
            }
        })
    }
}

/// Runs `command` with inherited stdio, killing it if `cancel` fires.
async fn run(command: &BuildCommand, cancel: &CancellationToken) -> Result<(), BuildError> {
    info!(command = %command, dir = %command.dir, "running build");
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .envs(command.env.iter().map(|(key, value)| (key, value)))
        .current_dir(&command.dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| BuildError::Spawn {
            program: command.program.clone(),
            message: err.to_string(),
        })?;

    let status: ExitStatus = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            // kill_on_drop reaps the child once `child` goes out of scope.
            return Err(BuildError::Cancelled);
        }
        waited = child.wait() => waited.map_err(|err| BuildError::Spawn {
            program: command.program.clone(),
            message: err.to_string(),
        })?,
    };

    if status.success() {
        Ok(())
    } else {
        Err(BuildError::Failed {
            command: command.to_string(),
            status: status.to_string(),
            code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests;
