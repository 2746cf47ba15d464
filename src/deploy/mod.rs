//! Build, ship, and cut over a new artifact on a provisioned host.
//!
//! The pipeline is linear with no rollback: Build, Stop, Upload, Configure,
//! Start, Verify. A static tree finishes after Upload. Artifacts land in a
//! scratch location the login user can write, then move into place with
//! `sudo`. A binary is staged next to its final path and renamed over it
//! only once it is complete and executable, so a failed transfer never
//! replaces the running binary.

use std::fmt;
use std::future::Future;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::build::{BuildError, BuildOutput, Builder};
use crate::project::{ArtifactKind, DeploymentPlan, ServiceBinary};
use crate::transport::remote_command::{quote, quote_path};
use crate::transport::{RemoteShell, TransportError};
use crate::unit::{
    FAILURE_JOURNAL_LINES, ServiceUnitSpec, install_unit, is_active_command, journal_command,
    systemctl,
};

/// Remote directory holding per-deploy scratch uploads.
pub const SCRATCH_DIRECTORY: &str = "/tmp";

/// Pipeline stages in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeployStage {
    /// Produce the artifact locally.
    Build,
    /// Stop the running service.
    Stop,
    /// Ship the artifact.
    Upload,
    /// Install the service unit.
    Configure,
    /// Start the service.
    Start,
    /// Check the service is active.
    Verify,
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Build => "build",
            Self::Stop => "stop",
            Self::Upload => "upload",
            Self::Configure => "configure",
            Self::Start => "start",
            Self::Verify => "verify",
        })
    }
}

/// Errors raised by [`Deployer::deploy`].
#[derive(Debug, Error)]
pub enum DeployError {
    /// The local build failed; the remote host was not touched.
    #[error("deploy failed at build: {0}")]
    Build(#[source] BuildError),
    /// A remote stage failed.
    #[error("deploy failed at {stage}: {source}")]
    Stage {
        /// Failing stage.
        stage: DeployStage,
        /// Remote error, carrying captured output when available.
        #[source]
        source: TransportError,
    },
    /// The service did not report `active` after starting.
    #[error("service {service} is {status} after start; recent journal:\n{journal}")]
    Unhealthy {
        /// Unit name.
        service: String,
        /// Reported unit state.
        status: String,
        /// Last journal lines, or a note when they could not be fetched.
        journal: String,
    },
    /// Cancellation fired before or during `stage`.
    #[error("deploy cancelled at {stage}")]
    Cancelled {
        /// Stage that did not complete.
        stage: DeployStage,
    },
}

/// Summary of a successful deploy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeployReport {
    /// Stages that ran, in order.
    pub stages: Vec<DeployStage>,
    /// Remote location of the installed artifact.
    pub installed: Utf8PathBuf,
    /// Final unit state for binary deploys.
    pub status: Option<String>,
}

/// Runs the deploy pipeline for one plan over a connected session.
#[derive(Debug)]
pub struct Deployer<'a, S: ?Sized, B: ?Sized> {
    shell: &'a S,
    builder: &'a B,
    plan: &'a DeploymentPlan,
}

impl<'a, S, B> Deployer<'a, S, B>
where
    S: RemoteShell + ?Sized,
    B: Builder + ?Sized,
{
    /// Creates a deployer.
    #[must_use]
    pub const fn new(shell: &'a S, builder: &'a B, plan: &'a DeploymentPlan) -> Self {
        Self {
            shell,
            builder,
            plan,
        }
    }

    /// Runs the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the first fatal failure wrapped with its stage. A failed stop
    /// is only logged.
    #[instrument(skip(self, cancel), fields(remote_path = %self.plan.remote_path))]
    pub async fn deploy(&self, cancel: &CancellationToken) -> Result<DeployReport, DeployError> {
        checkpoint(DeployStage::Build, cancel)?;
        info!(stage = %DeployStage::Build, "deploying");
        // Dropping the output removes any scratch directory on every path.
        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(DeployError::Cancelled { stage: DeployStage::Build }),
            built = self.builder.build(&self.plan.artifact, cancel) => built.map_err(|err| match err {
                BuildError::Cancelled => DeployError::Cancelled { stage: DeployStage::Build },
                other => DeployError::Build(other),
            })?,
        };

        match &self.plan.artifact {
            ArtifactKind::StaticTree { .. } => self.ship_tree(&output, cancel).await,
            ArtifactKind::Binary { service, .. } => {
                self.ship_binary(&output, service, cancel).await
            }
        }
    }

    async fn ship_tree(
        &self,
        output: &BuildOutput,
        cancel: &CancellationToken,
    ) -> Result<DeployReport, DeployError> {
        let stage = DeployStage::Upload;
        checkpoint(stage, cancel)?;
        let remote = self.plan.remote_path.as_path();
        let scratch = scratch_path("tree");
        info!(stage = %stage, source = %output.path(), scratch = %scratch, "deploying");

        let shipped = match guarded(stage, cancel, self.shell.upload_tree(output.path(), &scratch))
            .await
        {
            Ok(()) => self
                .run(stage, &install_tree_command(&scratch, remote, &self.plan.user), cancel)
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };
        let cleanup = format!("rm -rf {}", quote_path(&scratch));
        if let Err(err) = self.shell.run_command(&cleanup).await {
            warn!(path = %scratch, error = %err, "could not remove scratch upload");
        }
        shipped?;

        Ok(DeployReport {
            stages: vec![DeployStage::Build, DeployStage::Upload],
            installed: remote.to_path_buf(),
            status: None,
        })
    }

    async fn ship_binary(
        &self,
        output: &BuildOutput,
        service: &ServiceBinary,
        cancel: &CancellationToken,
    ) -> Result<DeployReport, DeployError> {
        let name = service.service.as_str();

        checkpoint(DeployStage::Stop, cancel)?;
        info!(stage = %DeployStage::Stop, service = name, "deploying");
        match self.run(DeployStage::Stop, &systemctl("stop", name), cancel).await {
            Ok(_) => {}
            Err(DeployError::Stage { source, .. }) => {
                warn!(service = name, error = %source, "stop failed; continuing (first deploy?)");
            }
            Err(err) => return Err(err),
        }

        checkpoint(DeployStage::Upload, cancel)?;
        let installed = self.plan.remote_path.join(&service.file_name);
        self.upload_binary(output.path(), &installed, cancel).await?;

        checkpoint(DeployStage::Configure, cancel)?;
        info!(stage = %DeployStage::Configure, service = name, "deploying");
        let unit = ServiceUnitSpec::from_plan(self.plan, service);
        guarded(
            DeployStage::Configure,
            cancel,
            install_unit(self.shell, name, &unit),
        )
        .await?;

        checkpoint(DeployStage::Start, cancel)?;
        info!(stage = %DeployStage::Start, service = name, "deploying");
        self.run(DeployStage::Start, &systemctl("start", name), cancel)
            .await?;

        checkpoint(DeployStage::Verify, cancel)?;
        let status = self.verify(name, cancel).await?;

        Ok(DeployReport {
            stages: vec![
                DeployStage::Build,
                DeployStage::Stop,
                DeployStage::Upload,
                DeployStage::Configure,
                DeployStage::Start,
                DeployStage::Verify,
            ],
            installed,
            status: Some(status),
        })
    }

    /// Pushes the binary to a scratch path, moves it to a staging name beside
    /// `installed`, prepares it, then renames it over the live path.
    async fn upload_binary(
        &self,
        local: &Utf8Path,
        installed: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<(), DeployError> {
        let stage = DeployStage::Upload;
        let upload = scratch_path(installed.file_name().unwrap_or("artifact"));
        let staged = staging_path(installed);
        info!(stage = %stage, source = %local, upload = %upload, staged = %staged, "deploying");

        let shipped = match guarded(stage, cancel, self.shell.upload_file(local, &upload)).await {
            Ok(()) => {
                let activate =
                    activate_binary_command(&upload, &staged, installed, &self.plan.user);
                self.run(stage, &activate, cancel).await.map(|_| ())
            }
            Err(err) => Err(err),
        };
        if shipped.is_err() {
            let cleanup = format!("sudo rm -f {} {}", quote_path(&upload), quote_path(&staged));
            if let Err(err) = self.shell.run_command(&cleanup).await {
                warn!(path = %staged, error = %err, "could not remove staged upload");
            }
        }
        shipped
    }

    async fn verify(&self, service: &str, cancel: &CancellationToken) -> Result<String, DeployError> {
        let stage = DeployStage::Verify;
        info!(stage = %stage, service, "deploying");
        let status = match self.run(stage, &is_active_command(service), cancel).await {
            Ok(output) => output.trim().to_owned(),
            Err(DeployError::Stage { source, .. }) => source
                .output()
                .map(str::trim)
                .filter(|output| !output.is_empty())
                .unwrap_or("unknown")
                .to_owned(),
            Err(err) => return Err(err),
        };
        if status == "active" {
            info!(service, "service active");
            return Ok(status);
        }

        let journal = match self
            .run(stage, &journal_command(service, FAILURE_JOURNAL_LINES, false), cancel)
            .await
        {
            Ok(lines) => lines,
            Err(DeployError::Stage { source, .. }) => format!("(journal unavailable: {source})"),
            Err(err) => return Err(err),
        };
        warn!(service, status = %status, "service failed verification");
        Err(DeployError::Unhealthy {
            service: service.to_owned(),
            status,
            journal,
        })
    }

    async fn run(
        &self,
        stage: DeployStage,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeployError> {
        guarded(stage, cancel, self.shell.run_command(command)).await
    }
}

/// Races remote `work` against cancellation, attributing either outcome to
/// `stage`.
async fn guarded<T>(
    stage: DeployStage,
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, DeployError> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DeployError::Cancelled { stage }),
        result = work => result.map_err(|source| DeployError::Stage { stage, source }),
    }
}

fn checkpoint(stage: DeployStage, cancel: &CancellationToken) -> Result<(), DeployError> {
    if cancel.is_cancelled() {
        return Err(DeployError::Cancelled { stage });
    }
    Ok(())
}

/// Unique staging path in the same directory as `installed`, so the final
/// rename never crosses file systems.
#[must_use]
pub fn staging_path(installed: &Utf8Path) -> Utf8PathBuf {
    let name = installed.file_name().unwrap_or("artifact");
    let staged = format!(".{name}.{}.partial", Uuid::new_v4().simple());
    installed
        .parent()
        .map_or_else(|| Utf8PathBuf::from(&staged), |dir| dir.join(&staged))
}

/// Unique path under [`SCRATCH_DIRECTORY`] for an upload labelled `label`.
#[must_use]
pub fn scratch_path(label: &str) -> Utf8PathBuf {
    Utf8Path::new(SCRATCH_DIRECTORY).join(format!("berth-{}-{label}", Uuid::new_v4().simple()))
}

/// Moves the uploaded binary to its staging name, sets owner, execute bit,
/// and low-port capability, then renames it over `installed`.
#[must_use]
pub fn activate_binary_command(
    upload: &Utf8Path,
    staged: &Utf8Path,
    installed: &Utf8Path,
    user: &str,
) -> String {
    let staged_arg = quote_path(staged);
    let owner = quote(user);
    format!(
        "sudo mv {} {staged_arg} \
         && sudo chown {owner}:{owner} {staged_arg} \
         && sudo chmod +x {staged_arg} \
         && sudo setcap 'cap_net_bind_service=+ep' {staged_arg} \
         && sudo mv {staged_arg} {}",
        quote_path(upload),
        quote_path(installed)
    )
}

/// Copies an uploaded tree into `remote`, creating it if needed, then hands
/// it to `user`.
#[must_use]
pub fn install_tree_command(scratch: &Utf8Path, remote: &Utf8Path, user: &str) -> String {
    format!(
        "sudo mkdir -p {remote_arg} && sudo cp -R {}/. {remote_arg} && {}",
        quote_path(scratch),
        tree_permissions_command(remote, user),
        remote_arg = quote_path(remote),
    )
}

/// Recursively hands a static tree to `user` with world-readable files.
#[must_use]
pub fn tree_permissions_command(remote: &Utf8Path, user: &str) -> String {
    let path = quote_path(remote);
    let owner = quote(user);
    format!("sudo chown -R {owner}:{owner} {path} && sudo chmod -R u=rwX,go=rX {path}")
}

#[cfg(test)]
mod tests;
