//! Host bootstrap pipeline.
//!
//! [`Provisioner::setup`] turns a bare Ubuntu host into one that can run the
//! project: packages, container runtime, runtime user, install directory,
//! service unit, sidecar containers, and firewall. Every stage tolerates the
//! "already done" case, so re-running setup is the resync path.

use std::fmt;

use camino::Utf8Path;
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::compose::{ComposeError, compose_path, render_compose, up_command};
use crate::project::{DeploymentPlan, ProjectDescriptor};
use crate::transport::remote_command::{mkdir_command, quote, quote_path, write_file_command};
use crate::transport::{DEFAULT_SSH_PORT, RemoteShell, TransportError};
use crate::unit::{ServiceUnitSpec, install_unit};

/// Lists listening sockets.
pub const PORT_SCAN: &str = "ss -tuln";

/// Refreshes and upgrades system packages and installs `setcap`.
pub const SYSTEM_PACKAGES: &str = "sudo apt-get update \
    && sudo DEBIAN_FRONTEND=noninteractive apt-get upgrade -y \
    && sudo DEBIAN_FRONTEND=noninteractive apt-get install -y libcap2-bin";

/// Installs Docker when missing and enables it at boot.
pub const CONTAINER_RUNTIME: &str = "(command -v docker >/dev/null 2>&1 \
    || (curl -fsSL https://get.docker.com -o /tmp/get-docker.sh && sudo sh /tmp/get-docker.sh)) \
    && sudo systemctl enable --now docker";

/// Default-deny inbound firewall that keeps the SSH port and web traffic
/// open.
#[must_use]
pub fn firewall_command(ssh_port: u16) -> String {
    format!(
        "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y ufw \
         && sudo ufw default deny incoming \
         && sudo ufw default allow outgoing \
         && sudo ufw allow {ssh_port}/tcp \
         && sudo ufw allow http \
         && sudo ufw allow https \
         && sudo ufw --force enable"
    )
}

/// Pipeline stages in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProvisionStage {
    /// Warn about required-free ports already in use.
    PortPreflight,
    /// Update and upgrade packages.
    SystemPackages,
    /// Install and enable the container runtime.
    ContainerRuntime,
    /// Create the runtime user.
    RuntimeUser,
    /// Create and chown the install directory.
    InstallDirectory,
    /// Install and enable the service unit.
    ServiceUnit,
    /// Write and start the sidecar compose file.
    Sidecars,
    /// Configure the firewall.
    Firewall,
}

impl fmt::Display for ProvisionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PortPreflight => "port preflight",
            Self::SystemPackages => "system packages",
            Self::ContainerRuntime => "container runtime",
            Self::RuntimeUser => "runtime user",
            Self::InstallDirectory => "install directory",
            Self::ServiceUnit => "service unit",
            Self::Sidecars => "sidecar containers",
            Self::Firewall => "firewall",
        })
    }
}

/// Errors raised by [`Provisioner::setup`].
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A fatal stage failed on the remote host.
    #[error("provisioning failed at {stage}: {source}")]
    Stage {
        /// Failing stage.
        stage: ProvisionStage,
        /// Remote error, carrying captured output when available.
        #[source]
        source: TransportError,
    },
    /// The sidecar compose file could not be rendered.
    #[error("provisioning failed at sidecar containers: {source}")]
    Compose {
        /// Rendering failure.
        #[from]
        source: ComposeError,
    },
    /// Cancellation fired before or during `stage`.
    #[error("provisioning cancelled at {stage}")]
    Cancelled {
        /// Stage that did not complete.
        stage: ProvisionStage,
    },
}

/// Advisory findings from a successful setup.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SetupReport {
    /// Required-free ports that were already bound.
    pub port_conflicts: Vec<u16>,
    /// Advisory stage failures, rendered for the operator.
    pub warnings: Vec<String>,
}

/// Runs the bootstrap stages over a connected session.
#[derive(Debug)]
pub struct Provisioner<'a, S: ?Sized> {
    shell: &'a S,
    descriptor: &'a ProjectDescriptor,
    plan: DeploymentPlan,
    ssh_port: u16,
}

impl<'a, S> Provisioner<'a, S>
where
    S: RemoteShell + ?Sized,
{
    /// Creates a provisioner for `descriptor` over `shell`.
    #[must_use]
    pub fn new(shell: &'a S, descriptor: &'a ProjectDescriptor) -> Self {
        Self {
            shell,
            descriptor,
            plan: descriptor.deployment_plan(),
            ssh_port: DEFAULT_SSH_PORT,
        }
    }

    /// Keeps `port` open in the firewall instead of the default SSH port.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Runs every stage in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Stage`] for the first fatal stage that fails
    /// and [`ProvisionError::Cancelled`] when `cancel` fires. Port conflicts
    /// and firewall failures are reported in the [`SetupReport`] instead.
    #[instrument(skip(self, cancel), fields(project = %self.descriptor.name))]
    pub async fn setup(&self, cancel: &CancellationToken) -> Result<SetupReport, ProvisionError> {
        let mut report = SetupReport::default();
        let user = self.plan.user.as_str();
        let remote_path = self.plan.remote_path.as_path();

        if !self.descriptor.server.free_ports.is_empty() {
            self.preflight(&mut report, cancel).await?;
        }

        self.step(ProvisionStage::SystemPackages, SYSTEM_PACKAGES, cancel)
            .await?;
        self.step(ProvisionStage::ContainerRuntime, CONTAINER_RUNTIME, cancel)
            .await?;
        self.step(
            ProvisionStage::RuntimeUser,
            &runtime_user_command(user),
            cancel,
        )
        .await?;
        self.step(
            ProvisionStage::InstallDirectory,
            &install_directory_command(remote_path, user),
            cancel,
        )
        .await?;

        if let Some(service) = self.plan.service() {
            let stage = ProvisionStage::ServiceUnit;
            checkpoint(stage, cancel)?;
            info!(stage = %stage, "provisioning");
            let spec = ServiceUnitSpec::from_plan(&self.plan, service);
            install_unit(self.shell, &service.service, &spec)
                .await
                .map_err(|source| ProvisionError::Stage { stage, source })?;
        }

        if self.descriptor.services.any_enabled() {
            let compose = render_compose(&self.descriptor.services)?;
            let path = compose_path(remote_path);
            let directory = path.parent().unwrap_or(remote_path);
            let stage = ProvisionStage::Sidecars;
            self.step(stage, &mkdir_command([directory], true), cancel)
                .await?;
            self.step(stage, &write_file_command(&path, &compose), cancel)
                .await?;
            self.step(stage, &up_command(&path), cancel).await?;
        }

        let firewall = firewall_command(self.ssh_port);
        match self.step(ProvisionStage::Firewall, &firewall, cancel).await {
            Ok(_) => {}
            Err(ProvisionError::Stage { stage, source }) => {
                warn!(stage = %stage, error = %source, "firewall setup failed; continuing");
                report.warnings.push(format!("{stage}: {source}"));
            }
            Err(err) => return Err(err),
        }

        info!(
            conflicts = report.port_conflicts.len(),
            warnings = report.warnings.len(),
            "setup complete"
        );
        Ok(report)
    }

    async fn preflight(
        &self,
        report: &mut SetupReport,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        match self.step(ProvisionStage::PortPreflight, PORT_SCAN, cancel).await {
            Ok(listening) => {
                report.port_conflicts =
                    port_conflicts(&listening, &self.descriptor.server.free_ports);
                for port in &report.port_conflicts {
                    warn!(port, "port required to be free is already in use");
                }
                Ok(())
            }
            Err(ProvisionError::Stage { stage, source }) => {
                warn!(stage = %stage, error = %source, "could not check free ports");
                report.warnings.push(format!("{stage}: {source}"));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn step(
        &self,
        stage: ProvisionStage,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProvisionError> {
        checkpoint(stage, cancel)?;
        info!(stage = %stage, "provisioning");
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ProvisionError::Cancelled { stage }),
            result = self.shell.run_command(command) => {
                result.map_err(|source| ProvisionError::Stage { stage, source })
            }
        }
    }
}

fn checkpoint(stage: ProvisionStage, cancel: &CancellationToken) -> Result<(), ProvisionError> {
    if cancel.is_cancelled() {
        return Err(ProvisionError::Cancelled { stage });
    }
    Ok(())
}

/// Creates `user` unless it exists and adds it to the `docker` group.
#[must_use]
pub fn runtime_user_command(user: &str) -> String {
    let name = quote(user);
    format!(
        "(id -u {name} >/dev/null 2>&1 || sudo useradd -m -s /bin/bash {name}) \
         && sudo usermod -aG docker {name}"
    )
}

/// Creates the install directory and hands it to `user`.
#[must_use]
pub fn install_directory_command(remote_path: &Utf8Path, user: &str) -> String {
    let owner = quote(user);
    format!(
        "{} && sudo chown -R {owner}:{owner} {}",
        mkdir_command([remote_path], true),
        quote_path(remote_path)
    )
}

/// Ports from `ports` that appear as a listening local port in `ss -tuln`
/// output.
#[must_use]
pub fn port_conflicts(listening: &str, ports: &[u16]) -> Vec<u16> {
    ports
        .iter()
        .copied()
        .filter(|port| {
            Regex::new(&format!(r":{port}(\s|$)")).is_ok_and(|pattern| {
                listening
                    .lines()
                    .any(|line| pattern.is_match(local_address(line)))
            })
        })
        .collect()
}

/// Local address column of an `ss -tuln` row, or the whole row when it does
/// not have the usual shape.
fn local_address(line: &str) -> &str {
    line.split_whitespace().nth(4).unwrap_or(line)
}
