//! Provider-facing host flows: create and wait until usable, look up, and
//! destroy.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::cloud::{CloudApi, CloudError, Instance, InstanceSpec, SshKey};
use crate::project::ProjectDescriptor;
use crate::transport::DEFAULT_SSH_PORT;
use crate::wait::{DEFAULT_POLL_INTERVAL, WaitError, wait_for_completion, wait_for_reachability};

/// Default bound on waiting for SSH after boot.
pub const DEFAULT_REACHABILITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors raised by host flows.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum LifecycleError {
    /// Provider call failed, or the resource was absent or duplicated.
    #[error(transparent)]
    Cloud(#[from] CloudError),
    /// Waiting for the operation or for SSH failed.
    #[error(transparent)]
    Wait(#[from] WaitError),
    /// The instance booted without a public address.
    #[error("instance {name} has no public IP address")]
    NoAddress {
        /// Instance name.
        name: String,
    },
}

/// Server settings for a new host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostRequest {
    /// Instance name.
    pub name: String,
    /// Provider zone.
    pub zone: String,
    /// Commercial type.
    pub instance_type: String,
    /// Image label.
    pub image: String,
    /// Provider architecture label.
    pub architecture: String,
    /// SSH key name or identifier; the first registered key when `None`.
    pub ssh_key: Option<String>,
}

impl HostRequest {
    /// Reads the server section of a descriptor.
    #[must_use]
    pub fn from_descriptor(descriptor: &ProjectDescriptor, ssh_key: Option<&str>) -> Self {
        let server = &descriptor.server;
        Self {
            name: server.name.clone(),
            zone: server.zone.clone(),
            instance_type: server.instance_type.clone(),
            image: server.image.clone(),
            architecture: server.architecture.provider_label().to_owned(),
            ssh_key: ssh_key.map(str::to_owned),
        }
    }
}

/// Host flows over a [`CloudApi`].
#[derive(Debug)]
pub struct HostLifecycle<'a, C: ?Sized> {
    cloud: &'a C,
    poll_interval: Duration,
    reachability_timeout: Duration,
    ssh_port: u16,
}

impl<'a, C> HostLifecycle<'a, C>
where
    C: CloudApi + ?Sized,
{
    /// Creates the flows with default intervals.
    #[must_use]
    pub const fn new(cloud: &'a C) -> Self {
        Self {
            cloud,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reachability_timeout: DEFAULT_REACHABILITY_TIMEOUT,
            ssh_port: DEFAULT_SSH_PORT,
        }
    }

    /// Overrides the operation poll and dial retry interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the bound on waiting for SSH.
    #[must_use]
    pub const fn with_reachability_timeout(mut self, bound: Duration) -> Self {
        self.reachability_timeout = bound;
        self
    }

    /// Overrides the port dialled for reachability.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Creates a host and returns once it accepts TCP connections on the SSH
    /// port.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::AlreadyExists`] when the name is taken,
    /// [`CloudError::NotFound`] when no usable SSH key is registered, wait
    /// errors from the boot action or reachability wait, and
    /// [`LifecycleError::NoAddress`] when the host has no public IP.
    #[instrument(skip(self, request, cancel), fields(name = %request.name, zone = %request.zone))]
    pub async fn create_host(
        &self,
        request: &HostRequest,
        cancel: &CancellationToken,
    ) -> Result<Instance, LifecycleError> {
        if self.cloud.get_instance(&request.name).await?.is_some() {
            return Err(CloudError::AlreadyExists {
                kind: "instance",
                name: request.name.clone(),
            }
            .into());
        }

        let keys = self.cloud.list_ssh_keys().await?;
        let key = select_ssh_key(&keys, request.ssh_key.as_deref())?;
        info!(key = %key.name, "using SSH key");

        let spec = InstanceSpec::builder()
            .name(request.name.as_str())
            .zone(request.zone.as_str())
            .instance_type(request.instance_type.as_str())
            .image(request.image.as_str())
            .architecture(request.architecture.as_str())
            .ssh_key(key.id.as_str())
            .build()?;
        let creation = self.cloud.create_instance(&spec).await?;
        info!(id = %creation.instance.id, "instance created; waiting for boot");
        wait_for_completion(self.cloud, &creation.operation, self.poll_interval, cancel).await?;

        let instance = self.find_host(&request.name).await?;
        let address = instance.public_ip.ok_or_else(|| LifecycleError::NoAddress {
            name: instance.name.clone(),
        })?;
        info!(%address, "instance running; waiting for SSH");
        wait_for_reachability(
            SocketAddr::new(address, self.ssh_port),
            self.reachability_timeout,
            self.poll_interval,
            cancel,
        )
        .await?;
        Ok(instance)
    }

    /// Looks up an existing host by name.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::NotFound`] when no instance has that name.
    pub async fn find_host(&self, name: &str) -> Result<Instance, LifecycleError> {
        self.cloud.get_instance(name).await?.ok_or_else(|| {
            CloudError::NotFound {
                kind: "instance",
                name: name.to_owned(),
            }
            .into()
        })
    }

    /// Destroys the named host and waits for the provider to finish.
    /// Returns `false` when there was nothing to destroy.
    ///
    /// # Errors
    ///
    /// Returns provider and wait errors.
    #[instrument(skip(self, cancel))]
    pub async fn destroy_host(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, LifecycleError> {
        let operation = match self.cloud.delete_instance(name).await {
            Ok(operation) => operation,
            Err(CloudError::NotFound { .. }) => {
                info!("no instance to destroy");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        };
        wait_for_completion(self.cloud, &operation, self.poll_interval, cancel).await?;
        info!("instance destroyed");
        Ok(true)
    }
}

/// Picks the key whose name or identifier equals `wanted`, or the first key
/// when nothing is requested.
///
/// # Errors
///
/// Returns [`CloudError::NotFound`] when the requested key is missing or no
/// key is registered.
pub fn select_ssh_key<'k>(keys: &'k [SshKey], wanted: Option<&str>) -> Result<&'k SshKey, CloudError> {
    match wanted {
        Some(wanted_key) => keys
            .iter()
            .find(|key| key.name == wanted_key || key.id == wanted_key)
            .ok_or_else(|| CloudError::NotFound {
                kind: "SSH key",
                name: wanted_key.to_owned(),
            }),
        None => keys.first().ok_or_else(|| CloudError::NotFound {
            kind: "SSH key",
            name: String::from("(none registered)"),
        }),
    }
}
