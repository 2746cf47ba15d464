//! Cloud API contract consumed by the host lifecycle flows.
//!
//! Providers expose instance create/get/delete plus SSH key listing. Every
//! mutating call hands back a [`PendingOperation`] that the waiter polls to a
//! terminal state.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

use crate::wait::OperationSource;

/// Future returned by cloud operations.
pub type CloudFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CloudError>> + Send + 'a>>;

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Unique instance name; also the lookup key for later commands.
    pub name: String,
    /// Availability zone (for example `fr-par-1`).
    pub zone: String,
    /// Commercial type (for example `DEV1-S`).
    pub instance_type: String,
    /// Image label resolved by the provider (for example `ubuntu_jammy`).
    pub image: String,
    /// Provider architecture label (`x86_64` or `arm64`).
    pub architecture: String,
    /// SSH key identifiers to authorise on the instance.
    pub ssh_keys: Vec<String>,
}

impl InstanceSpec {
    /// Starts a builder for an [`InstanceSpec`].
    #[must_use]
    pub fn builder() -> InstanceSpecBuilder {
        InstanceSpecBuilder::default()
    }

    /// Validates the instance request, returning the first empty required field.
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Validation`] when any string field is empty.
    pub fn validate(&self) -> Result<(), CloudError> {
        for (field, value) in [
            ("name", &self.name),
            ("zone", &self.zone),
            ("instance_type", &self.instance_type),
            ("image", &self.image),
            ("architecture", &self.architecture),
        ] {
            if value.is_empty() {
                return Err(CloudError::Validation(field.to_owned()));
            }
        }
        Ok(())
    }
}

/// Builder for [`InstanceSpec`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceSpecBuilder {
    name: String,
    zone: String,
    instance_type: String,
    image: String,
    architecture: String,
    ssh_keys: Vec<String>,
}

impl InstanceSpecBuilder {
    /// Sets the instance name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn zone(mut self, value: impl Into<String>) -> Self {
        self.zone = value.into();
        self
    }

    /// Sets the instance type.
    #[must_use]
    pub fn instance_type(mut self, value: impl Into<String>) -> Self {
        self.instance_type = value.into();
        self
    }

    /// Sets the image label.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the architecture label.
    #[must_use]
    pub fn architecture(mut self, value: impl Into<String>) -> Self {
        self.architecture = value.into();
        self
    }

    /// Adds an SSH key identifier.
    #[must_use]
    pub fn ssh_key(mut self, value: impl Into<String>) -> Self {
        self.ssh_keys.push(value.into());
        self
    }

    /// Builds and validates the [`InstanceSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`CloudError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<InstanceSpec, CloudError> {
        let spec = InstanceSpec {
            name: self.name.trim().to_owned(),
            zone: self.zone.trim().to_owned(),
            instance_type: self.instance_type.trim().to_owned(),
            image: self.image.trim().to_owned(),
            architecture: self.architecture.trim().to_owned(),
            ssh_keys: self.ssh_keys,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Provider view of a compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider identifier.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Zone hosting the instance.
    pub zone: String,
    /// Provider state label (for example `running`).
    pub state: String,
    /// Commercial type.
    pub instance_type: String,
    /// Public address, absent until the provider assigns one.
    pub public_ip: Option<IpAddr>,
}

/// Handle to an in-flight asynchronous provider action.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingOperation {
    /// Provider identifier of the action.
    pub operation_id: String,
    /// Resource the action applies to.
    pub resource_id: String,
    /// Zone used to address the action.
    pub zone: String,
}

/// Reported state of a [`PendingOperation`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OperationStatus {
    /// Still in progress.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Completed with a provider-reported failure.
    Failed {
        /// Provider error message.
        message: String,
    },
}

/// Registered SSH public key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshKey {
    /// Provider identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Key fingerprint as reported by the provider.
    pub fingerprint: String,
    /// OpenSSH public key line.
    pub public_key: String,
}

/// Result of a create call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceCreation {
    /// Instance as known right after creation.
    pub instance: Instance,
    /// Action that completes the boot.
    pub operation: PendingOperation,
}

/// Errors raised by cloud providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CloudError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
    /// Raised when the target resource is absent.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (for example `instance`).
        kind: &'static str,
        /// Name or identifier that was looked up.
        name: String,
    },
    /// Raised when a duplicate create is attempted.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Conflicting name.
        name: String,
    },
    /// Raised when the provider API rejects a call.
    #[error("provider error during {action}: {message}")]
    Provider {
        /// Operation being performed.
        action: String,
        /// Provider error string.
        message: String,
    },
}

impl CloudError {
    /// Builds a [`CloudError::Provider`] from any displayable error.
    pub fn provider(action: impl Into<String>, err: &(impl ToString + ?Sized)) -> Self {
        Self::Provider {
            action: action.into(),
            message: err.to_string(),
        }
    }
}

/// Minimal interface implemented by cloud providers.
pub trait CloudApi: OperationSource {
    /// Creates an instance and returns the action that boots it.
    fn create_instance<'a>(&'a self, spec: &'a InstanceSpec) -> CloudFuture<'a, InstanceCreation>;

    /// Looks up an instance by exact name.
    fn get_instance<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<Instance>>;

    /// Deletes the named instance.
    ///
    /// Implementations return [`CloudError::NotFound`] when no instance has
    /// that name.
    fn delete_instance<'a>(&'a self, name: &'a str) -> CloudFuture<'a, PendingOperation>;

    /// Lists the SSH keys registered with the account.
    fn list_ssh_keys(&self) -> CloudFuture<'_, Vec<SshKey>>;
}
