//! Core library for the `berth` deploy tool.
//!
//! The crate provisions a Scaleway virtual machine from a project
//! descriptor, bootstraps it over SSH, and deploys either a cross-compiled
//! service binary managed by systemd or a static file tree. The pipelines
//! run against the [`transport::RemoteShell`] and [`cloud::CloudApi`]
//! traits so they can be exercised with the doubles in [`test_support`].

pub mod build;
pub mod cloud;
pub mod compose;
pub mod config;
pub mod config_store;
pub mod deploy;
pub mod lifecycle;
pub mod project;
pub mod provision;
pub mod scaleway;
pub mod test_support;
pub mod transport;
pub mod unit;
pub mod wait;

pub use build::{BuildError, BuildOutput, Builder, LocalBuilder};
pub use cloud::{CloudApi, CloudError, Instance, InstanceSpec, OperationStatus, PendingOperation};
pub use config::{ConfigError, Credentials};
pub use config_store::{ConfigStore, ConfigStoreError, ConfigWriter, StoredCredentials};
pub use deploy::{DeployError, DeployReport, DeployStage, Deployer};
pub use lifecycle::{HostLifecycle, HostRequest, LifecycleError};
pub use project::{DEFAULT_DESCRIPTOR, DeploymentPlan, ProjectDescriptor, ProjectError};
pub use provision::{ProvisionError, ProvisionStage, Provisioner, SetupReport};
pub use scaleway::ScalewayCloud;
pub use transport::{RemoteShell, RemoteTarget, SshSession, TransportError};
pub use wait::{WaitError, wait_for_completion, wait_for_reachability};
