//! Deployment plans derived from a descriptor.
//!
//! The deploy kind is resolved once into [`ArtifactKind`]. A static tree has
//! no service identity at all, so a plan cannot describe a static artifact
//! that also points at a process service.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;

use super::{Architecture, DeployKind, ProjectDescriptor};

/// Process-service half of a binary deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceBinary {
    /// File name of the installed binary inside the install directory.
    pub file_name: String,
    /// Unit name managed by the init system.
    pub service: String,
    /// Human-readable unit description.
    pub description: String,
    /// Extra arguments appended to the start command.
    pub args: Vec<String>,
    /// Runtime environment for the unit.
    pub env: BTreeMap<String, String>,
}

/// Binary build inputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryBuild {
    /// Binary target to build.
    pub entry: String,
    /// Output file name.
    pub output: String,
    /// Target architecture.
    pub architecture: Architecture,
    /// Extra linker flags.
    pub link_flags: Vec<String>,
    /// Extra build environment.
    pub env: BTreeMap<String, String>,
}

/// Static build inputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StaticBuild {
    /// Shell command producing the tree.
    pub command: String,
    /// Directory the command runs in.
    pub dir: Utf8PathBuf,
    /// Output directory, relative to `dir`.
    pub output: Utf8PathBuf,
}

/// What a deployment ships.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ArtifactKind {
    /// A single executable run as a managed service.
    Binary {
        /// How to build it.
        build: BinaryBuild,
        /// How to run it.
        service: ServiceBinary,
    },
    /// A tree of files served by something else.
    StaticTree {
        /// How to build it.
        build: StaticBuild,
    },
}

/// Read-only description of a deploy run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeploymentPlan {
    /// Artifact and, for binaries, the service that runs it.
    pub artifact: ArtifactKind,
    /// Remote install directory.
    pub remote_path: Utf8PathBuf,
    /// Runtime user owning the install directory.
    pub user: String,
}

impl DeploymentPlan {
    /// Service half of the plan when it deploys a binary.
    #[must_use]
    pub const fn service(&self) -> Option<&ServiceBinary> {
        match &self.artifact {
            ArtifactKind::Binary { service, .. } => Some(service),
            ArtifactKind::StaticTree { .. } => None,
        }
    }
}

impl ProjectDescriptor {
    /// Derives the plan for this descriptor. The descriptor is assumed to
    /// have passed [`ProjectDescriptor::validate`].
    #[must_use]
    pub fn deployment_plan(&self) -> DeploymentPlan {
        let artifact = match self.deploy.kind {
            DeployKind::Service => ArtifactKind::Binary {
                build: BinaryBuild {
                    entry: self.build.entry.clone(),
                    output: self.build.output.clone(),
                    architecture: self.server.architecture,
                    link_flags: self.build.link_flags.clone(),
                    env: self.build.env.clone(),
                },
                service: ServiceBinary {
                    file_name: self.build.output.clone(),
                    service: self.service_name().to_owned(),
                    description: self.name.clone(),
                    args: self.deploy.args.clone(),
                    env: self.deploy.env.clone(),
                },
            },
            DeployKind::Static => ArtifactKind::StaticTree {
                build: StaticBuild {
                    command: self.build.command.clone(),
                    dir: Utf8PathBuf::from(&self.build.dir),
                    output: Utf8PathBuf::from(&self.build.output),
                },
            },
        };
        DeploymentPlan {
            artifact,
            remote_path: Utf8PathBuf::from(&self.deploy.remote_path),
            user: self.deploy.user.clone(),
        }
    }
}
