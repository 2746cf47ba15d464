//! Project descriptor (`berth.yaml`) parsing, defaults, and validation.
//!
//! The descriptor is read once per invocation, expanded against the process
//! environment, and handed to the pipelines by reference.

mod expand;
mod plan;
mod starter;

use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use expand::{expand_from_env, expand_variables};
pub use plan::{ArtifactKind, BinaryBuild, DeploymentPlan, ServiceBinary, StaticBuild};
pub use starter::starter_descriptor;

/// Default descriptor file name.
pub const DEFAULT_DESCRIPTOR: &str = "berth.yaml";

/// Errors raised while loading or validating a descriptor.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProjectError {
    /// The descriptor file does not exist.
    #[error("{path} not found; run `berth init` first")]
    NotFound {
        /// Path that was looked up.
        path: Utf8PathBuf,
    },
    /// The descriptor could not be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// Path that was read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The descriptor is not valid YAML for this schema.
    #[error("failed to parse descriptor: {0}")]
    Parse(String),
    /// A field holds an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted field path.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ProjectError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// CPU architecture of the target host.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Architecture {
    /// 64-bit x86.
    #[default]
    #[serde(rename = "x86_64", alias = "x64", alias = "amd64")]
    X86_64,
    /// 64-bit ARM.
    #[serde(rename = "arm64", alias = "aarch64", alias = "arm")]
    Arm64,
}

impl Architecture {
    /// Label used by the cloud provider's image catalogue.
    #[must_use]
    pub const fn provider_label(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
        }
    }

    /// Rust target triple for statically linked Linux binaries.
    #[must_use]
    pub const fn rust_target(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64-unknown-linux-musl",
            Self::Arm64 => "aarch64-unknown-linux-musl",
        }
    }
}

/// How the artifact runs on the host.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployKind {
    /// A binary managed as an init-system service.
    #[default]
    Service,
    /// A static file tree.
    Static,
}

/// Target host settings.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerSection {
    /// Instance name; the lookup key for every later command.
    pub name: String,
    /// Availability zone.
    pub zone: String,
    /// Commercial instance type.
    #[serde(rename = "type")]
    pub instance_type: String,
    /// Image label.
    pub image: String,
    /// CPU architecture.
    #[serde(default)]
    pub architecture: Architecture,
    /// Ports expected to be free before provisioning.
    #[serde(default)]
    pub free_ports: Vec<u16>,
}

/// Build settings.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct BuildSection {
    /// Binary target for service deploys.
    #[serde(default)]
    pub entry: String,
    /// Binary name for service deploys, output directory for static ones.
    #[serde(default)]
    pub output: String,
    /// Extra linker flags passed through `RUSTFLAGS`.
    #[serde(default)]
    pub link_flags: Vec<String>,
    /// Extra build environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Shell command for static builds.
    #[serde(default)]
    pub command: String,
    /// Working directory for static builds.
    #[serde(default = "default_build_dir")]
    pub dir: String,
}

/// Deploy settings.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DeploySection {
    /// Remote install directory.
    pub remote_path: String,
    /// Unit name; falls back to the project name.
    #[serde(default)]
    pub service_name: String,
    /// Runtime user.
    #[serde(default = "default_user")]
    pub user: String,
    /// Extra arguments for the start command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Runtime environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Deploy kind.
    #[serde(default)]
    pub kind: DeployKind,
}

/// One sidecar container.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServiceSpec {
    /// Whether the container is rendered at all.
    #[serde(default)]
    pub enabled: bool,
    /// Container image.
    #[serde(default)]
    pub image: String,
    /// Port published on the same host port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Command override.
    #[serde(default)]
    pub command: Option<String>,
    /// Volume mounts (`source:target`).
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Container environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Custom sidecar keyed by its own name.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CustomService {
    /// Compose service key.
    pub name: String,
    /// Container settings.
    #[serde(flatten)]
    pub spec: ServiceSpec,
}

/// Sidecar containers.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServicesSection {
    /// PostgreSQL.
    #[serde(default)]
    pub postgres: Option<ServiceSpec>,
    /// Typesense.
    #[serde(default)]
    pub typesense: Option<ServiceSpec>,
    /// Redis.
    #[serde(default)]
    pub redis: Option<ServiceSpec>,
    /// Centrifugo.
    #[serde(default)]
    pub centrifugo: Option<ServiceSpec>,
    /// Anything else.
    #[serde(default)]
    pub custom: Vec<CustomService>,
}

/// Names reserved for the well-known sidecars.
pub const WELL_KNOWN_SERVICES: [&str; 4] = ["postgres", "typesense", "redis", "centrifugo"];

impl ServicesSection {
    /// Enabled services in render order: well-known first, then custom in
    /// declaration order.
    #[must_use]
    pub fn enabled(&self) -> Vec<(&str, &ServiceSpec)> {
        let well_known = [
            ("postgres", self.postgres.as_ref()),
            ("typesense", self.typesense.as_ref()),
            ("redis", self.redis.as_ref()),
            ("centrifugo", self.centrifugo.as_ref()),
        ];
        well_known
            .into_iter()
            .filter_map(|(name, spec)| spec.map(|found| (name, found)))
            .chain(
                self.custom
                    .iter()
                    .map(|custom| (custom.name.as_str(), &custom.spec)),
            )
            .filter(|(_, spec)| spec.enabled)
            .collect()
    }

    /// Whether any sidecar is enabled.
    #[must_use]
    pub fn any_enabled(&self) -> bool {
        !self.enabled().is_empty()
    }
}

/// Parsed `berth.yaml`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ProjectDescriptor {
    /// Project name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Target host.
    pub server: ServerSection,
    /// Build settings.
    #[serde(default)]
    pub build: BuildSection,
    /// Deploy settings.
    pub deploy: DeploySection,
    /// Sidecar containers.
    #[serde(default)]
    pub services: ServicesSection,
}

fn default_user() -> String {
    String::from("app")
}

fn default_build_dir() -> String {
    String::from(".")
}

impl ProjectDescriptor {
    /// Reads, expands, parses, and validates the descriptor at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectError::NotFound`] when the file is absent and the
    /// parse or validation errors of [`Self::from_yaml`] otherwise.
    pub fn load(path: &Utf8Path) -> Result<Self, ProjectError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ProjectError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ProjectError::Read {
                    path: path.to_path_buf(),
                    message: err.to_string(),
                }
            }
        })?;
        Self::from_yaml(&expand_from_env(&raw))
    }

    /// Parses and validates an already expanded descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectError::Parse`] for malformed YAML and
    /// [`ProjectError::Invalid`] when validation fails.
    pub fn from_yaml(raw: &str) -> Result<Self, ProjectError> {
        let descriptor: Self =
            serde_yaml::from_str(raw).map_err(|err| ProjectError::Parse(err.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Unit name, defaulting to the project name.
    #[must_use]
    pub fn service_name(&self) -> &str {
        if self.deploy.service_name.trim().is_empty() {
            &self.name
        } else {
            &self.deploy.service_name
        }
    }

    /// Checks required fields and cross-field rules.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ProjectError> {
        for (field, value) in [
            ("name", &self.name),
            ("server.name", &self.server.name),
            ("server.zone", &self.server.zone),
            ("server.type", &self.server.instance_type),
            ("server.image", &self.server.image),
            ("deploy.remote_path", &self.deploy.remote_path),
            ("deploy.user", &self.deploy.user),
            ("build.output", &self.build.output),
        ] {
            if value.trim().is_empty() {
                return Err(ProjectError::invalid(field, "must not be empty"));
            }
        }

        if !self.deploy.remote_path.starts_with('/') {
            return Err(ProjectError::invalid(
                "deploy.remote_path",
                "must be an absolute path",
            ));
        }

        match self.deploy.kind {
            DeployKind::Service => self.validate_service()?,
            DeployKind::Static => {
                if self.build.command.trim().is_empty() {
                    return Err(ProjectError::invalid(
                        "build.command",
                        "static deploys need a build command",
                    ));
                }
            }
        }

        self.validate_services()
    }

    fn validate_service(&self) -> Result<(), ProjectError> {
        if self.build.entry.trim().is_empty() {
            return Err(ProjectError::invalid(
                "build.entry",
                "service deploys need a binary target",
            ));
        }
        if self.build.output.contains('/') {
            return Err(ProjectError::invalid(
                "build.output",
                "must be a file name, not a path",
            ));
        }
        let service = self.service_name();
        if !service
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '@'))
        {
            return Err(ProjectError::invalid(
                "deploy.service_name",
                format!("{service:?} is not a valid unit name"),
            ));
        }
        for key in self.deploy.env.keys() {
            if !is_env_name(key) {
                return Err(ProjectError::invalid(
                    format!("deploy.env.{key}"),
                    "not a valid environment variable name",
                ));
            }
        }
        Ok(())
    }

    fn validate_services(&self) -> Result<(), ProjectError> {
        let mut seen: BTreeSet<&str> = WELL_KNOWN_SERVICES.into_iter().collect();
        for custom in &self.services.custom {
            if custom.name.trim().is_empty() {
                return Err(ProjectError::invalid(
                    "services.custom.name",
                    "must not be empty",
                ));
            }
            if !seen.insert(custom.name.as_str()) {
                return Err(ProjectError::invalid(
                    format!("services.custom.{}", custom.name),
                    "duplicate service name",
                ));
            }
        }
        for (name, spec) in self.services.enabled() {
            if spec.image.trim().is_empty() {
                return Err(ProjectError::invalid(
                    format!("services.{name}.image"),
                    "enabled services need an image",
                ));
            }
        }
        Ok(())
    }
}

fn is_env_name(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}
