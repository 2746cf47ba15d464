//! Provider credentials and transport settings loaded via `ortho-config`.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::transport::RemoteTarget;

/// Default private key offered to new hosts.
pub const DEFAULT_SSH_KEY_PATH: &str = "~/.ssh/id_ed25519";

/// Credentials and connection settings derived from environment variables,
/// configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BERTH",
    discovery(
        app_name = "berth",
        env_var = "BERTH_CONFIG_PATH",
        config_file_name = "berth.toml",
        dotfile_name = ".berth.toml",
        project_file_name = "berth.toml"
    )
)]
pub struct Credentials {
    /// Scaleway API secret key. Required.
    pub secret_key: String,
    /// Scaleway project that owns instances and SSH keys. Required.
    pub project_id: String,
    /// Private key used for SSH sessions. Supports `~/` expansion.
    #[ortho_config(default = DEFAULT_SSH_KEY_PATH.to_owned())]
    pub ssh_key_path: String,
    /// Login user for SSH sessions.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// SSH port on provisioned hosts.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// How long to wait for SSH to accept connections after boot.
    #[ortho_config(default = 120)]
    pub reachability_timeout_secs: u64,
    /// Spacing between provider status polls and reachability dials.
    #[ortho_config(default = 2)]
    pub poll_interval_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl Credentials {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to berth.toml (or run `berth auth`)",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads credentials without parsing CLI arguments. Values merge
    /// defaults, configuration files, and environment variables in that order
    /// of precedence, then pass through [`Self::validate`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails and
    /// [`ConfigError::MissingField`] or [`ConfigError::Invalid`] when
    /// validation fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let credentials = Self::load_from_iter([std::ffi::OsString::from("berth")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        credentials.validate()?;
        Ok(credentials)
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and TOML key that supply each missing value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a numeric setting is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.secret_key,
            &FieldMetadata::new("Scaleway API secret key", "BERTH_SECRET_KEY", "secret_key"),
        )?;
        Self::require_field(
            &self.project_id,
            &FieldMetadata::new("Scaleway project ID", "BERTH_PROJECT_ID", "project_id"),
        )?;
        Self::require_field(
            &self.ssh_key_path,
            &FieldMetadata::new("SSH private key path", "BERTH_SSH_KEY_PATH", "ssh_key_path"),
        )?;
        Self::require_field(
            &self.ssh_user,
            &FieldMetadata::new("SSH user", "BERTH_SSH_USER", "ssh_user"),
        )?;
        for (field, value) in [
            ("ssh_port", u64::from(self.ssh_port)),
            ("reachability_timeout_secs", self.reachability_timeout_secs),
            ("poll_interval_secs", self.poll_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        Ok(())
    }

    /// Builds the SSH target for `host` using the configured user, key, and
    /// port.
    #[must_use]
    pub fn remote_target(&self, host: &str) -> RemoteTarget {
        RemoteTarget::new(host, self.ssh_user.as_str(), &self.ssh_key_path).with_port(self.ssh_port)
    }

    /// Bound on waiting for a new host to accept SSH connections.
    #[must_use]
    pub const fn reachability_timeout(&self) -> Duration {
        Duration::from_secs(self.reachability_timeout_secs)
    }

    /// Spacing between provider polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds an unusable value.
    #[error("invalid configuration field {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
