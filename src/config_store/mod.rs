//! Persistent credential updates for `berth auth`.
//!
//! Writes into the same file that [`crate::config::Credentials`] reads,
//! located with `OrthoConfig`'s discovery search order.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use ortho_config::ConfigDiscovery;
use thiserror::Error;

use ortho_config::toml;

const APP_NAME: &str = "berth";
const CONFIG_ENV_VAR: &str = "BERTH_CONFIG_PATH";
const CONFIG_FILE_NAME: &str = "berth.toml";
const DOTFILE_NAME: &str = ".berth.toml";
const PROJECT_FILE_NAME: &str = "berth.toml";
const SECRET_KEY: &str = "secret_key";
const PROJECT_ID_KEY: &str = "project_id";

/// Errors raised while reading or saving stored credentials.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    /// Discovery produced no place to keep credentials.
    #[error("nowhere to store credentials: no config file candidates")]
    NoCandidates,
    /// The credentials file or its directory was inaccessible.
    #[error("failed to access {path}: {message}")]
    Io {
        /// File or directory involved.
        path: Utf8PathBuf,
        /// Underlying cause.
        message: String,
    },
    /// The file exists but is not valid TOML.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Offending file.
        path: Utf8PathBuf,
        /// Underlying cause.
        message: String,
    },
    /// The TOML parsed but a credential entry has the wrong shape.
    #[error("invalid configuration in {path}: {message}")]
    InvalidStructure {
        /// Offending file.
        path: Utf8PathBuf,
        /// Underlying cause.
        message: String,
    },
    /// Raised when the secret key to store is blank.
    #[error("secret key must not be empty")]
    EmptySecretKey,
}

/// Stored provider credentials as read back from disk.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoredCredentials {
    /// Saved secret key.
    pub secret_key: Option<String>,
    /// Saved project identifier.
    pub project_id: Option<String>,
}

/// Reads and saves provider credentials; `berth auth` takes this as a seam.
pub trait ConfigWriter {
    /// Returns the credentials currently saved, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when the configuration file cannot be
    /// accessed or parsed.
    fn stored_credentials(&self) -> Result<StoredCredentials, ConfigStoreError>;

    /// Saves the secret key and, when given, the project identifier. Other
    /// keys already in the file are preserved.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigStoreError`] when the key is blank or when reading or
    /// updating configuration content fails.
    fn write_credentials(
        &self,
        secret_key: &str,
        project_id: Option<&str>,
    ) -> Result<Utf8PathBuf, ConfigStoreError>;
}

/// Updates `berth.toml` using `OrthoConfig`'s discovery search order.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    discovery: ConfigDiscovery,
}

impl ConfigStore {
    /// Builds a config store using the standard discovery settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            discovery: ConfigDiscovery::builder(APP_NAME)
                .env_var(CONFIG_ENV_VAR)
                .config_file_name(CONFIG_FILE_NAME)
                .dotfile_name(DOTFILE_NAME)
                .project_file_name(PROJECT_FILE_NAME)
                .build(),
        }
    }

    /// Builds a config store using an explicit discovery configuration.
    #[must_use]
    pub const fn with_discovery(discovery: ConfigDiscovery) -> Self {
        Self { discovery }
    }

    /// Picks the first discovered file that exists, or the last candidate
    /// when none do.
    fn locate(&self) -> Result<CredentialFile, ConfigStoreError> {
        let candidates = self.discovery.utf8_candidates();
        for candidate in &candidates {
            if file_exists(candidate)? {
                return CredentialFile::load(candidate.clone());
            }
        }
        candidates
            .last()
            .cloned()
            .map(CredentialFile::empty)
            .ok_or(ConfigStoreError::NoCandidates)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigWriter for ConfigStore {
    fn stored_credentials(&self) -> Result<StoredCredentials, ConfigStoreError> {
        let file = self.locate()?;
        Ok(StoredCredentials {
            secret_key: file.string(SECRET_KEY)?,
            project_id: file.string(PROJECT_ID_KEY)?,
        })
    }

    fn write_credentials(
        &self,
        secret_key: &str,
        project_id: Option<&str>,
    ) -> Result<Utf8PathBuf, ConfigStoreError> {
        if secret_key.trim().is_empty() {
            return Err(ConfigStoreError::EmptySecretKey);
        }
        let mut file = self.locate()?;
        file.set(SECRET_KEY, secret_key);
        if let Some(project) = project_id.filter(|id| !id.trim().is_empty()) {
            file.set(PROJECT_ID_KEY, project);
        }
        file.save()?;
        Ok(file.path)
    }
}

/// A credentials file and its top-level table.
#[derive(Debug)]
struct CredentialFile {
    path: Utf8PathBuf,
    table: toml::value::Table,
}

impl CredentialFile {
    fn empty(path: Utf8PathBuf) -> Self {
        Self {
            path,
            table: toml::value::Table::new(),
        }
    }

    fn load(path: Utf8PathBuf) -> Result<Self, ConfigStoreError> {
        let (dir, name) = open_parent(&path)?;
        let contents = dir
            .read_to_string(name)
            .map_err(|err| io_error(&path, &err))?;
        Self::parse(path, &contents)
    }

    fn parse(path: Utf8PathBuf, contents: &str) -> Result<Self, ConfigStoreError> {
        if contents.trim().is_empty() {
            return Ok(Self::empty(path));
        }
        let value: toml::Value =
            toml::from_str(contents).map_err(|err| ConfigStoreError::Parse {
                path: path.clone(),
                message: err.to_string(),
            })?;
        match value {
            toml::Value::Table(table) => Ok(Self { path, table }),
            _ => Err(ConfigStoreError::InvalidStructure {
                path,
                message: String::from("configuration root is not a table"),
            }),
        }
    }

    fn string(&self, key: &str) -> Result<Option<String>, ConfigStoreError> {
        let Some(raw) = self.table.get(key) else {
            return Ok(None);
        };
        raw.as_str()
            .map(|text| Some(text.trim().to_owned()))
            .ok_or_else(|| ConfigStoreError::InvalidStructure {
                path: self.path.clone(),
                message: format!("{key} must be a string"),
            })
    }

    fn set(&mut self, key: &str, text: &str) {
        self.table
            .insert(key.to_owned(), toml::Value::String(text.trim().to_owned()));
    }

    fn save(&self) -> Result<(), ConfigStoreError> {
        let parent = parent_of(&self.path);
        Dir::create_ambient_dir_all(parent, ambient_authority())
            .map_err(|err| io_error(parent, &err))?;
        let rendered =
            toml::to_string_pretty(&self.table).map_err(|err| ConfigStoreError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        let (dir, name) = open_parent(&self.path)?;
        dir.write(name, rendered)
            .map_err(|err| io_error(&self.path, &err))
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> ConfigStoreError {
    ConfigStoreError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn parent_of(path: &Utf8Path) -> &Utf8Path {
    path.parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."))
}

fn open_parent(path: &Utf8Path) -> Result<(Dir, &str), ConfigStoreError> {
    let name = path
        .file_name()
        .ok_or_else(|| ConfigStoreError::InvalidStructure {
            path: path.to_path_buf(),
            message: String::from("configuration file path is missing a filename"),
        })?;
    let parent = parent_of(path);
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| io_error(parent, &err))?;
    Ok((dir, name))
}

fn file_exists(path: &Utf8Path) -> Result<bool, ConfigStoreError> {
    match open_parent(path) {
        Ok((dir, name)) => dir.try_exists(name).map_err(|err| io_error(path, &err)),
        Err(ConfigStoreError::Io { .. }) if !parent_of(path).exists() => Ok(false),
        Err(err) => Err(err),
    }
}
