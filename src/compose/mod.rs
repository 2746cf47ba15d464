//! Container-compose rendering for the sidecar services.
//!
//! Output is deterministic: services follow [`ServicesSection::enabled`]
//! order and environment entries follow key order. Scalars are encoded by
//! `serde_yaml`, so values such as `"true"` or `"5432"` stay strings.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::project::{ServiceSpec, ServicesSection};
use crate::transport::remote_command::quote_path;

/// Directory under the install path holding the compose file.
pub const COMPOSE_DIRECTORY: &str = "services";

/// Compose file name.
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Named volume owned by each stateful well-known service.
const STATEFUL_VOLUMES: [(&str, &str); 3] = [
    ("postgres", "pgdata"),
    ("typesense", "typesense-data"),
    ("redis", "redis-data"),
];

/// Remote path of the compose file for an install directory.
#[must_use]
pub fn compose_path(remote_path: &Utf8Path) -> Utf8PathBuf {
    remote_path.join(COMPOSE_DIRECTORY).join(COMPOSE_FILE)
}

/// Command that starts (or reconciles) the sidecars described by the file at
/// `path`.
#[must_use]
pub fn up_command(path: &Utf8Path) -> String {
    format!("sudo docker compose -f {} up -d", quote_path(path))
}

/// Errors raised while rendering a compose file.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// No sidecar service is enabled, so there is nothing to render.
    #[error("no sidecar service is enabled")]
    NothingEnabled,
    /// The YAML encoder rejected the document.
    #[error("failed to encode compose file: {0}")]
    Encode(#[from] serde_yaml::Error),
}

/// Top-level compose document.
#[derive(Debug, Serialize)]
struct ComposeFile<'a> {
    services: Ordered<'a, ComposeService<'a>>,
    #[serde(skip_serializing_if = "Ordered::is_empty")]
    volumes: Ordered<'a, NamedVolume>,
}

#[derive(Debug, Serialize)]
struct ComposeService<'a> {
    image: &'a str,
    restart: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<&'a str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<&'a str, &'a str>,
}

impl<'a> ComposeService<'a> {
    fn from_spec(spec: &'a ServiceSpec) -> Self {
        Self {
            image: &spec.image,
            restart: "always",
            command: spec.command.as_deref(),
            ports: spec
                .port
                .map(|port| format!("{port}:{port}"))
                .into_iter()
                .collect(),
            volumes: spec.volumes.iter().map(String::as_str).collect(),
            environment: spec
                .env
                .iter()
                .map(|(variable, value)| (variable.as_str(), value.as_str()))
                .collect(),
        }
    }
}

/// Volume declared with the engine defaults.
#[derive(Debug, Serialize)]
struct NamedVolume {}

/// Mapping that keeps insertion order on the wire.
#[derive(Debug)]
struct Ordered<'a, V>(Vec<(&'a str, V)>);

impl<V> Ordered<'_, V> {
    const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<V: Serialize> Serialize for Ordered<'_, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Renders the compose definition for every enabled service.
///
/// # Errors
///
/// Returns [`ComposeError::NothingEnabled`] when no service is enabled and
/// [`ComposeError::Encode`] when serialization fails.
pub fn render_compose(services: &ServicesSection) -> Result<String, ComposeError> {
    let enabled = services.enabled();
    if enabled.is_empty() {
        return Err(ComposeError::NothingEnabled);
    }

    let document = ComposeFile {
        services: Ordered(
            enabled
                .iter()
                .map(|&(name, spec)| (name, ComposeService::from_spec(spec)))
                .collect(),
        ),
        volumes: Ordered(
            named_volumes(&enabled)
                .into_iter()
                .map(|volume| (volume, NamedVolume {}))
                .collect(),
        ),
    };
    Ok(serde_yaml::to_string(&document)?)
}

/// Volume declarations: the fixed volume of every enabled stateful
/// well-known service, then any other named volume a service mounts.
fn named_volumes<'a>(enabled: &[(&'a str, &'a ServiceSpec)]) -> Vec<&'a str> {
    let mut volumes: Vec<&'a str> = Vec::new();
    let mut add = |volume: &'a str| {
        if !volumes.contains(&volume) {
            volumes.push(volume);
        }
    };

    for &(name, _) in enabled {
        if let Some(&(_, volume)) = STATEFUL_VOLUMES.iter().find(|(owner, _)| *owner == name) {
            add(volume);
        }
    }
    for &(_, spec) in enabled {
        for mount in &spec.volumes {
            if let Some(source) = named_source(mount) {
                add(source);
            }
        }
    }
    volumes
}

/// Source of a `source:target` mount when it names a volume rather than a
/// host path.
fn named_source(mount: &str) -> Option<&str> {
    let (source, _) = mount.split_once(':')?;
    let is_path = source.is_empty()
        || source.starts_with('/')
        || source.starts_with('.')
        || source.starts_with('~')
        || source.starts_with('$');
    (!is_path).then_some(source)
}

#[cfg(test)]
mod tests;
