//! Wire types for the Scaleway Instances and IAM endpoints.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::cloud::{Instance, OperationStatus, SshKey};

#[derive(Serialize)]
pub(super) struct CreateServerRequest<'a> {
    pub(super) name: &'a str,
    pub(super) commercial_type: &'a str,
    pub(super) image: &'a str,
    pub(super) project: &'a str,
    pub(super) routed_ip_enabled: bool,
    pub(super) dynamic_ip_required: bool,
    pub(super) tags: Vec<String>,
}

#[derive(Serialize)]
pub(super) struct ActionRequest<'a> {
    pub(super) action: &'a str,
}

#[derive(Deserialize)]
pub(super) struct ServerEnvelope {
    pub(super) server: ServerBody,
}

#[derive(Deserialize)]
pub(super) struct ServerList {
    #[serde(default)]
    pub(super) servers: Vec<ServerBody>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ServerBody {
    pub(super) id: String,
    pub(super) name: String,
    pub(super) state: String,
    #[serde(default)]
    pub(super) commercial_type: String,
    #[serde(default)]
    pub(super) public_ip: Option<PublicIp>,
    #[serde(default)]
    pub(super) public_ips: Vec<PublicIp>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct PublicIp {
    pub(super) address: String,
}

impl ServerBody {
    pub(super) fn into_instance(self, zone: &str) -> Instance {
        let public_ip = self
            .public_ip
            .iter()
            .chain(self.public_ips.iter())
            .find_map(|ip| ip.address.parse::<IpAddr>().ok());
        Instance {
            id: self.id,
            name: self.name,
            zone: zone.to_owned(),
            state: self.state,
            instance_type: self.commercial_type,
            public_ip,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct TaskEnvelope {
    pub(super) task: Task,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct Task {
    pub(super) id: String,
    pub(super) status: String,
    #[serde(default)]
    pub(super) description: String,
}

impl Task {
    pub(super) fn status(&self) -> OperationStatus {
        match self.status.as_str() {
            "success" => OperationStatus::Succeeded,
            "failure" => OperationStatus::Failed {
                message: if self.description.is_empty() {
                    format!("task {} failed", self.id)
                } else {
                    format!("{} failed", self.description)
                },
            },
            _ => OperationStatus::Running,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct SshKeyList {
    #[serde(default)]
    pub(super) ssh_keys: Vec<SshKeyBody>,
}

#[derive(Deserialize)]
pub(super) struct SshKeyBody {
    pub(super) id: String,
    pub(super) name: String,
    #[serde(default)]
    pub(super) fingerprint: String,
    #[serde(default)]
    pub(super) public_key: String,
}

impl From<SshKeyBody> for SshKey {
    fn from(value: SshKeyBody) -> Self {
        Self {
            id: value.id,
            name: value.name,
            fingerprint: value.fingerprint,
            public_key: value.public_key,
        }
    }
}
