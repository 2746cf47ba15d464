//! Scaleway Instances implementation of [`CloudApi`].
//!
//! Image resolution goes through `scaleway-rs`; server, task, and SSH key
//! calls use the REST endpoints directly so that action task identifiers are
//! available to the operation waiter.

mod image;
mod types;

use std::sync::LazyLock;
use std::time::Duration;

use reqwest::{RequestBuilder, StatusCode};
use scaleway_rs::{ScalewayApi, ScalewayApiError};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::cloud::{
    CloudApi, CloudError, CloudFuture, Instance, InstanceCreation, InstanceSpec, OperationStatus,
    PendingOperation, SshKey,
};
use crate::config::Credentials;
use crate::wait::OperationSource;
use types::{
    ActionRequest, CreateServerRequest, ServerBody, ServerEnvelope, ServerList, SshKeyList,
    TaskEnvelope,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
const IAM_API_BASE: &str = "https://api.scaleway.com/iam/v1alpha1";
const INSTANCE_TAG: &str = "berth";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Cloud provider backed by the Scaleway Instances API in a single zone.
#[derive(Clone)]
pub struct ScalewayCloud {
    api: ScalewayApi,
    secret_key: String,
    project_id: String,
    zone: String,
}

impl ScalewayCloud {
    /// Creates a provider scoped to `zone` using the loaded credentials.
    #[must_use]
    pub fn new(credentials: &Credentials, zone: impl Into<String>) -> Self {
        Self {
            api: ScalewayApi::new(&credentials.secret_key),
            secret_key: credentials.secret_key.clone(),
            project_id: credentials.project_id.clone(),
            zone: zone.into(),
        }
    }

    fn servers_url(&self) -> String {
        format!("{INSTANCE_API_BASE}/zones/{}/servers", self.zone)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        action: &str,
        request: RequestBuilder,
    ) -> Result<T, CloudError> {
        let response = request
            .header("X-Auth-Token", &self.secret_key)
            .send()
            .await
            .map_err(|err| CloudError::provider(action, &err))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| CloudError::provider(action, &err))?;

        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|err| CloudError::provider(action, &err));
        }
        Err(api_error(action, status, &body))
    }

    async fn find_server(&self, name: &str) -> Result<Option<ServerBody>, CloudError> {
        let list: ServerList = self
            .send(
                "list servers",
                HTTP_CLIENT
                    .get(self.servers_url())
                    .query(&[("name", name), ("project", self.project_id.as_str())]),
            )
            .await?;
        Ok(exact_match(list.servers, name))
    }

    async fn perform_action(
        &self,
        server_id: &str,
        action: &str,
    ) -> Result<PendingOperation, CloudError> {
        let envelope: TaskEnvelope = self
            .send(
                action,
                HTTP_CLIENT
                    .post(format!("{}/{server_id}/action", self.servers_url()))
                    .json(&ActionRequest { action }),
            )
            .await?;
        debug!(task = %envelope.task.id, action, "server action accepted");
        Ok(PendingOperation {
            operation_id: envelope.task.id,
            resource_id: server_id.to_owned(),
            zone: self.zone.clone(),
        })
    }
}

/// The name filter is a substring match, so keep only the exact hit.
fn exact_match(servers: Vec<ServerBody>, name: &str) -> Option<ServerBody> {
    servers.into_iter().find(|server| server.name == name)
}

fn api_error(action: &str, status: StatusCode, body: &[u8]) -> CloudError {
    let message = serde_json::from_slice::<ScalewayApiError>(body).map_or_else(
        |_| String::from_utf8_lossy(body).into_owned(),
        |api_err| api_err.message,
    );
    CloudError::Provider {
        action: action.to_owned(),
        message: format!("{status}: {message}"),
    }
}

impl OperationSource for ScalewayCloud {
    fn operation_status<'a>(
        &'a self,
        operation: &'a PendingOperation,
    ) -> CloudFuture<'a, OperationStatus> {
        Box::pin(async move {
            let envelope: TaskEnvelope = self
                .send(
                    "task status",
                    HTTP_CLIENT.get(format!(
                        "{INSTANCE_API_BASE}/zones/{}/tasks/{}",
                        operation.zone, operation.operation_id
                    )),
                )
                .await?;
            Ok(envelope.task.status())
        })
    }
}

impl CloudApi for ScalewayCloud {
    fn create_instance<'a>(&'a self, spec: &'a InstanceSpec) -> CloudFuture<'a, InstanceCreation> {
        Box::pin(async move {
            spec.validate()?;
            let image_id = self.resolve_image_id(spec).await?;
            let mut tags = vec![String::from(INSTANCE_TAG)];
            if !spec.ssh_keys.is_empty() {
                let registered = self.list_ssh_keys().await?;
                tags.extend(authorized_key_tags(&registered, &spec.ssh_keys)?);
            }
            let envelope: ServerEnvelope = self
                .send(
                    "create server",
                    HTTP_CLIENT
                        .post(format!("{INSTANCE_API_BASE}/zones/{}/servers", spec.zone))
                        .json(&CreateServerRequest {
                            name: &spec.name,
                            commercial_type: &spec.instance_type,
                            image: &image_id,
                            project: &self.project_id,
                            routed_ip_enabled: true,
                            dynamic_ip_required: true,
                            tags,
                        }),
                )
                .await?;
            let instance = envelope.server.into_instance(&spec.zone);
            let operation = self.perform_action(&instance.id, "poweron").await?;
            Ok(InstanceCreation {
                instance,
                operation,
            })
        })
    }

    fn get_instance<'a>(&'a self, name: &'a str) -> CloudFuture<'a, Option<Instance>> {
        Box::pin(async move {
            Ok(self
                .find_server(name)
                .await?
                .map(|server| server.into_instance(&self.zone)))
        })
    }

    fn delete_instance<'a>(&'a self, name: &'a str) -> CloudFuture<'a, PendingOperation> {
        Box::pin(async move {
            let server = self
                .find_server(name)
                .await?
                .ok_or_else(|| CloudError::NotFound {
                    kind: "instance",
                    name: name.to_owned(),
                })?;
            self.perform_action(&server.id, "terminate").await
        })
    }

    fn list_ssh_keys(&self) -> CloudFuture<'_, Vec<SshKey>> {
        Box::pin(async move {
            let list: SshKeyList = self
                .send(
                    "list ssh keys",
                    HTTP_CLIENT
                        .get(format!("{IAM_API_BASE}/ssh-keys"))
                        .query(&[("project_id", self.project_id.as_str()), ("per_page", "100")]),
                )
                .await?;
            Ok(list.ssh_keys.into_iter().map(SshKey::from).collect())
        })
    }
}

/// `AUTHORIZED_KEY` tags for the selected key identifiers. When a server
/// carries any such tag, Scaleway installs only those keys instead of every
/// key registered on the project. Spaces in the key become underscores.
fn authorized_key_tags(
    registered: &[SshKey],
    selected: &[String],
) -> Result<Vec<String>, CloudError> {
    selected
        .iter()
        .map(|id| {
            registered
                .iter()
                .find(|key| key.id == *id)
                .map(|key| format!("AUTHORIZED_KEY={}", key.public_key.trim().replace(' ', "_")))
                .ok_or_else(|| CloudError::NotFound {
                    kind: "SSH key",
                    name: id.clone(),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests;
