//! Init-system unit rendering and the `systemctl` commands that manage it.
//!
//! A unit is rendered from a [`ServiceUnitSpec`] into deterministic text:
//! the same spec always yields byte-identical output, with environment
//! entries in key order.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, instrument};

use crate::project::{DeploymentPlan, ServiceBinary};
use crate::transport::remote_command::{quote, write_file_command};
use crate::transport::{RemoteShell, TransportError};

/// Directory holding system unit files.
pub const UNIT_DIRECTORY: &str = "/etc/systemd/system";

/// Reloads unit definitions.
pub const DAEMON_RELOAD: &str = "sudo systemctl daemon-reload";

/// Journal lines fetched when a service fails its health check.
pub const FAILURE_JOURNAL_LINES: u32 = 10;

/// Everything needed to render one service unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceUnitSpec {
    /// `Description=` value.
    pub description: String,
    /// Account the process runs as.
    pub user: String,
    /// Group the process runs as.
    pub group: String,
    /// Working directory of the process.
    pub working_directory: Utf8PathBuf,
    /// Absolute path of the executable.
    pub executable: Utf8PathBuf,
    /// Arguments appended to the executable.
    pub args: Vec<String>,
    /// Process environment.
    pub environment: BTreeMap<String, String>,
}

impl ServiceUnitSpec {
    /// Builds the unit for the binary half of a deployment plan. The process
    /// runs as the plan's user and group from inside the install directory.
    #[must_use]
    pub fn from_plan(plan: &DeploymentPlan, service: &ServiceBinary) -> Self {
        Self {
            description: service.description.clone(),
            user: plan.user.clone(),
            group: plan.user.clone(),
            working_directory: plan.remote_path.clone(),
            executable: plan.remote_path.join(&service.file_name),
            args: service.args.clone(),
            environment: service.env.clone(),
        }
    }

    /// Renders the unit file text.
    #[must_use]
    pub fn render(&self) -> String {
        let mut exec_start = exec_word(self.executable.as_str());
        for arg in &self.args {
            exec_start.push(' ');
            exec_start.push_str(&exec_word(arg));
        }

        let mut unit = format!(
            "[Unit]\n\
             Description={description}\n\
             After=network.target docker.service\n\
             \n\
             [Service]\n\
             Type=simple\n\
             User={user}\n\
             Group={group}\n\
             WorkingDirectory={working_directory}\n\
             ExecStart={exec_start}\n\
             Restart=always\n\
             RestartSec=5\n",
            description = escape_specifiers(&single_line(&self.description)),
            user = self.user,
            group = self.group,
            working_directory = self.working_directory,
        );
        for (key, value) in &self.environment {
            unit.push_str("Environment=\"");
            unit.push_str(&environment_value(key, value));
            unit.push_str("\"\n");
        }
        unit.push_str("\n[Install]\nWantedBy=multi-user.target\n");
        unit
    }
}

fn single_line(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

fn escape_specifiers(value: &str) -> String {
    value.replace('%', "%%")
}

/// Escapes `KEY=value` for a double-quoted `Environment=` assignment.
fn environment_value(key: &str, value: &str) -> String {
    let mut escaped = String::with_capacity(key.len() + value.len() + 1);
    escaped.push_str(key);
    escaped.push('=');
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '%' => escaped.push_str("%%"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Quotes one `ExecStart=` word when it holds whitespace, quotes, or
/// specifier characters.
fn exec_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|ch| !ch.is_whitespace() && !matches!(ch, '"' | '\'' | '\\' | '%' | '$' | ';'));
    if plain {
        return word.to_owned();
    }
    let mut quoted = String::from("\"");
    for ch in word.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '%' => quoted.push_str("%%"),
            '$' => quoted.push_str("$$"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

/// Path of the unit file for `service`.
#[must_use]
pub fn unit_path(service: &str) -> Utf8PathBuf {
    Utf8Path::new(UNIT_DIRECTORY).join(format!("{service}.service"))
}

/// Builds `sudo systemctl <verb> <service>`.
#[must_use]
pub fn systemctl(verb: &str, service: &str) -> String {
    format!("sudo systemctl {verb} {}", quote(service))
}

/// Builds the health check; prints `active` and exits zero only when the
/// service is running.
#[must_use]
pub fn is_active_command(service: &str) -> String {
    format!("systemctl is-active {}", quote(service))
}

/// Builds a `journalctl` invocation for the unit's log.
#[must_use]
pub fn journal_command(service: &str, lines: u32, follow: bool) -> String {
    let mut command = format!(
        "sudo journalctl -u {} -n {lines} --no-pager",
        quote(service)
    );
    if follow {
        command.push_str(" -f");
    }
    command
}

/// Writes the unit file, reloads unit definitions, and enables the service
/// at boot.
///
/// # Errors
///
/// Returns the first [`TransportError`] raised by the remote host.
#[instrument(skip(shell, spec), fields(service = %service))]
pub async fn install_unit<S>(
    shell: &S,
    service: &str,
    spec: &ServiceUnitSpec,
) -> Result<(), TransportError>
where
    S: RemoteShell + ?Sized,
{
    let path = unit_path(service);
    shell
        .run_command(&write_file_command(&path, &spec.render()))
        .await?;
    shell.run_command(DAEMON_RELOAD).await?;
    shell.run_command(&systemctl("enable", service)).await?;
    debug!(path = %path, "unit installed");
    Ok(())
}
