//! Remote session transport: one authenticated SSH connection multiplexing
//! short-lived command channels, interactive channels, shells, and file
//! pushes.
//!
//! The transport never retries. Pipelines decide per stage whether a
//! [`TransportError`] is fatal or advisory.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

mod error;
mod push;
pub mod remote_command;
mod ssh;
mod tree;

pub use error::{AuthFailure, TransportError};
pub use ssh::{CONNECT_TIMEOUT, SshSession};
pub use tree::TreePlan;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Connection details for a remote host. Immutable for the lifetime of a
/// session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTarget {
    /// Host name or IP address.
    pub host: String,
    /// TCP port of the SSH service.
    pub port: u16,
    /// Remote login user.
    pub user: String,
    /// Path to the private key used for authentication.
    pub key_path: Utf8PathBuf,
}

impl RemoteTarget {
    /// Creates a target on the default SSH port, expanding a leading `~/` in
    /// the key path.
    #[must_use]
    pub fn new(host: impl Into<String>, user: impl Into<String>, key_path: &str) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            key_path: Utf8PathBuf::from(expand_tilde(key_path)),
        }
    }

    /// Overrides the SSH port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Returns the `host:port` pair used for dialling.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.address())
    }
}

/// Command and file-transfer surface used by the provisioning and deploy
/// pipelines.
pub trait RemoteShell: Send + Sync {
    /// Runs `command` on a fresh channel and returns its combined standard
    /// output and error.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::CommandFailed`] when the command exits
    /// non-zero, carrying the captured output.
    fn run_command<'a>(&'a self, command: &'a str) -> TransportFuture<'a, String>;

    /// Runs `command` with its streams bound to the local terminal until it
    /// exits or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Cancelled`] when `cancel` fires first, or
    /// [`TransportError::CommandFailed`] on a non-zero exit.
    fn run_interactive<'a>(
        &'a self,
        command: &'a str,
        cancel: &'a CancellationToken,
    ) -> TransportFuture<'a, ()>;

    /// Opens an interactive login shell on a pseudo-terminal and blocks
    /// until it exits.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Channel`] when the PTY or shell request
    /// fails.
    fn open_shell(&self) -> TransportFuture<'_, ()>;

    /// Pushes a single local file to `remote`, creating the parent directory
    /// first. The write is not atomic.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Transfer`] when the local file cannot be
    /// read or the remote sink rejects the transfer.
    fn upload_file<'a>(&'a self, local: &'a Utf8Path, remote: &'a Utf8Path)
    -> TransportFuture<'a, ()>;

    /// Mirrors the local directory `local` into `remote`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while creating directories or pushing
    /// files.
    fn upload_tree<'a>(&'a self, local: &'a Utf8Path, remote: &'a Utf8Path)
    -> TransportFuture<'a, ()>;
}

/// Expands a leading `~/` prefix to the user's home directory.
///
/// If `HOME` is unset the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use berth::transport::expand_tilde;
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{rest}", home.to_string_lossy());
    }
    path.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("203.0.113.7", 22, "203.0.113.7:22")]
    #[case("2001:db8::1", 2222, "[2001:db8::1]:2222")]
    fn address_formats_ipv4_and_ipv6(#[case] host: &str, #[case] port: u16, #[case] expected: &str) {
        let target = RemoteTarget::new(host, "root", "/keys/id").with_port(port);
        assert_eq!(target.address(), expected);
    }

    #[test]
    fn display_includes_user() {
        let target = RemoteTarget::new("10.0.0.1", "deploy", "/keys/id");
        assert_eq!(target.to_string(), "deploy@10.0.0.1:22");
    }

    #[test]
    fn expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/etc/ssh/key"), "/etc/ssh/key");
    }
}
