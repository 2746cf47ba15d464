//! Error types for the remote session transport.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Reasons an SSH authentication attempt can fail.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AuthFailure {
    /// The private key file could not be read from disk.
    #[error("failed to read SSH key {path}: {message}")]
    KeyUnreadable {
        /// Path of the key that was requested.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// The private key file was read but is not a usable private key.
    #[error("failed to parse SSH key {path}: {message}")]
    KeyUnparsable {
        /// Path of the key that was requested.
        path: Utf8PathBuf,
        /// Parser or libssh2 error string.
        message: String,
    },
    /// The server refused the offered key.
    #[error("server rejected key {path} for user {user}: {message}")]
    Rejected {
        /// Path of the key that was offered.
        path: Utf8PathBuf,
        /// Remote user the key was offered for.
        user: String,
        /// Error string reported by libssh2.
        message: String,
    },
}

/// Errors raised by [`crate::transport::RemoteShell`] implementations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TransportError {
    /// Raised when the private key cannot be used to authenticate.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthFailure),
    /// Raised when the TCP dial or SSH handshake does not complete.
    #[error("network unavailable for {address}: {message}")]
    NetworkUnavailable {
        /// `host:port` that was dialled.
        address: String,
        /// Underlying error string.
        message: String,
    },
    /// Raised when an operation is attempted on a closed session.
    #[error("session to {address} is not connected")]
    NotConnected {
        /// `host:port` of the session.
        address: String,
    },
    /// Raised when a remote command exits with a non-zero status.
    #[error("command `{command}` failed with exit status {exit_status}\nOutput: {output}")]
    CommandFailed {
        /// Command text sent to the remote shell.
        command: String,
        /// Exit status reported by the remote side.
        exit_status: i32,
        /// Combined standard output and error captured from the command.
        output: String,
    },
    /// Raised when a logical channel cannot be opened or driven.
    #[error("channel error during {action}: {message}")]
    Channel {
        /// Operation being attempted on the channel.
        action: String,
        /// libssh2 error string.
        message: String,
    },
    /// Raised when the push-file protocol or local file access fails.
    #[error("transfer of {local} to {remote} failed: {message}")]
    Transfer {
        /// Local source path.
        local: Utf8PathBuf,
        /// Remote destination path.
        remote: Utf8PathBuf,
        /// Human-readable failure description.
        message: String,
    },
    /// Raised when the caller cancels an interactive command.
    #[error("remote command `{command}` cancelled")]
    Cancelled {
        /// Command that was running when cancellation fired.
        command: String,
    },
}

impl TransportError {
    pub(crate) fn channel(action: &str, err: &(impl ToString + ?Sized)) -> Self {
        Self::Channel {
            action: action.to_owned(),
            message: err.to_string(),
        }
    }

    /// Returns the captured remote output when the error carries one.
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { output, .. } => Some(output.as_str()),
            _ => None,
        }
    }
}
