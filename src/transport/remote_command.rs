//! Shell command builders for remote file-system operations.
//!
//! Every path and payload is quoted with `shell-escape` so values containing
//! spaces, single quotes, or newlines survive the trip through the remote
//! login shell unchanged.

use std::borrow::Cow;

use camino::Utf8Path;
use shell_escape::unix::escape;

/// Quotes a single shell word.
#[must_use]
pub fn quote(value: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(value))
}

/// Quotes a remote path.
#[must_use]
pub fn quote_path(path: &Utf8Path) -> Cow<'_, str> {
    quote(path.as_str())
}

/// Builds `mkdir -p` for one or more remote directories.
#[must_use]
pub fn mkdir_command<'a>(paths: impl IntoIterator<Item = &'a Utf8Path>, sudo: bool) -> String {
    let mut command = String::from(if sudo { "sudo mkdir -p" } else { "mkdir -p" });
    for path in paths {
        command.push(' ');
        command.push_str(&quote_path(path));
    }
    command
}

/// Builds a command that writes `content` verbatim to `path` through
/// `sudo tee`. The payload travels as a single quoted `printf` argument so
/// embedded quotes and newlines are preserved byte for byte.
#[must_use]
pub fn write_file_command(path: &Utf8Path, content: &str) -> String {
    format!(
        "printf '%s' {} | sudo tee {} > /dev/null",
        quote(content),
        quote_path(path)
    )
}
