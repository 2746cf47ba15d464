//! Local directory walking for tree uploads.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use super::TransportError;

/// Relative directories and files found beneath a local root.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TreePlan {
    /// Directories to create, parents before children.
    pub directories: Vec<Utf8PathBuf>,
    /// Regular files to transfer.
    pub files: Vec<Utf8PathBuf>,
}

impl TreePlan {
    /// Walks `root` and records every directory and regular file relative to
    /// it. Entries are sorted so repeated walks produce the same plan.
    ///
    /// Symlinks to regular files are uploaded as the file they point at.
    /// Any other symlink or special file is skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Transfer`] when the root is missing or a
    /// directory cannot be read.
    pub fn scan(root: &Utf8Path, remote_root: &Utf8Path) -> Result<Self, TransportError> {
        if !root.is_dir() {
            return Err(transfer_error(root, remote_root, "not a directory"));
        }

        let mut plan = Self::default();
        let mut pending = vec![Utf8PathBuf::new()];
        while let Some(relative) = pending.pop() {
            let dir = root.join(&relative);
            let mut entries = dir
                .read_dir_utf8()
                .map_err(|err| transfer_error(&dir, remote_root, &err))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| transfer_error(&dir, remote_root, &err))?;
            entries.sort_by(|lhs, rhs| lhs.file_name().cmp(rhs.file_name()));

            for entry in entries {
                let child = relative.join(entry.file_name());
                let file_type = entry
                    .file_type()
                    .map_err(|err| transfer_error(entry.path(), remote_root, &err))?;
                if file_type.is_dir() {
                    plan.directories.push(child.clone());
                    pending.push(child);
                } else if file_type.is_file()
                    || (file_type.is_symlink() && entry.path().is_file())
                {
                    plan.files.push(child);
                } else {
                    warn!(path = %entry.path(), "skipping entry that is not a regular file or directory");
                }
            }
        }

        plan.directories.sort();
        plan.files.sort();
        Ok(plan)
    }
}

fn transfer_error(
    local: &Utf8Path,
    remote: &Utf8Path,
    err: &(impl ToString + ?Sized),
) -> TransportError {
    TransportError::Transfer {
        local: local.to_path_buf(),
        remote: remote.to_path_buf(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn utf8_root(tmp: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()))
    }

    #[test]
    fn scan_lists_nested_directories_and_files() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = utf8_root(&tmp);
        fs::create_dir_all(root.join("assets/css")).expect("create dirs");
        fs::write(root.join("index.html"), "<html/>").expect("write index");
        fs::write(root.join("assets/css/site.css"), "body{}").expect("write css");

        let plan = TreePlan::scan(&root, Utf8Path::new("/srv/site")).expect("scan");

        assert_eq!(
            plan.directories,
            vec![Utf8PathBuf::from("assets"), Utf8PathBuf::from("assets/css")]
        );
        assert_eq!(
            plan.files,
            vec![
                Utf8PathBuf::from("assets/css/site.css"),
                Utf8PathBuf::from("index.html")
            ]
        );
    }

    #[test]
    fn scan_rejects_missing_root() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let missing = utf8_root(&tmp).join("absent");

        let err = TreePlan::scan(&missing, Utf8Path::new("/srv/site")).expect_err("missing");

        let TransportError::Transfer { message, .. } = err else {
            panic!("expected a transfer error, got {err:?}");
        };
        assert_eq!(message, "not a directory");
    }

    #[test]
    fn scan_follows_file_links_and_skips_directory_links() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = utf8_root(&tmp);
        fs::create_dir_all(root.join("assets")).expect("create dirs");
        fs::write(root.join("assets/app.js"), "run()").expect("write js");
        std::os::unix::fs::symlink(root.join("assets/app.js"), root.join("latest.js"))
            .expect("link file");
        std::os::unix::fs::symlink(root.join("assets"), root.join("mirror")).expect("link dir");
        std::os::unix::fs::symlink(root.join("gone"), root.join("dangling")).expect("link missing");

        let plan = TreePlan::scan(&root, Utf8Path::new("/srv/site")).expect("scan");

        assert_eq!(plan.directories, vec![Utf8PathBuf::from("assets")]);
        assert_eq!(
            plan.files,
            vec![
                Utf8PathBuf::from("assets/app.js"),
                Utf8PathBuf::from("latest.js")
            ]
        );
    }
}
