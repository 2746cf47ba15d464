//! Unit tests for local builds.

use std::collections::BTreeMap;
use std::time::Duration;

use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::project::Architecture;

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn workspace() -> Workspace {
    let dir = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    Workspace { _dir: dir, root }
}

fn static_build(command: &str) -> StaticBuild {
    StaticBuild {
        command: command.to_owned(),
        dir: Utf8PathBuf::from("."),
        output: Utf8PathBuf::from("dist"),
    }
}

#[rstest]
#[case(Architecture::X86_64, "x86_64-unknown-linux-musl")]
#[case(Architecture::Arm64, "aarch64-unknown-linux-musl")]
fn cargo_command_targets_server_architecture(
    #[case] architecture: Architecture,
    #[case] triple: &str,
) {
    let builder = LocalBuilder::new("/src/api");
    let build = BinaryBuild {
        entry: String::from("api"),
        output: String::from("app"),
        architecture,
        link_flags: vec![String::from("-C"), String::from("strip=symbols")],
        env: BTreeMap::from([(String::from("SQLX_OFFLINE"), String::from("true"))]),
    };

    let command = builder.cargo_command(&build);

    assert_eq!(
        command.to_string(),
        format!("cargo build --release --target {triple} --bin api")
    );
    assert_eq!(
        command.env,
        vec![
            (String::from("RUSTFLAGS"), String::from("-C strip=symbols")),
            (String::from("SQLX_OFFLINE"), String::from("true")),
        ]
    );
    assert_eq!(command.dir, Utf8PathBuf::from("/src/api"));
}

#[test]
fn cargo_command_omits_empty_rustflags() {
    let builder = LocalBuilder::new("/src/api");
    let build = BinaryBuild {
        entry: String::from("api"),
        output: String::from("api"),
        architecture: Architecture::X86_64,
        link_flags: Vec::new(),
        env: BTreeMap::new(),
    };

    assert!(builder.cargo_command(&build).env.is_empty());
}

#[rstest]
#[tokio::test]
async fn static_build_returns_output_directory_in_place(workspace: Workspace) {
    let builder = LocalBuilder::new(workspace.root.clone());
    let artifact = ArtifactKind::StaticTree {
        build: static_build("mkdir -p dist && echo hi > dist/index.html"),
    };

    let output = builder
        .build(&artifact, &CancellationToken::new())
        .await
        .expect("static build");

    assert_eq!(output.path(), workspace.root.join("./dist"));
    drop(output);
    assert!(workspace.root.join("dist/index.html").exists());
}

#[rstest]
#[tokio::test]
async fn failing_command_reports_exit_code(workspace: Workspace) {
    let builder = LocalBuilder::new(workspace.root.clone());
    let artifact = ArtifactKind::StaticTree {
        build: static_build("exit 3"),
    };

    let err = builder
        .build(&artifact, &CancellationToken::new())
        .await
        .expect_err("build fails");

    assert!(matches!(err, BuildError::Failed { code: Some(3), .. }));
}

#[rstest]
#[tokio::test]
async fn missing_output_is_reported(workspace: Workspace) {
    let builder = LocalBuilder::new(workspace.root.clone());
    let artifact = ArtifactKind::StaticTree {
        build: static_build("true"),
    };

    let err = builder
        .build(&artifact, &CancellationToken::new())
        .await
        .expect_err("no dist");

    assert!(matches!(err, BuildError::MissingOutput { .. }));
}

#[rstest]
#[tokio::test]
async fn cancellation_stops_a_running_build(workspace: Workspace) {
    let builder = LocalBuilder::new(workspace.root.clone());
    let artifact = ArtifactKind::StaticTree {
        build: static_build("sleep 30"),
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(10), builder.build(&artifact, &cancel))
        .await
        .expect("build returns promptly after cancel");

    assert!(matches!(result, Err(BuildError::Cancelled)));
}

#[test]
fn scoped_output_removes_scratch_on_drop() {
    let scratch = TempDir::new().expect("tempdir");
    let dir = scratch.path().to_path_buf();
    let path = Utf8PathBuf::from_path_buf(dir.join("app")).expect("utf8");

    let output = BuildOutput::scoped(path, scratch);
    assert!(dir.exists());
    drop(output);

    assert!(!dir.exists());
}
