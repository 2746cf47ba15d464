//! Unit tests for the deploy pipeline.

use rstest::{fixture, rstest};

use super::*;
use crate::project::ProjectDescriptor;
use crate::test_support::{FakeRemote, StubBuilder};

const SERVICE_YAML: &str = r"
name: api
server: { name: api-server, zone: fr-par-1, type: DEV1-S, image: ubuntu_jammy }
build: { entry: api, output: app }
deploy:
  remote_path: /opt/apps/api
  service_name: api
";

const STATIC_YAML: &str = r"
name: site
server: { name: site-server, zone: fr-par-1, type: DEV1-S, image: ubuntu_jammy }
build: { command: npm run build, output: dist }
deploy: { remote_path: /var/www/site, kind: static }
";

fn plan(yaml: &str) -> DeploymentPlan {
    ProjectDescriptor::from_yaml(yaml)
        .expect("descriptor")
        .deployment_plan()
}

#[fixture]
fn service_plan() -> DeploymentPlan {
    plan(SERVICE_YAML)
}

#[fixture]
fn remote() -> FakeRemote {
    let remote = FakeRemote::new();
    remote.respond("systemctl is-active", "active\n");
    remote
}

#[rstest]
#[tokio::test]
async fn binary_deploy_runs_every_stage(service_plan: DeploymentPlan, remote: FakeRemote) {
    let builder = StubBuilder::binary(b"v2");

    let report = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect("deploy");

    assert_eq!(report.stages.len(), 6);
    assert_eq!(report.installed, Utf8PathBuf::from("/opt/apps/api/app"));
    assert_eq!(report.status.as_deref(), Some("active"));
    let installed = remote.file("/opt/apps/api/app").expect("binary installed");
    assert_eq!(installed.contents, b"v2");
    assert!(installed.executable);
    assert_eq!(remote.paths().len(), 2, "binary and unit only, no staging leftovers");
}

#[rstest]
#[tokio::test]
async fn binary_upload_goes_through_user_writable_scratch(
    service_plan: DeploymentPlan,
    remote: FakeRemote,
) {
    remote.restrict_uploads_to(SCRATCH_DIRECTORY);
    let builder = StubBuilder::binary(b"v2");

    Deployer::new(&remote, &builder, &service_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect("deploy as a non-root login");

    let installed = remote.file("/opt/apps/api/app").expect("binary installed");
    assert_eq!(installed.contents, b"v2");
    let activation = remote
        .commands()
        .into_iter()
        .find(|command| command.contains("setcap"))
        .expect("activation command");
    assert!(activation.starts_with("sudo mv /tmp/berth-"));
}

#[rstest]
#[tokio::test]
async fn stop_failure_is_tolerated(service_plan: DeploymentPlan, remote: FakeRemote) {
    remote.fail("systemctl stop", 5, "Failed to stop api.service: Unit api.service not loaded.");
    let builder = StubBuilder::binary(b"v1");

    let report = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect("first deploy proceeds");

    assert_eq!(report.status.as_deref(), Some("active"));
    assert!(remote.position("systemctl start api").is_some());
}

#[rstest]
#[tokio::test]
async fn build_failure_never_touches_the_host(service_plan: DeploymentPlan, remote: FakeRemote) {
    let builder = StubBuilder::failing();

    let err = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect_err("build fails");

    assert!(matches!(err, DeployError::Build(BuildError::Failed { .. })));
    assert!(remote.commands().is_empty());
}

#[rstest]
#[tokio::test]
async fn interrupted_upload_keeps_previous_binary(
    service_plan: DeploymentPlan,
    remote: FakeRemote,
) {
    remote.seed_file("/opt/apps/api/app", b"previous release", true);
    remote.fail_uploads_after(3);
    let builder = StubBuilder::binary(b"next release");

    let err = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect_err("upload fails");

    assert!(matches!(
        err,
        DeployError::Stage {
            stage: DeployStage::Upload,
            source: TransportError::Transfer { .. }
        }
    ));
    let live = remote.file("/opt/apps/api/app").expect("previous binary kept");
    assert_eq!(live.contents, b"previous release");
    assert_eq!(remote.paths(), vec![Utf8PathBuf::from("/opt/apps/api/app")]);
    assert_eq!(remote.position("systemctl start"), None);
}

#[rstest]
#[tokio::test]
async fn failed_activation_removes_staged_copy(service_plan: DeploymentPlan, remote: FakeRemote) {
    remote.seed_file("/opt/apps/api/app", b"previous release", true);
    remote.fail("setcap", 1, "setcap: command not found");
    let builder = StubBuilder::binary(b"next release");

    let err = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect_err("activation fails");

    assert!(matches!(
        err,
        DeployError::Stage {
            stage: DeployStage::Upload,
            ..
        }
    ));
    assert_eq!(remote.paths(), vec![Utf8PathBuf::from("/opt/apps/api/app")]);
}

#[rstest]
#[tokio::test]
async fn inactive_service_reports_journal(service_plan: DeploymentPlan, remote: FakeRemote) {
    remote.fail("systemctl is-active", 3, "failed\n");
    remote.respond("journalctl", "api[42]: bind: address already in use\n");
    let builder = StubBuilder::binary(b"v2");

    let err = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect_err("unhealthy");

    let DeployError::Unhealthy {
        service,
        status,
        journal,
    } = err
    else {
        panic!("expected an unhealthy service");
    };
    assert_eq!(service, "api");
    assert_eq!(status, "failed");
    assert!(journal.contains("address already in use"));
    assert!(remote.position("journalctl -u api -n 10 --no-pager").is_some());
}

#[rstest]
#[tokio::test]
async fn unreadable_journal_still_reports_failure(
    service_plan: DeploymentPlan,
    remote: FakeRemote,
) {
    remote.fail("systemctl is-active", 3, "inactive\n");
    remote.fail("journalctl", 1, "No journal files were found.");
    let builder = StubBuilder::binary(b"v2");

    let err = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect_err("unhealthy");

    assert!(matches!(
        err,
        DeployError::Unhealthy { ref status, ref journal, .. }
            if status == "inactive" && journal.starts_with("(journal unavailable")
    ));
}

#[rstest]
#[tokio::test]
async fn static_deploy_never_manages_a_service(remote: FakeRemote) {
    let static_plan = plan(STATIC_YAML);
    let builder = StubBuilder::tree(&[("index.html", "<h1>hi</h1>"), ("css/site.css", "body{}")]);

    let report = Deployer::new(&remote, &builder, &static_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect("static deploy");

    assert_eq!(report.stages, vec![DeployStage::Build, DeployStage::Upload]);
    assert_eq!(report.status, None);
    assert!(remote.file("/var/www/site/index.html").is_some());
    assert!(remote.file("/var/www/site/css/site.css").is_some());
    assert!(remote.commands().iter().all(|command| !command.contains("systemctl")));
    let commands = remote.commands();
    let [install, cleanup] = commands.as_slice() else {
        panic!("expected install and cleanup, got {commands:?}");
    };
    assert!(install.starts_with("sudo mkdir -p /var/www/site && sudo cp -R /tmp/berth-"));
    assert!(install.ends_with(
        "sudo chown -R app:app /var/www/site && sudo chmod -R u=rwX,go=rX /var/www/site"
    ));
    assert!(cleanup.starts_with("rm -rf /tmp/berth-"));
    assert!(
        remote
            .paths()
            .iter()
            .all(|path| path.starts_with("/var/www/site")),
        "scratch tree removed"
    );
}

#[rstest]
#[tokio::test]
async fn static_upload_goes_through_user_writable_scratch(remote: FakeRemote) {
    remote.restrict_uploads_to(SCRATCH_DIRECTORY);
    let static_plan = plan(STATIC_YAML);
    let builder = StubBuilder::tree(&[("index.html", "<h1>hi</h1>")]);

    Deployer::new(&remote, &builder, &static_plan)
        .deploy(&CancellationToken::new())
        .await
        .expect("static deploy as a non-root login");

    assert_eq!(
        remote.file("/var/www/site/index.html").map(|file| file.text()),
        Some(String::from("<h1>hi</h1>"))
    );
}

#[rstest]
#[tokio::test]
async fn cancellation_interrupts_a_stalled_upload(
    service_plan: DeploymentPlan,
    remote: FakeRemote,
) {
    remote.seed_file("/opt/apps/api/app", b"previous release", true);
    remote.hold_uploads();
    let builder = StubBuilder::binary(b"next release");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&cancel)
        .await
        .expect_err("cancelled");

    assert!(matches!(
        err,
        DeployError::Cancelled {
            stage: DeployStage::Upload
        }
    ));
    assert!(remote.position("sudo rm -f /tmp/berth-").is_some());
    assert_eq!(remote.paths(), vec![Utf8PathBuf::from("/opt/apps/api/app")]);
}

#[rstest]
#[tokio::test]
async fn cancellation_interrupts_a_hanging_remote_command(
    service_plan: DeploymentPlan,
    remote: FakeRemote,
) {
    remote.hold("systemctl start");
    let builder = StubBuilder::binary(b"v2");
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&cancel)
        .await
        .expect_err("cancelled");

    assert!(matches!(
        err,
        DeployError::Cancelled {
            stage: DeployStage::Start
        }
    ));
    assert_eq!(remote.position("systemctl is-active"), None);
}

#[rstest]
#[tokio::test]
async fn cancelled_deploy_stops_before_build(service_plan: DeploymentPlan, remote: FakeRemote) {
    let builder = StubBuilder::binary(b"v2");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = Deployer::new(&remote, &builder, &service_plan)
        .deploy(&cancel)
        .await
        .expect_err("cancelled");

    assert!(matches!(
        err,
        DeployError::Cancelled {
            stage: DeployStage::Build
        }
    ));
    assert_eq!(builder.builds(), 0);
}

#[test]
fn staging_path_sits_beside_the_installed_binary() {
    let staged = staging_path(Utf8Path::new("/opt/apps/api/app"));

    assert_eq!(staged.parent(), Some(Utf8Path::new("/opt/apps/api")));
    let name = staged.file_name().expect("file name");
    assert!(name.starts_with(".app."));
    assert!(name.ends_with(".partial"));
    assert_ne!(staged, staging_path(Utf8Path::new("/opt/apps/api/app")));
}

#[test]
fn scratch_paths_are_unique_under_tmp() {
    let first = scratch_path("app");

    assert_eq!(first.parent(), Some(Utf8Path::new(SCRATCH_DIRECTORY)));
    let name = first.file_name().expect("file name");
    assert!(name.starts_with("berth-"));
    assert!(name.ends_with("-app"));
    assert_ne!(first, scratch_path("app"));
}

#[test]
fn activation_moves_from_scratch_first_and_renames_last() {
    let command = activate_binary_command(
        Utf8Path::new("/tmp/berth-1-app"),
        Utf8Path::new("/opt/api/.app.1.partial"),
        Utf8Path::new("/opt/api/app"),
        "app",
    );

    assert!(command.starts_with("sudo mv /tmp/berth-1-app /opt/api/.app.1.partial && "));
    assert!(command.ends_with("&& sudo mv /opt/api/.app.1.partial /opt/api/app"));
    assert!(command.contains("setcap 'cap_net_bind_service=+ep' /opt/api/.app.1.partial"));
}
