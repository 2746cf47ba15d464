//! Following the service journal ends cleanly on interrupt.

use std::time::Duration;

use berth::test_support::FakeRemote;
use berth::unit::journal_command;
use berth::{RemoteShell, TransportError};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn follow_runs_until_cancelled() {
    let remote = FakeRemote::new();
    remote.hold_interactive();
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let command = journal_command("api", 50, true);
    let result = remote.run_interactive(&command, &cancel).await;

    assert!(matches!(result, Err(TransportError::Cancelled { .. })));
    assert_eq!(
        remote.interactive_commands(),
        vec![String::from("sudo journalctl -u api -n 50 --no-pager -f")]
    );
}

#[tokio::test]
async fn bounded_tail_returns_without_cancellation() {
    let remote = FakeRemote::new();

    remote
        .run_interactive(&journal_command("api", 10, false), &CancellationToken::new())
        .await
        .expect("tail completes");

    assert_eq!(remote.shells_opened(), 0);
    assert_eq!(remote.interactive_commands().len(), 1);
}
