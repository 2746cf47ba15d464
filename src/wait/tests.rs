//! Tests for the operation and reachability waiters.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Mutex;

use rstest::{fixture, rstest};

use super::*;

/// Returns scripted statuses in order, repeating `Running` once exhausted.
struct ScriptedStatus {
    statuses: Mutex<VecDeque<OperationStatus>>,
    queries: Mutex<usize>,
}

impl ScriptedStatus {
    fn new(statuses: impl IntoIterator<Item = OperationStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into_iter().collect()),
            queries: Mutex::new(0),
        }
    }

    fn queries(&self) -> usize {
        *self.queries.lock().expect("query counter")
    }
}

impl OperationSource for ScriptedStatus {
    fn operation_status<'a>(
        &'a self,
        _operation: &'a PendingOperation,
    ) -> CloudFuture<'a, OperationStatus> {
        Box::pin(async move {
            *self.queries.lock().expect("query counter") += 1;
            Ok(self
                .statuses
                .lock()
                .expect("status script")
                .pop_front()
                .unwrap_or(OperationStatus::Running))
        })
    }
}

/// Never answers a status query.
struct HangingStatus;

impl OperationSource for HangingStatus {
    fn operation_status<'a>(
        &'a self,
        _operation: &'a PendingOperation,
    ) -> CloudFuture<'a, OperationStatus> {
        Box::pin(std::future::pending())
    }
}

#[fixture]
fn operation() -> PendingOperation {
    PendingOperation {
        operation_id: String::from("task-1"),
        resource_id: String::from("srv-1"),
        zone: String::from("fr-par-1"),
    }
}

const INTERVAL: Duration = Duration::from_secs(2);

#[rstest]
#[tokio::test(start_paused = true)]
async fn completion_succeeds_after_running_polls(operation: PendingOperation) {
    let source = ScriptedStatus::new([
        OperationStatus::Running,
        OperationStatus::Running,
        OperationStatus::Succeeded,
    ]);
    let started = Instant::now();

    wait_for_completion(&source, &operation, INTERVAL, &CancellationToken::new())
        .await
        .expect("operation should succeed");

    assert_eq!(source.queries(), 3);
    assert_eq!(started.elapsed(), INTERVAL * 3);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn completion_treats_zero_interval_as_the_minimum(operation: PendingOperation) {
    let source = ScriptedStatus::new([OperationStatus::Running, OperationStatus::Succeeded]);
    let started = Instant::now();

    wait_for_completion(&source, &operation, Duration::ZERO, &CancellationToken::new())
        .await
        .expect("operation should succeed");

    assert_eq!(source.queries(), 2);
    assert_eq!(started.elapsed(), MIN_POLL_INTERVAL * 2);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn completion_surfaces_provider_failure_message(operation: PendingOperation) {
    let source = ScriptedStatus::new([OperationStatus::Failed {
        message: String::from("quota exceeded"),
    }]);

    let err = wait_for_completion(&source, &operation, INTERVAL, &CancellationToken::new())
        .await
        .expect_err("operation should fail");

    assert_eq!(
        err,
        WaitError::OperationFailed {
            operation_id: String::from("task-1"),
            message: String::from("quota exceeded"),
        }
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn completion_returns_cancelled_within_one_interval(operation: PendingOperation) {
    let source = ScriptedStatus::new([]);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let started = Instant::now();

    let err = wait_for_completion(&source, &operation, INTERVAL, &cancel)
        .await
        .expect_err("wait should be cancelled");

    assert_eq!(err, WaitError::Cancelled);
    assert!(started.elapsed() <= Duration::from_secs(5) + INTERVAL);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn completion_cancels_a_hanging_status_query(operation: PendingOperation) {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let err = wait_for_completion(&HangingStatus, &operation, INTERVAL, &cancel)
        .await
        .expect_err("wait should be cancelled");

    assert_eq!(err, WaitError::Cancelled);
}

fn free_port() -> u16 {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|listener| listener.local_addr())
        .expect("ephemeral port")
        .port()
}

#[tokio::test]
async fn reachability_succeeds_on_first_open_port() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
    let address = listener.local_addr().expect("local addr");

    wait_for_reachability(
        address,
        Duration::from_secs(5),
        Duration::from_millis(50),
        &CancellationToken::new(),
    )
    .await
    .expect("listener should be reachable");
}

#[tokio::test]
async fn reachability_times_out_only_after_the_full_bound() {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, free_port()));
    let bound = Duration::from_millis(300);
    let started = std::time::Instant::now();

    let err = wait_for_reachability(
        address,
        bound,
        Duration::from_millis(50),
        &CancellationToken::new(),
    )
    .await
    .expect_err("closed port should time out");

    assert_eq!(
        err,
        WaitError::Timeout {
            address,
            waited: bound
        }
    );
    assert!(started.elapsed() >= bound);
}

#[tokio::test]
async fn reachability_accepts_a_zero_retry_interval() {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, free_port()));
    let bound = Duration::from_millis(100);

    let err = wait_for_reachability(address, bound, Duration::ZERO, &CancellationToken::new())
        .await
        .expect_err("closed port should time out");

    assert!(matches!(err, WaitError::Timeout { .. }));
}

#[tokio::test]
async fn reachability_succeeds_after_earlier_refusals() {
    let port = free_port();
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let opener = tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        tokio::net::TcpListener::bind(address)
            .await
            .expect("late bind")
    });

    let outcome = wait_for_reachability(
        address,
        Duration::from_secs(10),
        Duration::from_millis(50),
        &CancellationToken::new(),
    )
    .await;
    let _listener = opener.await.expect("listener task");

    outcome.expect("host should become reachable");
}

#[tokio::test]
async fn reachability_honours_cancellation() {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, free_port()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = wait_for_reachability(address, Duration::from_secs(60), INTERVAL, &cancel)
        .await
        .expect_err("cancelled wait");

    assert_eq!(err, WaitError::Cancelled);
}
