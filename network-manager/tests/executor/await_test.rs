use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, channel};
use std::thread;
use std::time::{Duration, Instant};

use network_manager::preclude::*;

use crate::util::{NetworkTest, wait_until};

type CallResult = Result<usize, ExecuteError<()>>;

/// Runs a counting task on another thread and returns the receiver of its result.
fn spawn_call(
  test: &NetworkTest,
  condition: NetworkCondition,
  cancel: Option<CancellationToken>,
  calls: Arc<AtomicUsize>,
) -> Receiver<CallResult> {
  let (tx, rx) = channel();
  let executor = test.executor.clone();
  thread::spawn(move || {
    let task = || Ok::<_, TaskError<()>>(calls.fetch_add(1, Ordering::SeqCst) + 1);
    let result = match cancel {
      Some(cancel) => executor.run_with_cancel(task, condition, &cancel),
      None => executor.run_by_condition(task, condition),
    };
    let _ = tx.send(result);
  });
  rx
}

fn wait_for_subscribers(test: &NetworkTest, count: usize) {
  assert!(wait_until(Duration::from_secs(2), || {
    test.observer.subscriber_count() == count
  }));
}

#[test]
fn blocked_call_runs_once_connected() {
  let test = NetworkTest::new(NetworkState::DISCONNECTED);
  let calls = Arc::new(AtomicUsize::new(0));
  let rx = spawn_call(&test, NetworkCondition::new(true, true), None, calls.clone());

  wait_for_subscribers(&test, 1);
  assert!(test.source.is_observing());
  assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
  assert_eq!(calls.load(Ordering::SeqCst), 0);

  test.source.set_state(NetworkState::CONNECTED);
  let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
  assert_eq!(result.unwrap(), 1);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert_eq!(test.observer.subscriber_count(), 0);
  assert!(!test.source.is_observing());
}

#[test]
fn spurious_wake_keeps_call_blocked() {
  let test = NetworkTest::new(NetworkState::DISCONNECTED);
  let calls = Arc::new(AtomicUsize::new(0));
  let rx = spawn_call(&test, NetworkCondition::new(true, true), None, calls.clone());
  wait_for_subscribers(&test, 1);

  test.source.signal();
  test.source.set_roaming(true);
  assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
  assert_eq!(calls.load(Ordering::SeqCst), 0);

  test.source.set_connected(true);
  let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
  assert_eq!(result.unwrap(), 1);
}

#[test]
fn roaming_is_checked_after_waiting() {
  let test = NetworkTest::new(NetworkState::DISCONNECTED);
  let calls = Arc::new(AtomicUsize::new(0));
  let rx = spawn_call(&test, NetworkCondition::new(true, false), None, calls.clone());
  wait_for_subscribers(&test, 1);

  test.source.set_state(NetworkState::ROAMING);
  let err = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
  assert_eq!(err.condition(), Some(ConditionError::Roaming));
  assert_eq!(calls.load(Ordering::SeqCst), 0);
  assert_eq!(test.observer.subscriber_count(), 0);
}

#[test]
fn all_blocked_calls_wake_on_connect() {
  let test = NetworkTest::new(NetworkState::DISCONNECTED);
  let calls = Arc::new(AtomicUsize::new(0));
  let receivers = (0..4)
    .map(|_| spawn_call(&test, NetworkCondition::new(true, true), None, calls.clone()))
    .collect::<Vec<_>>();
  wait_for_subscribers(&test, 4);
  assert_eq!(test.source.activation_count(), 1);

  test.source.set_connected(true);
  for rx in receivers {
    assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap().is_ok());
  }
  assert_eq!(calls.load(Ordering::SeqCst), 4);
  assert!(!test.source.is_observing());
}

#[test]
fn cancel_releases_blocked_call() {
  let test = NetworkTest::new(NetworkState::DISCONNECTED);
  let calls = Arc::new(AtomicUsize::new(0));
  let token = test.executor.child_token();
  let other = spawn_call(&test, NetworkCondition::new(true, true), None, calls.clone());
  let rx = spawn_call(
    &test,
    NetworkCondition::new(true, true),
    Some(token.clone()),
    calls.clone(),
  );
  wait_for_subscribers(&test, 2);

  test.executor.cancel(&token);
  let err = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
  assert_eq!(err.condition(), Some(ConditionError::Cancelled));
  assert_eq!(test.observer.subscriber_count(), 1);

  // The other call is still waiting.
  assert!(other.recv_timeout(Duration::from_millis(50)).is_err());
  test.source.set_connected(true);
  assert!(other.recv_timeout(Duration::from_secs(2)).unwrap().is_ok());
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn cancelling_the_token_releases_blocked_call() {
  let test = NetworkTest::new(NetworkState::DISCONNECTED);
  let calls = Arc::new(AtomicUsize::new(0));
  let child = test.executor.child_token();
  let standalone = CancellationToken::new();
  let child_rx = spawn_call(
    &test,
    NetworkCondition::new(true, true),
    Some(child.clone()),
    calls.clone(),
  );
  let standalone_rx = spawn_call(
    &test,
    NetworkCondition::new(true, true),
    Some(standalone.clone()),
    calls.clone(),
  );
  wait_for_subscribers(&test, 2);

  child.cancel();
  let err = child_rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
  assert_eq!(err.condition(), Some(ConditionError::Cancelled));
  assert_eq!(test.observer.subscriber_count(), 1);
  assert!(standalone_rx.recv_timeout(Duration::from_millis(50)).is_err());

  standalone.cancel();
  let err = standalone_rx
    .recv_timeout(Duration::from_secs(2))
    .unwrap()
    .unwrap_err();
  assert_eq!(err.condition(), Some(ConditionError::Cancelled));
  assert_eq!(test.observer.subscriber_count(), 0);
  assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn shutdown_releases_every_blocked_call() {
  let test = NetworkTest::new(NetworkState::DISCONNECTED);
  let calls = Arc::new(AtomicUsize::new(0));
  let token = test.executor.child_token();
  let receivers = vec![
    spawn_call(&test, NetworkCondition::new(true, true), None, calls.clone()),
    spawn_call(&test, NetworkCondition::new(true, false), Some(token), calls.clone()),
  ];
  wait_for_subscribers(&test, 2);

  test.executor.shutdown();
  for rx in receivers {
    let err = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap_err();
    assert_eq!(err.condition(), Some(ConditionError::Cancelled));
  }
  assert_eq!(calls.load(Ordering::SeqCst), 0);
  assert!(!test.source.is_observing());
}

#[test]
fn await_timeout_gives_up() {
  let timeout = Duration::from_millis(50);
  let test = NetworkTest::with_config(
    NetworkState::DISCONNECTED,
    ExecutorConfig::new().with_await_timeout(timeout),
  );
  let start = Instant::now();
  let err = test
    .executor
    .run(|| Ok::<_, TaskError<()>>(()), true)
    .unwrap_err();
  assert_eq!(err.condition(), Some(ConditionError::Timeout(timeout)));
  assert!(start.elapsed() >= timeout);
  assert_eq!(test.observer.subscriber_count(), 0);
}
