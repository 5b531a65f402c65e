use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::task::{Context, Wake, Waker};
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::config::ExecutorConfig;
use crate::core::network_state::{NetworkCondition, NetworkState};
use crate::core::observer::ConnectivityObserver;
use crate::error::{ConditionError, ExecuteError, TaskError};

/// Runs tasks only when a [NetworkCondition] holds.
///
/// A call checks the condition, optionally blocks until a connection shows up, runs the task
/// and runs it again for as long as it fails with [TaskError::Transient]. Every re-run checks
/// the condition from scratch, since the connectivity may have changed in between.
///
/// The blocking `run*` methods suspend the calling thread on the observer's condition
/// variable. The `*_async` methods do the same on a tokio task.
pub struct ConditionalExecutor {
  observer: ConnectivityObserver,
  config: ExecutorConfig,
  shutdown: CancellationToken,
}

impl ConditionalExecutor {
  pub fn new(observer: ConnectivityObserver) -> Self {
    Self::with_config(observer, ExecutorConfig::default())
  }

  pub fn with_config(observer: ConnectivityObserver, config: ExecutorConfig) -> Self {
    Self {
      observer,
      config,
      shutdown: CancellationToken::new(),
    }
  }

  pub fn observer(&self) -> &ConnectivityObserver {
    &self.observer
  }

  pub fn config(&self) -> &ExecutorConfig {
    &self.config
  }

  /// A token that is cancelled by [ConditionalExecutor::shutdown] as well.
  pub fn child_token(&self) -> CancellationToken {
    self.shutdown.child_token()
  }

  /// Cancels `token`. Same as calling [CancellationToken::cancel] directly: blocked calls
  /// waiting on the token are released either way.
  pub fn cancel(&self, token: &CancellationToken) {
    token.cancel();
  }

  /// Releases every pending and future call with [ConditionError::Cancelled].
  pub fn shutdown(&self) {
    debug!("shutdown conditional executor");
    self.shutdown.cancel();
    // Calls made with an unrelated token only registered a waker on that token.
    self.observer.wake_waiters();
  }

  pub fn is_shutdown(&self) -> bool {
    self.shutdown.is_cancelled()
  }

  /// Same as [ConditionalExecutor::run_by_condition] with roaming allowed.
  pub fn run<T, E, F>(&self, task: F, await_connection: bool) -> Result<T, ExecuteError<E>>
  where
    F: FnMut() -> Result<T, TaskError<E>>,
  {
    self.run_by_condition(task, NetworkCondition::await_connection(await_connection))
  }

  pub fn run_by_condition<T, E, F>(
    &self,
    task: F,
    condition: NetworkCondition,
  ) -> Result<T, ExecuteError<E>>
  where
    F: FnMut() -> Result<T, TaskError<E>>,
  {
    self.run_with_cancel(task, condition, &self.shutdown)
  }

  #[instrument(level = "trace", skip_all, fields(
    await_connection = condition.await_connection,
    allow_roaming = condition.allow_roaming,
  ))]
  pub fn run_with_cancel<T, E, F>(
    &self,
    mut task: F,
    condition: NetworkCondition,
    cancel: &CancellationToken,
  ) -> Result<T, ExecuteError<E>>
  where
    F: FnMut() -> Result<T, TaskError<E>>,
  {
    let observation = condition.await_connection.then(|| self.observer.observe());
    let deadline = self
      .config
      .await_timeout()
      .and_then(|timeout| Instant::now().checked_add(timeout));
    let mut retries: u32 = 0;

    // A thread parked on the observer's condvar is not woken by the token alone. Register a
    // waker on the token that wakes every waiter once it gets cancelled.
    let mut cancelled = pin!(cancel.cancelled());
    let waker = Waker::from(Arc::new(WakeWaiters(self.observer.clone())));
    let _ = cancelled.as_mut().poll(&mut Context::from_waker(&waker));

    loop {
      self.check_condition(&condition, cancel, deadline)?;
      let error = match task() {
        Ok(value) => return Ok(value),
        Err(TaskError::Fatal(error)) => return Err(ExecuteError::Task(error)),
        Err(TaskError::Transient(error)) => error,
      };

      if !self.config.retry.allows_retry(retries) {
        warn!("task failed after {} retries, give up", retries);
        return Err(ExecuteError::RetriesExhausted {
          attempts: retries.saturating_add(1),
          last_error: error,
        });
      }
      retries = retries.saturating_add(1);
      debug!("task failed with a transient error, retry #{}", retries);

      if let Some(delay) = self.config.retry.delay_for(retries) {
        // Connectivity changes end the pause early, so they must be observed during it.
        let _pause_observation = observation.is_none().then(|| self.observer.observe());
        let mut guard = self.observer.lock();
        if !self.is_cancelled(cancel) {
          self
            .observer
            .wait_for_change(&mut guard, Instant::now().checked_add(delay));
        }
      }
    }
  }

  /// Holds the observer lock while the connectivity is checked. It is released before the
  /// task runs.
  fn check_condition(
    &self,
    condition: &NetworkCondition,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
  ) -> Result<(), ConditionError> {
    let mut guard = self.observer.lock();
    loop {
      if self.is_cancelled(cancel) {
        return Err(ConditionError::Cancelled);
      }
      if self.observer.is_connected() {
        break;
      }
      if !condition.await_connection {
        return Err(ConditionError::NoConnection);
      }

      trace!("waiting for connectivity");
      let woken = self.observer.wait_for_change(&mut guard, deadline);
      if !woken && !self.observer.is_connected() {
        return Err(self.timeout_error());
      }
    }

    if self.observer.is_roaming() && !condition.allow_roaming {
      return Err(ConditionError::Roaming);
    }
    Ok(())
  }

  /// Same as [ConditionalExecutor::run_by_condition_async] with roaming allowed.
  pub async fn run_async<T, E, F, Fut>(
    &self,
    task: F,
    await_connection: bool,
  ) -> Result<T, ExecuteError<E>>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TaskError<E>>>,
  {
    self
      .run_by_condition_async(task, NetworkCondition::await_connection(await_connection))
      .await
  }

  pub async fn run_by_condition_async<T, E, F, Fut>(
    &self,
    task: F,
    condition: NetworkCondition,
  ) -> Result<T, ExecuteError<E>>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TaskError<E>>>,
  {
    let cancel = self.shutdown.clone();
    self.run_with_cancel_async(task, condition, &cancel).await
  }

  #[instrument(level = "trace", skip_all, fields(
    await_connection = condition.await_connection,
    allow_roaming = condition.allow_roaming,
  ))]
  pub async fn run_with_cancel_async<T, E, F, Fut>(
    &self,
    mut task: F,
    condition: NetworkCondition,
    cancel: &CancellationToken,
  ) -> Result<T, ExecuteError<E>>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TaskError<E>>>,
  {
    let observation = condition.await_connection.then(|| self.observer.observe());
    let mut state_rx = self.observer.state_receiver();
    let deadline = self
      .config
      .await_timeout()
      .and_then(|timeout| tokio::time::Instant::now().checked_add(timeout));
    let mut retries: u32 = 0;

    loop {
      self
        .check_condition_async(&condition, cancel, &mut state_rx, deadline)
        .await?;
      let error = match task().await {
        Ok(value) => return Ok(value),
        Err(TaskError::Fatal(error)) => return Err(ExecuteError::Task(error)),
        Err(TaskError::Transient(error)) => error,
      };

      if !self.config.retry.allows_retry(retries) {
        warn!("task failed after {} retries, give up", retries);
        return Err(ExecuteError::RetriesExhausted {
          attempts: retries.saturating_add(1),
          last_error: error,
        });
      }
      retries = retries.saturating_add(1);
      debug!("task failed with a transient error, retry #{}", retries);

      if let Some(delay) = self.config.retry.delay_for(retries) {
        let _pause_observation = observation.is_none().then(|| self.observer.observe());
        tokio::select! {
          _ = tokio::time::sleep(delay) => {},
          _ = state_rx.changed() => {},
          _ = cancel.cancelled() => {},
          _ = self.shutdown.cancelled() => {},
        }
      }
    }
  }

  async fn check_condition_async(
    &self,
    condition: &NetworkCondition,
    cancel: &CancellationToken,
    state_rx: &mut watch::Receiver<NetworkState>,
    deadline: Option<tokio::time::Instant>,
  ) -> Result<(), ConditionError> {
    loop {
      if self.is_cancelled(cancel) {
        return Err(ConditionError::Cancelled);
      }

      // Mark the current value as seen before checking, so a change that lands after the
      // check still wakes the wait below.
      state_rx.borrow_and_update();
      if self.observer.is_connected() {
        break;
      }
      if !condition.await_connection {
        return Err(ConditionError::NoConnection);
      }

      trace!("waiting for connectivity");
      tokio::select! {
        result = state_rx.changed() => {
          if result.is_err() {
            return Err(ConditionError::Cancelled);
          }
        },
        _ = cancel.cancelled() => return Err(ConditionError::Cancelled),
        _ = self.shutdown.cancelled() => return Err(ConditionError::Cancelled),
        _ = deadline_elapsed(deadline) => {
          if !self.observer.is_connected() {
            return Err(self.timeout_error());
          }
        },
      }
    }

    if self.observer.is_roaming() && !condition.allow_roaming {
      return Err(ConditionError::Roaming);
    }
    Ok(())
  }

  fn is_cancelled(&self, cancel: &CancellationToken) -> bool {
    cancel.is_cancelled() || self.shutdown.is_cancelled()
  }

  fn timeout_error(&self) -> ConditionError {
    let timeout = self.config.await_timeout().unwrap_or_default();
    warn!("no connectivity after {:?}", timeout);
    ConditionError::Timeout(timeout)
  }
}

struct WakeWaiters(ConnectivityObserver);

impl Wake for WakeWaiters {
  fn wake(self: Arc<Self>) {
    self.0.wake_waiters();
  }
}

async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
  match deadline {
    Some(deadline) => tokio::time::sleep_until(deadline).await,
    None => std::future::pending().await,
  }
}
