use std::time::Duration;

/// Raised by the executor when the network precondition of a call cannot be met.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ConditionError {
  #[error("No network connection")]
  NoConnection,

  #[error("The active connection is roaming")]
  Roaming,

  #[error("Cancelled while waiting for the network condition")]
  Cancelled,

  #[error("No network connection after waiting {0:?}")]
  Timeout(Duration),
}

/// Raised by a [ConnectivitySource](crate::core::source::ConnectivitySource) that cannot
/// start delivering change signals.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error("Connectivity source unavailable: {0}")]
  Unavailable(String),
}

/// Classification of a task failure. Only [TaskError::Transient] makes the executor run the
/// task again; [TaskError::Fatal] is handed back to the caller untouched.
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
  #[error("Transient failure: {0}")]
  Transient(E),

  #[error("{0}")]
  Fatal(E),
}

impl<E> TaskError<E> {
  pub fn transient(error: E) -> Self {
    Self::Transient(error)
  }

  pub fn fatal(error: E) -> Self {
    Self::Fatal(error)
  }

  /// Tags `error` according to its own [Transient] implementation.
  pub fn classify(error: E) -> Self
  where
    E: Transient,
  {
    if error.is_transient() {
      Self::Transient(error)
    } else {
      Self::Fatal(error)
    }
  }

  #[inline]
  pub fn is_transient(&self) -> bool {
    matches!(self, TaskError::Transient(_))
  }

  pub fn into_inner(self) -> E {
    match self {
      TaskError::Transient(error) | TaskError::Fatal(error) => error,
    }
  }
}

/// Error types that know whether they were caused by connectivity trouble.
pub trait Transient {
  fn is_transient(&self) -> bool;
}

/// Any I/O failure is treated as a network failure.
impl Transient for std::io::Error {
  fn is_transient(&self) -> bool {
    true
  }
}

impl From<std::io::Error> for TaskError<std::io::Error> {
  fn from(value: std::io::Error) -> Self {
    Self::Transient(value)
  }
}

/// The error returned by every `run*` method of the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E> {
  #[error(transparent)]
  Condition(#[from] ConditionError),

  #[error("Task failed: {0}")]
  Task(E),

  #[error("Task still failing after {attempts} attempts: {last_error}")]
  RetriesExhausted { attempts: u32, last_error: E },
}

impl<E> ExecuteError<E> {
  pub fn condition(&self) -> Option<ConditionError> {
    match self {
      ExecuteError::Condition(error) => Some(*error),
      _ => None,
    }
  }

  pub fn is_condition(&self) -> bool {
    self.condition().is_some()
  }

  /// Returns the task's own error, if the call failed inside the task.
  pub fn into_task_error(self) -> Option<E> {
    match self {
      ExecuteError::Condition(_) => None,
      ExecuteError::Task(error) => Some(error),
      ExecuteError::RetriesExhausted { last_error, .. } => Some(last_error),
    }
  }
}
