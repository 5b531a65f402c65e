use serde::{Deserialize, Serialize};

/// The precondition a task must satisfy before the [ConditionalExecutor] runs it.
///
/// [ConditionalExecutor]: crate::core::executor::ConditionalExecutor
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NetworkCondition {
  /// Block until a connection is available instead of failing with
  /// [ConditionError::NoConnection](crate::preclude::ConditionError::NoConnection).
  pub await_connection: bool,
  /// Run the task even if the active connection is roaming.
  pub allow_roaming: bool,
}

impl NetworkCondition {
  pub const fn new(await_connection: bool, allow_roaming: bool) -> Self {
    Self {
      await_connection,
      allow_roaming,
    }
  }

  /// Roaming is allowed.
  pub const fn await_connection(await_connection: bool) -> Self {
    Self::new(await_connection, true)
  }
}

impl Default for NetworkCondition {
  fn default() -> Self {
    Self::await_connection(false)
  }
}

/// Snapshot of the connectivity delivered to listeners on every change.
///
/// `roaming` only carries meaning when `connected` is true.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct NetworkState {
  pub connected: bool,
  pub roaming: bool,
}

impl NetworkState {
  pub const DISCONNECTED: NetworkState = NetworkState::new(false, false);
  pub const CONNECTED: NetworkState = NetworkState::new(true, false);
  pub const ROAMING: NetworkState = NetworkState::new(true, true);

  pub const fn new(connected: bool, roaming: bool) -> Self {
    Self { connected, roaming }
  }

  #[inline]
  pub fn is_connected(&self) -> bool {
    self.connected
  }

  #[inline]
  pub fn is_roaming(&self) -> bool {
    self.connected && self.roaming
  }
}
