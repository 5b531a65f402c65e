mod config;
mod error;

pub mod core;

pub mod preclude {
  pub use crate::config::{ExecutorConfig, RetryConfig};
  pub use crate::core::executor::ConditionalExecutor;
  pub use crate::core::network_state::{NetworkCondition, NetworkState};
  pub use crate::core::observer::{
    ChangeNotifier, ConnectivityObserver, NetworkStateListener, ObservationGuard,
    SubscriberToken,
  };
  pub use crate::core::source::{
    ConnectivitySource, ManualConnectivitySource, PollingConnectivitySource,
  };
  pub use crate::error::{ConditionError, ExecuteError, SourceError, TaskError, Transient};
  pub use tokio_util::sync::CancellationToken;
}
