use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::network_state::NetworkState;
use crate::core::observer::ChangeNotifier;
use crate::error::SourceError;

/// The platform facility that knows whether the device is online.
///
/// [ConnectivitySource::start_observing] and [ConnectivitySource::stop_observing] are called
/// by the [ConnectivityObserver](crate::core::observer::ConnectivityObserver) with its lock
/// held, so an implementation must never call [ChangeNotifier::notify] from inside them.
pub trait ConnectivitySource: Send + Sync + 'static {
  fn is_connected(&self) -> bool;

  fn is_roaming(&self) -> bool;

  /// Start delivering change signals to `notifier`. Called when the first subscriber
  /// registers. On error the observer tries again with the next new subscriber.
  fn start_observing(&self, notifier: ChangeNotifier) -> Result<(), SourceError>;

  /// Called when the last subscriber leaves.
  fn stop_observing(&self);
}

/// A source whose state is set by the host application, e.g. from a platform callback that
/// lives outside of Rust.
#[derive(Default)]
pub struct ManualConnectivitySource {
  state: Mutex<NetworkState>,
  notifier: Mutex<Option<ChangeNotifier>>,
  activations: AtomicUsize,
}

impl ManualConnectivitySource {
  pub fn new(state: NetworkState) -> Self {
    Self {
      state: Mutex::new(state),
      ..Default::default()
    }
  }

  pub fn state(&self) -> NetworkState {
    *self.state.lock()
  }

  /// Updates the state and signals a change if the source is observed.
  pub fn set_state(&self, state: NetworkState) {
    *self.state.lock() = state;
    self.signal();
  }

  pub fn set_connected(&self, connected: bool) {
    self.state.lock().connected = connected;
    self.signal();
  }

  pub fn set_roaming(&self, roaming: bool) {
    self.state.lock().roaming = roaming;
    self.signal();
  }

  /// Signals a change without touching the state.
  pub fn signal(&self) {
    let notifier = self.notifier.lock().clone();
    if let Some(notifier) = notifier {
      notifier.notify();
    }
  }

  pub fn is_observing(&self) -> bool {
    self.notifier.lock().is_some()
  }

  /// How many times observation was started.
  pub fn activation_count(&self) -> usize {
    self.activations.load(Ordering::Acquire)
  }
}

impl ConnectivitySource for ManualConnectivitySource {
  fn is_connected(&self) -> bool {
    self.state.lock().connected
  }

  fn is_roaming(&self) -> bool {
    self.state.lock().roaming
  }

  fn start_observing(&self, notifier: ChangeNotifier) -> Result<(), SourceError> {
    self.activations.fetch_add(1, Ordering::AcqRel);
    *self.notifier.lock() = Some(notifier);
    Ok(())
  }

  fn stop_observing(&self) {
    self.notifier.lock().take();
  }
}

type Probe = Arc<dyn Fn() -> NetworkState + Send + Sync>;

/// A source that probes the connectivity at a fixed interval and signals every transition.
/// The probe runs on a dedicated thread while the source is observed.
pub struct PollingConnectivitySource {
  probe: Probe,
  interval: Duration,
  worker: Mutex<Option<Arc<AtomicBool>>>,
}

impl PollingConnectivitySource {
  pub fn new<F>(interval: Duration, probe: F) -> Self
  where
    F: Fn() -> NetworkState + Send + Sync + 'static,
  {
    Self {
      probe: Arc::new(probe),
      interval,
      worker: Mutex::new(None),
    }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }
}

impl ConnectivitySource for PollingConnectivitySource {
  fn is_connected(&self) -> bool {
    (self.probe)().connected
  }

  fn is_roaming(&self) -> bool {
    (self.probe)().roaming
  }

  fn start_observing(&self, notifier: ChangeNotifier) -> Result<(), SourceError> {
    let mut worker = self.worker.lock();
    let stop = Arc::new(AtomicBool::new(false));
    if let Some(previous) = worker.take() {
      previous.store(true, Ordering::Release);
    }

    let probe = self.probe.clone();
    let interval = self.interval;
    let mut last = probe();
    let cloned_stop = stop.clone();
    thread::Builder::new()
      .name("connectivity-poll".to_string())
      .spawn(move || {
        while !cloned_stop.load(Ordering::Acquire) {
          thread::sleep(interval);
          if cloned_stop.load(Ordering::Acquire) {
            break;
          }

          let state = probe();
          if state != last {
            debug!("polled connectivity {:?} => {:?}", last, state);
            last = state;
            notifier.notify();
          }
        }
      })?;

    *worker = Some(stop);
    Ok(())
  }

  fn stop_observing(&self) {
    if let Some(stop) = self.worker.lock().take() {
      stop.store(true, Ordering::Release);
    }
  }
}

impl Drop for PollingConnectivitySource {
  fn drop(&mut self) {
    self.stop_observing();
  }
}
