use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use indexmap::IndexMap;
use indexmap::map::Entry;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, trace};

use crate::core::network_state::NetworkState;
use crate::core::source::ConnectivitySource;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identity of one subscriber. Every call to [SubscriberToken::new] yields a token that is
/// different from all the others, so two callers are always counted separately.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SubscriberToken(u64);

impl SubscriberToken {
  #[allow(clippy::new_without_default)]
  pub fn new() -> Self {
    Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
  }
}

/// Receives the [NetworkState] after every connectivity change.
///
/// Listeners are called on the thread that delivered the change, with the observer lock
/// held. They must return quickly and must not call back into
/// [ConnectivityObserver::subscribe] or [ConnectivityObserver::unsubscribe], nor cancel a
/// token that a blocking executor call is waiting on.
pub trait NetworkStateListener: Send + Sync + 'static {
  fn on_network_state_updated(&self, state: &NetworkState);
}

impl<F> NetworkStateListener for F
where
  F: Fn(&NetworkState) + Send + Sync + 'static,
{
  fn on_network_state_updated(&self, state: &NetworkState) {
    self(state)
  }
}

pub(crate) struct Subscribers {
  entries: IndexMap<SubscriberToken, Option<Arc<dyn NetworkStateListener>>>,
  state: NetworkState,
  observing: bool,
}

struct ObserverInner {
  source: Arc<dyn ConnectivitySource>,
  subscribers: Mutex<Subscribers>,
  changed: Condvar,
  state_notifier: watch::Sender<NetworkState>,
}

impl ObserverInner {
  fn on_connectivity_changed(&self) {
    let mut guard = self.subscribers.lock();
    self.changed.notify_all();

    let state = NetworkState::new(self.source.is_connected(), self.source.is_roaming());
    guard.state = state;
    self.state_notifier.send_replace(state);
    trace!(
      "connectivity changed: {:?}, notify {} subscribers",
      state,
      guard.entries.len()
    );

    let subscribers = &*guard;
    for (token, listener) in subscribers.entries.iter() {
      let Some(listener) = listener else {
        continue;
      };

      #[cfg(feature = "verbose_log")]
      trace!("notify {:?}: {:?}", token, subscribers.state);

      let result = panic::catch_unwind(AssertUnwindSafe(|| {
        listener.on_network_state_updated(&subscribers.state)
      }));
      if let Err(err) = result {
        error!(
          "listener {:?} panicked while handling {:?}: {:?}",
          token, state, err
        );
      }
    }
  }
}

impl Drop for ObserverInner {
  fn drop(&mut self) {
    if self.subscribers.get_mut().observing {
      debug!("observer dropped with live subscribers, stop observing connectivity");
      self.source.stop_observing();
    }
  }
}

/// Handle given to a [ConnectivitySource] when observation starts. The source calls
/// [ChangeNotifier::notify] every time the connectivity changes.
#[derive(Clone)]
pub struct ChangeNotifier(Weak<ObserverInner>);

impl ChangeNotifier {
  /// Does nothing once the observer is gone.
  pub fn notify(&self) {
    match self.0.upgrade() {
      Some(inner) => inner.on_connectivity_changed(),
      None => trace!("connectivity changed after the observer was dropped"),
    }
  }
}

/// Single source of truth for the connectivity state.
///
/// Observation of the underlying [ConnectivitySource] is reference counted: it starts when
/// the first subscriber registers and stops when the last one leaves. If the source fails to
/// start, the next new subscriber tries again.
#[derive(Clone)]
pub struct ConnectivityObserver {
  inner: Arc<ObserverInner>,
}

impl ConnectivityObserver {
  pub fn new(source: Arc<dyn ConnectivitySource>) -> Self {
    let state = NetworkState::new(source.is_connected(), source.is_roaming());
    let (state_notifier, _) = watch::channel(state);
    let inner = ObserverInner {
      source,
      subscribers: Mutex::new(Subscribers {
        entries: IndexMap::new(),
        state,
        observing: false,
      }),
      changed: Condvar::new(),
      state_notifier,
    };
    Self {
      inner: Arc::new(inner),
    }
  }

  pub fn is_connected(&self) -> bool {
    self.inner.source.is_connected()
  }

  pub fn is_roaming(&self) -> bool {
    self.inner.source.is_roaming()
  }

  pub fn current_state(&self) -> NetworkState {
    NetworkState::new(self.is_connected(), self.is_roaming())
  }

  /// The state delivered with the latest change notification.
  pub fn last_known_state(&self) -> NetworkState {
    self.inner.subscribers.lock().state
  }

  /// Registers `listener` under `token`. Subscribing an existing token replaces its listener
  /// and keeps its position. Returns true if the token was not registered before.
  pub fn subscribe<L>(&self, token: SubscriberToken, listener: L) -> bool
  where
    L: NetworkStateListener,
  {
    self.register(token, Some(Arc::new(listener)))
  }

  /// Registers `token` without a listener. It keeps the observation alive and lets the
  /// holder wait for changes.
  pub fn acquire(&self, token: SubscriberToken) -> bool {
    self.register(token, None)
  }

  /// Removes `token`. Returns false if it was not registered.
  pub fn unsubscribe(&self, token: SubscriberToken) -> bool {
    let mut guard = self.inner.subscribers.lock();
    if guard.entries.shift_remove(&token).is_none() {
      return false;
    }

    if guard.entries.is_empty() && guard.observing {
      debug!("last subscriber {:?} left, stop observing connectivity", token);
      guard.observing = false;
      self.inner.source.stop_observing();
    }
    true
  }

  /// Keeps the observation alive until the returned guard is dropped.
  pub fn observe(&self) -> ObservationGuard {
    let token = SubscriberToken::new();
    self.acquire(token);
    ObservationGuard {
      observer: self.clone(),
      token,
    }
  }

  pub fn observe_with<L>(&self, listener: L) -> ObservationGuard
  where
    L: NetworkStateListener,
  {
    let token = SubscriberToken::new();
    self.subscribe(token, listener);
    ObservationGuard {
      observer: self.clone(),
      token,
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.inner.subscribers.lock().entries.len()
  }

  /// Whether the source is delivering change signals. False while there are no subscribers,
  /// or when the source failed to start.
  pub fn is_observing(&self) -> bool {
    self.inner.subscribers.lock().observing
  }

  /// Stream of states, fed while at least one subscriber keeps the observation alive.
  pub fn subscribe_state(&self) -> WatchStream<NetworkState> {
    WatchStream::new(self.inner.state_notifier.subscribe())
  }

  pub fn notifier(&self) -> ChangeNotifier {
    ChangeNotifier(Arc::downgrade(&self.inner))
  }

  /// Wakes every caller blocked waiting for connectivity without a change notification.
  /// They re-check their condition and go back to sleep if nothing changed for them.
  pub fn wake_waiters(&self) {
    let _guard = self.inner.subscribers.lock();
    self.inner.changed.notify_all();
  }

  pub(crate) fn state_receiver(&self) -> watch::Receiver<NetworkState> {
    self.inner.state_notifier.subscribe()
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, Subscribers> {
    self.inner.subscribers.lock()
  }

  /// Releases the lock until the next change notification or until `deadline`.
  /// Returns false if the deadline passed.
  pub(crate) fn wait_for_change(
    &self,
    guard: &mut MutexGuard<'_, Subscribers>,
    deadline: Option<Instant>,
  ) -> bool {
    match deadline {
      Some(deadline) => !self.inner.changed.wait_until(guard, deadline).timed_out(),
      None => {
        self.inner.changed.wait(guard);
        true
      },
    }
  }

  fn register(
    &self,
    token: SubscriberToken,
    listener: Option<Arc<dyn NetworkStateListener>>,
  ) -> bool {
    let mut guard = self.inner.subscribers.lock();
    let is_new = match guard.entries.entry(token) {
      Entry::Occupied(mut entry) => {
        if listener.is_some() {
          entry.insert(listener);
        }
        false
      },
      Entry::Vacant(entry) => {
        entry.insert(listener);
        true
      },
    };

    if is_new && !guard.observing {
      debug!("subscriber {:?}, start observing connectivity", token);
      match self.inner.source.start_observing(self.notifier()) {
        Ok(()) => guard.observing = true,
        Err(err) => error!(
          "failed to start observing connectivity, {} subscribers get no change signals: {}",
          guard.entries.len(),
          err
        ),
      }
    }
    is_new
  }
}

/// Scoped subscription created by [ConnectivityObserver::observe]. Unsubscribes on drop.
pub struct ObservationGuard {
  observer: ConnectivityObserver,
  token: SubscriberToken,
}

impl ObservationGuard {
  pub fn token(&self) -> SubscriberToken {
    self.token
  }
}

impl Drop for ObservationGuard {
  fn drop(&mut self) {
    self.observer.unsubscribe(self.token);
  }
}
