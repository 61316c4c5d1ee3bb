// ── Data-source status state machine ──
//
// Single source of truth for connection health. Pure state transitions and
// synchronous notification; no I/O.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::status::{DataSourceState, DataSourceStatus, StatusErrorInfo};
use crate::error::{DataSourceError, ErrorHandler, ErrorKind};

/// Status-change callback.
pub type StatusListener = Arc<dyn Fn(&DataSourceStatus) + Send + Sync>;

/// Source of epoch-millis timestamps.
pub type TimeStamper = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Returned by [`DataSourceStatusManager::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ── Transition guard ─────────────────────────────────────────────────

/// A `(current, requested) -> resolved` rule overriding a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionGuard {
    pub current: DataSourceState,
    pub requested: DataSourceState,
    pub resolved: DataSourceState,
}

/// Every suppression rule. Requests not listed here apply verbatim.
///
/// A failure during the first connection is not an interruption: nothing
/// was flowing yet, so the source is still initializing.
pub const TRANSITION_GUARDS: &[TransitionGuard] = &[TransitionGuard {
    current: DataSourceState::Initializing,
    requested: DataSourceState::Interrupted,
    resolved: DataSourceState::Initializing,
}];

/// The state a request for `requested` leads to while in `current`.
pub fn resolve_transition(
    current: DataSourceState,
    requested: DataSourceState,
) -> DataSourceState {
    TRANSITION_GUARDS
        .iter()
        .find(|guard| guard.current == current && guard.requested == requested)
        .map_or(requested, |guard| guard.resolved)
}

// ── DataSourceStatusManager ──────────────────────────────────────────

struct Inner {
    status: DataSourceStatus,
    listeners: Vec<(ListenerId, StatusListener)>,
    next_listener_id: u64,
}

/// Owns the current [`DataSourceStatus`] and notifies observers.
///
/// Listeners run synchronously on the calling thread, in subscription
/// order, after the internal lock is released. A listener may therefore
/// read the status or (un)subscribe; one added during a notification only
/// sees later ones.
pub struct DataSourceStatusManager {
    inner: Mutex<Inner>,
    time_stamper: TimeStamper,
    watch: watch::Sender<DataSourceStatus>,
}

impl DataSourceStatusManager {
    /// A manager stamping transitions with the wall clock.
    pub fn new() -> Self {
        Self::with_time_stamper(Arc::new(|| chrono::Utc::now().timestamp_millis()))
    }

    pub fn with_time_stamper(time_stamper: TimeStamper) -> Self {
        let status = DataSourceStatus {
            state: DataSourceState::Initializing,
            state_since: time_stamper(),
            last_error: None,
        };
        let (watch, _) = watch::channel(status.clone());
        Self {
            inner: Mutex::new(Inner {
                status,
                listeners: Vec::new(),
                next_listener_id: 0,
            }),
            time_stamper,
            watch,
        }
    }

    /// Current snapshot.
    pub fn status(&self) -> DataSourceStatus {
        self.lock().status.clone()
    }

    /// Receiver always holding the latest notified status.
    pub fn subscribe(&self) -> watch::Receiver<DataSourceStatus> {
        self.watch.subscribe()
    }

    pub fn on(&self, listener: StatusListener) -> ListenerId {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(existing, _)| *existing != id);
        inner.listeners.len() != before
    }

    pub fn set_valid(&self) {
        self.update_state(DataSourceState::Valid, None);
    }

    pub fn set_offline(&self) {
        self.update_state(DataSourceState::SetOffline, None);
    }

    pub fn set_background_disabled(&self) {
        self.update_state(DataSourceState::BackgroundDisabled, None);
    }

    pub fn set_network_unavailable(&self) {
        self.update_state(DataSourceState::NetworkUnavailable, None);
    }

    /// Record a failure and move to `Shutdown` (if `shutdown`) or
    /// `Interrupted`. Observers are notified even when the state is unchanged.
    pub fn set_error(
        &self,
        kind: ErrorKind,
        message: impl Into<String>,
        status_code: Option<u16>,
        shutdown: bool,
    ) {
        let error = StatusErrorInfo {
            kind,
            message: message.into(),
            status_code,
            time: (self.time_stamper)(),
        };
        let requested = if shutdown {
            DataSourceState::Shutdown
        } else {
            DataSourceState::Interrupted
        };
        self.update_state(requested, Some(error));
    }

    /// An [`ErrorHandler`] recording every error here; unrecoverable errors
    /// shut the source down.
    pub fn error_handler(self: &Arc<Self>) -> ErrorHandler {
        let manager = Arc::clone(self);
        Arc::new(move |err: DataSourceError| {
            manager.set_error(err.kind, err.message, err.status_code, !err.recoverable);
        })
    }

    fn update_state(&self, requested: DataSourceState, error: Option<StatusErrorInfo>) {
        let is_error = error.is_some();
        let (snapshot, listeners) = {
            let mut inner = self.lock();
            let resolved = resolve_transition(inner.status.state, requested);
            let changed = inner.status.state != resolved;
            if changed {
                inner.status.state = resolved;
                inner.status.state_since = (self.time_stamper)();
            }
            if let Some(error) = error {
                inner.status.last_error = Some(error);
            }
            if !changed && !is_error {
                return;
            }
            let listeners: Vec<StatusListener> = inner
                .listeners
                .iter()
                .map(|(_, listener)| Arc::clone(listener))
                .collect();
            (inner.status.clone(), listeners)
        };

        self.watch.send_replace(snapshot.clone());
        for listener in listeners {
            listener(&snapshot);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("status lock poisoned")
    }
}

impl Default for DataSourceStatusManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DataSourceStatusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceStatusManager")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};

    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    use super::*;

    /// Manual clock: every read returns the current value.
    fn manual_clock(start: i64) -> (Arc<AtomicI64>, TimeStamper) {
        let now = Arc::new(AtomicI64::new(start));
        let clock = Arc::clone(&now);
        (now, Arc::new(move || clock.load(Ordering::SeqCst)))
    }

    fn recorder(manager: &DataSourceStatusManager) -> (ListenerId, Arc<Mutex<Vec<DataSourceStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = manager.on(Arc::new(move |status: &DataSourceStatus| {
            sink.lock().unwrap().push(status.clone());
        }));
        (id, seen)
    }

    #[test]
    fn only_initializing_interrupted_is_suppressed() {
        for current in DataSourceState::iter() {
            for requested in DataSourceState::iter() {
                let expected = if current == DataSourceState::Initializing
                    && requested == DataSourceState::Interrupted
                {
                    DataSourceState::Initializing
                } else {
                    requested
                };
                assert_eq!(
                    resolve_transition(current, requested),
                    expected,
                    "({current}, {requested})"
                );
            }
        }
    }

    #[test]
    fn starts_initializing_without_error() {
        let (_, clock) = manual_clock(100);
        let manager = DataSourceStatusManager::with_time_stamper(clock);
        let status = manager.status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert_eq!(status.state_since, 100);
        assert_eq!(status.last_error, None);
    }

    #[test]
    fn state_since_advances_only_on_change() {
        let (now, clock) = manual_clock(0);
        let manager = DataSourceStatusManager::with_time_stamper(clock);

        now.store(10, Ordering::SeqCst);
        manager.set_valid();
        assert_eq!(manager.status().state_since, 10);

        now.store(20, Ordering::SeqCst);
        manager.set_valid();
        assert_eq!(manager.status().state_since, 10);

        now.store(30, Ordering::SeqCst);
        manager.set_offline();
        assert_eq!(manager.status().state, DataSourceState::SetOffline);
        assert_eq!(manager.status().state_since, 30);

        now.store(40, Ordering::SeqCst);
        manager.set_network_unavailable();
        manager.set_network_unavailable();
        assert_eq!(manager.status().state_since, 40);

        now.store(50, Ordering::SeqCst);
        manager.set_background_disabled();
        assert_eq!(manager.status().state, DataSourceState::BackgroundDisabled);
        assert_eq!(manager.status().state_since, 50);
    }

    #[test]
    fn repeated_non_error_request_does_not_notify() {
        let manager = DataSourceStatusManager::new();
        let (_, seen) = recorder(&manager);

        manager.set_valid();
        manager.set_valid();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn error_while_initializing_stays_initializing_but_notifies() {
        let (now, clock) = manual_clock(5);
        let manager = DataSourceStatusManager::with_time_stamper(clock);
        let (_, seen) = recorder(&manager);

        now.store(7, Ordering::SeqCst);
        manager.set_error(ErrorKind::NetworkError, "connection refused", None, false);

        let status = manager.status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert_eq!(status.state_since, 5);
        let error = status.last_error.unwrap();
        assert_eq!(error.kind, ErrorKind::NetworkError);
        assert_eq!(error.time, 7);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].last_error.as_ref().map(|e| e.message.as_str()), Some("connection refused"));
    }

    #[test]
    fn error_after_valid_interrupts() {
        let manager = DataSourceStatusManager::new();
        manager.set_valid();
        manager.set_error(ErrorKind::ErrorResponse, "bad gateway", Some(502), false);

        let status = manager.status();
        assert_eq!(status.state, DataSourceState::Interrupted);
        assert_eq!(status.last_error.unwrap().status_code, Some(502));
    }

    #[test]
    fn repeated_errors_notify_each_time() {
        let manager = DataSourceStatusManager::new();
        manager.set_valid();
        let (_, seen) = recorder(&manager);

        manager.set_error(ErrorKind::NetworkError, "first", None, false);
        manager.set_error(ErrorKind::NetworkError, "second", None, false);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].state, DataSourceState::Interrupted);
        assert_eq!(seen[1].last_error.as_ref().unwrap().message, "second");
    }

    #[test]
    fn shutdown_error_always_shuts_down() {
        for setup in [
            DataSourceStatusManager::set_valid as fn(&DataSourceStatusManager),
            DataSourceStatusManager::set_offline,
            DataSourceStatusManager::set_network_unavailable,
            |_: &DataSourceStatusManager| {},
        ] {
            let manager = DataSourceStatusManager::new();
            setup(&manager);
            manager.set_error(ErrorKind::ErrorResponse, "unauthorized", Some(401), true);
            assert_eq!(manager.status().state, DataSourceState::Shutdown);
        }
    }

    #[test]
    fn off_stops_notifications() {
        let manager = DataSourceStatusManager::new();
        let (id, seen) = recorder(&manager);

        manager.set_valid();
        assert!(manager.off(id));
        manager.set_offline();
        manager.set_error(ErrorKind::Unknown, "ignored", None, false);

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(!manager.off(id));
    }

    #[test]
    fn listeners_run_in_subscription_order() {
        let manager = DataSourceStatusManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            manager.on(Arc::new(move |_: &DataSourceStatus| order.lock().unwrap().push(n)));
        }

        manager.set_valid();

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn listener_added_during_notification_misses_it() {
        let manager = Arc::new(DataSourceStatusManager::new());
        let late_calls = Arc::new(Mutex::new(0_u32));

        let registrar = Arc::clone(&manager);
        let counter = Arc::clone(&late_calls);
        manager.on(Arc::new(move |_: &DataSourceStatus| {
            let counter = Arc::clone(&counter);
            registrar.on(Arc::new(move |_: &DataSourceStatus| {
                *counter.lock().unwrap() += 1;
            }));
        }));

        manager.set_valid();
        assert_eq!(*late_calls.lock().unwrap(), 0);

        manager.set_offline();
        assert_eq!(*late_calls.lock().unwrap(), 1);
    }

    #[test]
    fn watch_receiver_sees_latest_status() {
        let manager = DataSourceStatusManager::new();
        let rx = manager.subscribe();

        manager.set_valid();
        manager.set_error(ErrorKind::InvalidData, "bad payload", None, false);

        let latest = rx.borrow().clone();
        assert_eq!(latest, manager.status());
        assert_eq!(latest.state, DataSourceState::Interrupted);
    }

    #[test]
    fn error_handler_maps_recoverability_to_shutdown() {
        let manager = Arc::new(DataSourceStatusManager::new());
        manager.set_valid();
        let handler = manager.error_handler();

        handler(DataSourceError::streaming(ErrorKind::ErrorResponse, "unavailable").with_status(Some(503)));
        assert_eq!(manager.status().state, DataSourceState::Interrupted);

        handler(
            DataSourceError::streaming(ErrorKind::ErrorResponse, "forbidden")
                .with_status(Some(403))
                .unrecoverable(),
        );
        let status = manager.status();
        assert_eq!(status.state, DataSourceState::Shutdown);
        assert_eq!(status.last_error.unwrap().status_code, Some(403));
    }
}
