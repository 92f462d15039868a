//! Single-shot request correlation
//!
//! Parks a pending request under a correlation key until a response arrives
//! or its deadline passes. Used two ways:
//!
//! - synchronous platform calls (login, shadow get), keyed by the request id
//!   embedded in the topic
//! - downstream commands relayed to a device, keyed by `(device, flowNo)`, so
//!   the device acknowledgment can be matched back to the platform request
//!
//! Every entry is removed exactly once: by [`RequestCorrelator::complete`] or
//! by its timeout, never both.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Correlation failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    /// A request with this key is already waiting
    #[error("request '{0}' is already pending")]
    AlreadyPending(String),

    /// No response arrived before the deadline
    #[error("request '{key}' timed out after {elapsed:?}")]
    TimedOut {
        /// Correlation key
        key: String,
        /// How long the caller waited
        elapsed: Duration,
    },

    /// The correlator was dropped or the entry cancelled
    #[error("request '{0}' was cancelled")]
    Cancelled(String),
}

/// Key for a command relayed to a device: `(session key, flowNo)`
pub type FlowKey = (String, String);

/// A registered, not yet resolved request
///
/// Dropping the handle without awaiting it removes the entry.
#[derive(Debug)]
pub struct PendingHandle<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    key: K,
    rx: Option<oneshot::Receiver<T>>,
    deadline: Option<Instant>,
    pending: Arc<DashMap<K, oneshot::Sender<T>>>,
}

impl<K, T> PendingHandle<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Correlation key
    pub const fn key(&self) -> &K {
        &self.key
    }

    /// Deadline set at registration, if any
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Wait for the response, up to `timeout`
    ///
    /// On timeout the entry is removed, so a later `complete` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` if no response arrived in time, `Cancelled` if the
    /// entry was dropped without a value
    pub async fn wait(mut self, timeout: Duration) -> Result<T, CorrelationError> {
        let started = Instant::now();
        let deadline = self
            .deadline
            .map_or(started + timeout, |d| d.min(started + timeout));
        let Some(rx) = self.rx.take() else {
            return Err(CorrelationError::Cancelled(format!("{:?}", self.key)));
        };

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CorrelationError::Cancelled(format!("{:?}", self.key))),
            Err(_) => {
                self.pending.remove_if(&self.key, |_, tx| tx.is_closed());
                Err(CorrelationError::TimedOut {
                    key: format!("{:?}", self.key),
                    elapsed: started.elapsed(),
                })
            }
        }
    }
}

impl<K, T> Drop for PendingHandle<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    fn drop(&mut self) {
        // only clean up if nobody consumed the slot yet; a closed sender is
        // ours, an open one belongs to a newer registration of the same key
        if let Some(rx) = self.rx.take() {
            drop(rx);
            self.pending.remove_if(&self.key, |_, tx| tx.is_closed());
        }
    }
}

/// Table of pending requests keyed by correlation key
#[derive(Debug)]
pub struct RequestCorrelator<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    pending: Arc<DashMap<K, oneshot::Sender<T>>>,
    default_timeout: Duration,
}

impl<K, T> RequestCorrelator<K, T>
where
    K: Eq + Hash + Clone + fmt::Debug,
{
    /// Create a correlator whose handles default to `default_timeout`
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            default_timeout,
        }
    }

    /// Timeout used by [`Self::await_sync`]
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a pending request
    ///
    /// # Errors
    ///
    /// Returns `AlreadyPending` if `key` is already waiting
    pub fn register(&self, key: K) -> Result<PendingHandle<K, T>, CorrelationError> {
        self.register_with_deadline(key, None)
    }

    /// Register a pending request that expires at `deadline`
    ///
    /// # Errors
    ///
    /// Returns `AlreadyPending` if `key` is already waiting
    pub fn register_with_deadline(
        &self,
        key: K,
        deadline: Option<Instant>,
    ) -> Result<PendingHandle<K, T>, CorrelationError> {
        let (tx, rx) = oneshot::channel();
        match self.pending.entry(key.clone()) {
            Entry::Occupied(_) => return Err(CorrelationError::AlreadyPending(format!("{key:?}"))),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        Ok(PendingHandle {
            key,
            rx: Some(rx),
            deadline,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Resolve a pending request
    ///
    /// Returns `false` when nobody is waiting (late, duplicate, or
    /// unsolicited response); the value is dropped.
    pub fn complete(&self, key: &K, value: T) -> bool {
        let Some((_, tx)) = self.pending.remove(key) else {
            tracing::warn!(key = ?key, "no pending request for response, dropping");
            return false;
        };

        if tx.send(value).is_err() {
            tracing::warn!(key = ?key, "waiter gave up before response arrived, dropping");
            return false;
        }

        true
    }

    /// Wait on a registered request using the default timeout
    ///
    /// # Errors
    ///
    /// Returns `TimedOut` or `Cancelled` as for [`PendingHandle::wait`]
    pub async fn await_sync(&self, handle: PendingHandle<K, T>) -> Result<T, CorrelationError> {
        handle.wait(self.default_timeout).await
    }

    /// Whether `key` is waiting
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of waiting requests
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator() -> RequestCorrelator<String, i32> {
        RequestCorrelator::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn completes_registered_request() {
        let c = correlator();
        let handle = c.register("req-1".to_string()).unwrap();

        assert!(c.complete(&"req-1".to_string(), 0));
        assert_eq!(c.await_sync(handle).await.unwrap(), 0);
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let c = correlator();
        let _handle = c.register("req-1".to_string()).unwrap();

        assert_eq!(
            c.register("req-1".to_string()).unwrap_err(),
            CorrelationError::AlreadyPending("\"req-1\"".to_string())
        );
    }

    #[tokio::test]
    async fn second_complete_is_a_no_op() {
        let c = correlator();
        let handle = c.register("req-1".to_string()).unwrap();

        assert!(c.complete(&"req-1".to_string(), 7));
        assert!(!c.complete(&"req-1".to_string(), 8));
        assert_eq!(handle.wait(Duration::from_secs(1)).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn unsolicited_complete_returns_false() {
        let c = correlator();
        assert!(!c.complete(&"never".to_string(), 1));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_late_complete_is_dropped() {
        let c = correlator();
        let handle = c.register("req-1".to_string()).unwrap();
        let started = Instant::now();

        let err = handle.wait(Duration::from_millis(200)).await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, CorrelationError::TimedOut { .. }));
        assert!(waited >= Duration::from_millis(200));
        assert!(waited <= Duration::from_millis(250));
        assert!(!c.is_pending(&"req-1".to_string()));
        assert!(!c.complete(&"req-1".to_string(), 0));
    }

    #[tokio::test(start_paused = true)]
    async fn registration_deadline_caps_wait() {
        let c = correlator();
        let deadline = Instant::now() + Duration::from_millis(50);
        let handle = c
            .register_with_deadline("req-1".to_string(), Some(deadline))
            .unwrap();

        let started = Instant::now();
        assert!(handle.wait(Duration::from_secs(10)).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn dropped_handle_releases_key() {
        let c = correlator();
        drop(c.register("req-1".to_string()).unwrap());

        assert!(c.is_empty());
        assert!(c.register("req-1".to_string()).is_ok());
    }

    #[tokio::test]
    async fn completion_from_another_task() {
        let c: Arc<RequestCorrelator<FlowKey, i32>> =
            Arc::new(RequestCorrelator::new(Duration::from_secs(5)));
        let key = ("dev1".to_string(), "3".to_string());
        let handle = c.register(key.clone()).unwrap();

        let completer = Arc::clone(&c);
        tokio::spawn(async move {
            completer.complete(&key, 0);
        });

        assert_eq!(c.await_sync(handle).await.unwrap(), 0);
    }
}
