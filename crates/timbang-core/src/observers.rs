//! Fan-out of decoded readings to registered callbacks.
//!
//! [`ObserverRegistry::subscribe`] hands back an [`ObserverToken`]; calling
//! [`ObserverToken::unsubscribe`] removes exactly that registration. Each
//! callback runs isolated: a panicking observer is logged and skipped.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{trace, warn};

use crate::types::WeightReading;

/// Callback invoked with every published reading.
pub type ReadingCallback = Arc<dyn Fn(&WeightReading) + Send + Sync>;

/// Identity of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    observers: Mutex<HashMap<ObserverId, ReadingCallback>>,
}

impl RegistryInner {
    fn observers(&self) -> MutexGuard<'_, HashMap<ObserverId, ReadingCallback>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Set of reading observers. Cloning shares the same set.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("observers", &self.len())
            .finish()
    }
}

impl ObserverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback.
    ///
    /// The returned token is the only way to remove it again; dropping the
    /// token leaves the callback registered.
    pub fn subscribe<F>(&self, callback: F) -> ObserverToken
    where
        F: Fn(&WeightReading) + Send + Sync + 'static,
    {
        let id = ObserverId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.observers().insert(id, Arc::new(callback));
        trace!(observer = id.0, "Observer registered");

        ObserverToken {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `reading` to every registered callback once.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn publish(&self, reading: &WeightReading) -> usize {
        // Snapshot so callbacks may subscribe/unsubscribe without deadlocking.
        let snapshot: Vec<(ObserverId, ReadingCallback)> = self
            .inner
            .observers()
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        let mut delivered = 0;
        for (id, callback) in snapshot {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(reading))) {
                Ok(()) => delivered += 1,
                Err(payload) => warn!(
                    observer = id.0,
                    panic = panic_message(payload.as_ref()),
                    "Observer panicked while handling reading"
                ),
            }
        }
        delivered
    }

    /// Remove every registration.
    pub fn clear(&self) {
        self.inner.observers().clear();
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.observers().len()
    }

    /// Returns `true` if no callback is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability that removes one registration from an [`ObserverRegistry`].
#[derive(Debug, Clone)]
pub struct ObserverToken {
    id: ObserverId,
    registry: Weak<RegistryInner>,
}

impl ObserverToken {
    /// Identity of the registration this token controls.
    #[must_use]
    pub const fn id(&self) -> ObserverId {
        self.id
    }

    /// Remove the registration. Returns `true` only on the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let removed = registry.observers().remove(&self.id).is_some();
        if removed {
            trace!(observer = self.id.0, "Observer removed");
        }
        removed
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WeightUnit;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    fn reading(weight: f64) -> WeightReading {
        WeightReading {
            weight,
            unit: WeightUnit::Kilograms,
            timestamp: Utc::now(),
            stable: true,
        }
    }

    fn counter(registry: &ObserverRegistry) -> (Arc<AtomicUsize>, ObserverToken) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let token = registry.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, token)
    }

    #[test]
    fn test_publish_reaches_every_observer_once() {
        let registry = ObserverRegistry::new();
        let (a, _ta) = counter(&registry);
        let (b, _tb) = counter(&registry);

        assert_eq!(registry.publish(&reading(1.0)), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let registry = ObserverRegistry::new();
        let _bad = registry.subscribe(|_| panic!("observer bug"));
        let (good, _tg) = counter(&registry);

        assert_eq!(registry.publish(&reading(2.5)), 1);
        assert_eq!(good.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery_only_to_that_observer() {
        let registry = ObserverRegistry::new();
        let (a, ta) = counter(&registry);
        let (b, _tb) = counter(&registry);

        assert!(ta.unsubscribe());
        registry.publish(&reading(3.0));

        assert_eq!(a.load(Ordering::SeqCst), 0);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = ObserverRegistry::new();
        let (_count, token) = counter(&registry);
        let (_other, _keep) = counter(&registry);

        assert!(token.unsubscribe());
        assert!(!token.unsubscribe());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_token_outliving_registry() {
        let registry = ObserverRegistry::new();
        let (_count, token) = counter(&registry);
        drop(registry);
        assert!(!token.unsubscribe());
    }

    #[test]
    fn test_observer_may_unsubscribe_itself() {
        let registry = ObserverRegistry::new();
        let slot: Arc<Mutex<Option<ObserverToken>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let token = registry.subscribe(move |_| {
            if let Some(token) = inner_slot.lock().unwrap().take() {
                token.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(token);

        registry.publish(&reading(1.0));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear() {
        let registry = ObserverRegistry::new();
        let (_a, _ta) = counter(&registry);
        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.publish(&reading(1.0)), 0);
    }
}
