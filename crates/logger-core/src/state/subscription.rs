//! Weak-reference observer list
//!
//! Targets are held as `Weak<T>` so the registry never keeps a listener
//! alive. Identity is the target's allocation, which makes subscribing
//! the same `Arc` twice a no-op.

use std::sync::{Arc, Weak};

trait Subscriber<V>: Send + Sync {
    /// Allocation address of the target, used as its identity
    fn identity(&self) -> *const ();

    /// Deliver `value`; returns false once the target has been dropped
    fn notify(&self, value: &V) -> bool;

    fn is_alive(&self) -> bool;
}

struct WeakSubscriber<T, F> {
    target: Weak<T>,
    action: F,
}

impl<T, V, F> Subscriber<V> for WeakSubscriber<T, F>
where
    T: Send + Sync,
    F: Fn(&T, &V) + Send + Sync,
{
    fn identity(&self) -> *const () {
        self.target.as_ptr() as *const ()
    }

    fn notify(&self, value: &V) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                (self.action)(&target, value);
                true
            }
            None => false,
        }
    }

    fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }
}

/// Observers of values of type `V`
pub struct Subscription<V> {
    subscribers: Vec<Arc<dyn Subscriber<V>>>,
}

/// Subscribers captured for delivery after the registry is released, so
/// an action may subscribe or unsubscribe without deadlocking
pub struct Delivery<V> {
    subscribers: Vec<Arc<dyn Subscriber<V>>>,
}

impl<V> Delivery<V> {
    /// Deliver `value` to every captured target still alive
    pub fn send(&self, value: &V) {
        for subscriber in &self.subscribers {
            subscriber.notify(value);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<V> Default for Subscription<V> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<V> Subscription<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` for `target`.
    ///
    /// Returns false, leaving the existing action in place, if `target` is
    /// already subscribed.
    pub fn subscribe<T, F>(&mut self, target: &Arc<T>, action: F) -> bool
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &V) + Send + Sync + 'static,
        V: 'static,
    {
        if self.contains(target) {
            return false;
        }
        self.subscribers.push(Arc::new(WeakSubscriber {
            target: Arc::downgrade(target),
            action,
        }));
        true
    }

    /// Remove `target`; returns whether it was subscribed
    pub fn unsubscribe<T>(&mut self, target: &Arc<T>) -> bool {
        let identity = Arc::as_ptr(target) as *const ();
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.identity() != identity);
        self.subscribers.len() != before
    }

    pub fn contains<T>(&self, target: &Arc<T>) -> bool {
        let identity = Arc::as_ptr(target) as *const ();
        self.subscribers.iter().any(|s| s.identity() == identity)
    }

    /// Deliver `value` to every live target, pruning dropped ones
    pub fn broadcast(&mut self, value: &V) {
        self.subscribers.retain(|s| s.notify(value));
    }

    /// Prune dropped targets and capture the rest for a later `send`
    pub fn delivery(&mut self) -> Delivery<V> {
        self.subscribers.retain(|s| s.is_alive());
        Delivery {
            subscribers: self.subscribers.clone(),
        }
    }

    /// Number of registered subscribers, including not yet pruned dead ones
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<i32>>,
    }

    impl Recorder {
        fn record(&self, value: &i32) {
            self.seen.lock().unwrap().push(*value);
        }

        fn seen(&self) -> Vec<i32> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_broadcast_reaches_live_targets() {
        let mut subscription = Subscription::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());

        subscription.subscribe(&a, Recorder::record);
        subscription.subscribe(&b, Recorder::record);
        subscription.broadcast(&1);
        subscription.broadcast(&2);

        assert_eq!(a.seen(), vec![1, 2]);
        assert_eq!(b.seen(), vec![1, 2]);
    }

    #[test]
    fn test_subscribe_dedupes_by_target() {
        let mut subscription = Subscription::new();
        let a = Arc::new(Recorder::default());

        assert!(subscription.subscribe(&a, Recorder::record));
        assert!(!subscription.subscribe(&a, |r: &Recorder, v: &i32| r.record(&(v * 10))));
        assert_eq!(subscription.len(), 1);

        subscription.broadcast(&3);
        assert_eq!(a.seen(), vec![3]);
    }

    #[test]
    fn test_dead_targets_pruned_on_broadcast() {
        let mut subscription = Subscription::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        subscription.subscribe(&a, Recorder::record);
        subscription.subscribe(&b, Recorder::record);

        drop(b);
        // Pruning is lazy
        assert_eq!(subscription.len(), 2);

        subscription.broadcast(&7);
        assert_eq!(subscription.len(), 1);
        assert_eq!(a.seen(), vec![7]);
    }

    #[test]
    fn test_registry_does_not_retain_targets() {
        let mut subscription: Subscription<i32> = Subscription::new();
        let a = Arc::new(Recorder::default());
        subscription.subscribe(&a, Recorder::record);

        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(Arc::weak_count(&a), 1);
    }

    #[test]
    fn test_delivery_outlives_registry_changes() {
        let mut subscription = Subscription::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        subscription.subscribe(&a, Recorder::record);
        subscription.subscribe(&b, Recorder::record);
        drop(b);

        let delivery = subscription.delivery();
        assert_eq!(delivery.len(), 1);
        assert_eq!(subscription.len(), 1);

        // Unsubscribing mid-delivery does not affect the captured set
        assert!(subscription.unsubscribe(&a));
        delivery.send(&4);
        assert_eq!(a.seen(), vec![4]);
    }

    #[test]
    fn test_unsubscribe_by_identity() {
        let mut subscription = Subscription::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        subscription.subscribe(&a, Recorder::record);
        subscription.subscribe(&b, Recorder::record);

        assert!(subscription.unsubscribe(&a));
        assert!(!subscription.unsubscribe(&a));
        subscription.broadcast(&5);

        assert!(a.seen().is_empty());
        assert_eq!(b.seen(), vec![5]);
        assert!(!subscription.contains(&a));
    }
}
