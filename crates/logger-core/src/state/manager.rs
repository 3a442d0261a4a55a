//! Commit, overlay and broadcast of state snapshots
//!
//! The visible state is the committed state with every overlay applied on
//! top in insertion order. It is recomposed and broadcast after each
//! commit, overlay and removal. Broadcast runs synchronously on the
//! calling thread; callers that need thread affinity hop first.

use std::sync::Arc;

use tracing::debug;

use super::subscription::Subscription;

/// A speculative mutation layered over the committed state
pub type Mutation<S> = Box<dyn Fn(&mut S) + Send + Sync>;

/// Identifies an overlay for later removal; never reused
pub type OverlayToken = u64;

pub struct StateManager<S> {
    committed: S,
    overlays: Vec<(OverlayToken, Mutation<S>)>,
    next_token: OverlayToken,
    state: Arc<S>,
    subscription: Subscription<Arc<S>>,
}

impl<S: Clone + Default> Default for StateManager<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: Clone> StateManager<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: Arc::new(initial.clone()),
            committed: initial,
            overlays: Vec::new(),
            next_token: 0,
            subscription: Subscription::new(),
        }
    }

    /// The visible state: committed plus overlays
    pub fn state(&self) -> Arc<S> {
        Arc::clone(&self.state)
    }

    /// The committed state without overlays
    pub fn committed(&self) -> &S {
        &self.committed
    }

    /// Apply `mutation` to the committed state, recompose and broadcast
    pub fn commit(&mut self, mutation: impl FnOnce(&mut S)) {
        mutation(&mut self.committed);
        self.publish();
    }

    /// Like `commit`, but a failed mutation leaves the committed state
    /// untouched and nothing is broadcast
    pub fn try_commit<E>(
        &mut self,
        mutation: impl FnOnce(&mut S) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut next = self.committed.clone();
        mutation(&mut next)?;
        self.committed = next;
        self.publish();
        Ok(())
    }

    /// Layer a speculative mutation over the committed state
    pub fn overlay(&mut self, mutation: impl Fn(&mut S) + Send + Sync + 'static) -> OverlayToken {
        self.next_token += 1;
        let token = self.next_token;
        self.overlays.push((token, Box::new(mutation)));
        debug!(token, overlays = self.overlays.len(), "Added state overlay");
        self.publish();
        token
    }

    /// Withdraw an overlay; returns false for unknown tokens
    pub fn remove(&mut self, token: OverlayToken) -> bool {
        let before = self.overlays.len();
        self.overlays.retain(|(t, _)| *t != token);
        if self.overlays.len() == before {
            return false;
        }
        self.publish();
        true
    }

    pub fn overlay_count(&self) -> usize {
        self.overlays.len()
    }

    pub fn subscribe<T, F>(&mut self, target: &Arc<T>, action: F) -> bool
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &Arc<S>) + Send + Sync + 'static,
        S: 'static,
    {
        self.subscription.subscribe(target, action)
    }

    pub fn unsubscribe<T>(&mut self, target: &Arc<T>) -> bool {
        self.subscription.unsubscribe(target)
    }

    fn publish(&mut self) {
        let mut state = self.committed.clone();
        for (_, mutation) in &self.overlays {
            mutation(&mut state);
        }
        self.state = Arc::new(state);
        self.subscription.broadcast(&self.state);
    }
}
