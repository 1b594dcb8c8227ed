//! Values produced off the update cycle
//!
//! [`StateManager::async_state`] returns a state starting out
//! [`AsyncValue::Pending`] and a [`Resolver`] that may be moved to another
//! thread. A resolved value is parked in the manager's inbox and journaled by
//! the next [`sync_changes`](StateManager::sync_changes), so it becomes
//! visible through the same update cycle as any other write.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::PoisonError;

use crate::error::Result;
use crate::manager::{Inbox, StateManager};
use crate::state::{Equivalence, MutableState, StateId};

/// State of a value being produced elsewhere
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AsyncValue<V> {
    Pending,
    Ready(V),
    Failed(String),
}

impl<V> AsyncValue<V> {
    pub fn is_pending(&self) -> bool {
        matches!(self, AsyncValue::Pending)
    }

    pub fn ready(&self) -> Option<&V> {
        match self {
            AsyncValue::Ready(value) => Some(value),
            _ => None,
        }
    }
}

impl<V> Default for AsyncValue<V> {
    fn default() -> Self {
        AsyncValue::Pending
    }
}

/// Sending half of an async state
pub struct Resolver<V> {
    state: StateId,
    inbox: Inbox,
    _marker: PhantomData<fn(V)>,
}

impl<V> Clone for Resolver<V> {
    fn clone(&self) -> Self {
        Self {
            state: self.state,
            inbox: self.inbox.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> fmt::Debug for Resolver<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resolver").field(&self.state).finish()
    }
}

impl<V: Send + 'static> Resolver<V> {
    pub fn resolve(&self, value: V) {
        self.deliver(AsyncValue::Ready(value));
    }

    pub fn reject(&self, reason: impl Into<String>) {
        self.deliver(AsyncValue::Failed(reason.into()));
    }

    fn deliver(&self, value: AsyncValue<V>) {
        let value: Box<dyn Any + Send> = Box::new(value);
        self.inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((self.state, value));
    }
}

impl StateManager {
    /// Create a global state fed from outside the update cycle
    pub fn async_state<V: Clone + Send + 'static>(&self) -> Result<(MutableState<AsyncValue<V>>, Resolver<V>)> {
        let state = self.mutable_state_with(AsyncValue::Pending, Some(true), Equivalence::never(), None)?;
        let resolver = Resolver {
            state: state.id(),
            inbox: self.inner().inbox.clone(),
            _marker: PhantomData,
        };
        Ok((state, resolver))
    }
}
