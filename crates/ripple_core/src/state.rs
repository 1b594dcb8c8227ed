//! State cells
//!
//! A state cell is the addressable unit of change. Three kinds exist:
//!
//! - **Scalar** ([`MutableState<V>`]): writes are journaled and applied by the
//!   next `update_snapshot`.
//! - **Array** ([`ArrayState<T>`]): a `Vec<T>` mutated in place through guarded
//!   accessors that copy the committed value into the journal on first write.
//! - **Parameter** ([`ReadState<V>`] handed out by a scope): updated directly by
//!   the owning scope before it decides whether to recompute.
//!
//! The kinds share the internal [`Cell`] interface so the manager reconciles
//! them without looking at their concrete type. Handles are cheap to clone and
//! only hold a weak reference to the manager plus the arena key.
//!
//! ```ignore
//! let manager = StateManager::new();
//! let count = manager.mutable_state(0, Some(true))?;
//!
//! count.set(1)?;
//! assert_eq!(count.value()?, 1); // the journaled value is visible right away
//!
//! manager.sync_changes();
//! manager.update_snapshot()?;    // ...and committed here
//! assert!(count.modified()?);
//! ```

use slotmap::new_key_type;
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use crate::dependency::Dependencies;
use crate::error::{Result, RuntimeError};
use crate::manager::{ManagerInner, StateManager};
use crate::scope::ScopeId;

new_key_type! {
    /// Unique identifier for a state cell
    pub struct StateId;
}

/// The closed set of cell kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CellKind {
    Scalar,
    Array,
    Parameter,
}

// =============================================================================
// EQUIVALENCE / TRACKING
// =============================================================================

/// Decides whether a new value is a real change.
///
/// Without a function every applied write counts as modified. A function may
/// downgrade a write to "not modified"; it never upgrades one.
pub struct Equivalence<V>(Option<Rc<dyn Fn(&V, &V) -> bool>>);

impl<V> Equivalence<V> {
    /// Every write is a change
    pub fn never() -> Self {
        Equivalence(None)
    }

    /// Custom equivalence
    pub fn new(equivalent: impl Fn(&V, &V) -> bool + 'static) -> Self {
        Equivalence(Some(Rc::new(equivalent)))
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn equivalent(&self, old: &V, new: &V) -> bool {
        self.0.as_ref().is_some_and(|f| f(old, new))
    }
}

impl<V: PartialEq + 'static> Equivalence<V> {
    /// Equal values (by `PartialEq`) are not a change
    pub fn by_eq() -> Self {
        Equivalence::new(|a: &V, b: &V| a == b)
    }
}

impl<V> Clone for Equivalence<V> {
    fn clone(&self) -> Self {
        Equivalence(self.0.clone())
    }
}

impl<V> Default for Equivalence<V> {
    fn default() -> Self {
        Equivalence::never()
    }
}

impl<V> fmt::Debug for Equivalence<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Equivalence")
            .field(&if self.is_set() { "custom" } else { "never" })
            .finish()
    }
}

/// Intercepts values entering a scalar cell
pub trait ValueTracker<V> {
    /// Called once with the initial value
    fn on_create(&self, value: V) -> V {
        value
    }

    /// Called with every written value before it is journaled
    fn on_update(&self, value: V) -> V {
        value
    }
}

// =============================================================================
// CELLS
// =============================================================================

/// Interface shared by every cell kind
pub(crate) trait Cell {
    fn kind(&self) -> CellKind;

    /// The committed value
    fn snapshot(&self) -> &dyn Any;

    /// Apply a pending journal value and report whether the committed value
    /// changed. `None` means nothing was written since the last sync.
    fn reconcile(&mut self, pending: Option<Box<dyn Any>>) -> bool;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub(crate) struct ScalarCell<V> {
    pub snapshot: V,
    pub equivalence: Equivalence<V>,
    pub tracker: Option<Rc<dyn ValueTracker<V>>>,
}

impl<V: 'static> Cell for ScalarCell<V> {
    fn kind(&self) -> CellKind {
        CellKind::Scalar
    }

    fn snapshot(&self) -> &dyn Any {
        &self.snapshot
    }

    fn reconcile(&mut self, pending: Option<Box<dyn Any>>) -> bool {
        let Some(value) = pending.and_then(|value| value.downcast::<V>().ok()) else {
            return false;
        };
        let modified = !self.equivalence.equivalent(&self.snapshot, &value);
        self.snapshot = *value;
        modified
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) struct ArrayCell<T> {
    pub snapshot: Vec<T>,
    pub item_equivalence: Equivalence<T>,
}

impl<T: 'static> ArrayCell<T> {
    fn same_items(&self, other: &[T]) -> bool {
        self.snapshot.len() == other.len()
            && self
                .snapshot
                .iter()
                .zip(other)
                .all(|(a, b)| self.item_equivalence.equivalent(a, b))
    }
}

impl<T: 'static> Cell for ArrayCell<T> {
    fn kind(&self) -> CellKind {
        CellKind::Array
    }

    fn snapshot(&self) -> &dyn Any {
        &self.snapshot
    }

    fn reconcile(&mut self, pending: Option<Box<dyn Any>>) -> bool {
        let Some(items) = pending.and_then(|value| value.downcast::<Vec<T>>().ok()) else {
            return false;
        };
        let modified = !self.same_items(&items);
        self.snapshot = *items;
        modified
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) struct ParamCell<V> {
    pub snapshot: V,
}

impl<V: 'static> ParamCell<V> {
    /// Replace the value directly, returning whether it changed
    pub fn update(&mut self, value: V, equivalence: &Equivalence<V>) -> bool {
        let modified = !equivalence.equivalent(&self.snapshot, &value);
        self.snapshot = value;
        modified
    }
}

impl<V: 'static> Cell for ParamCell<V> {
    fn kind(&self) -> CellKind {
        CellKind::Parameter
    }

    fn snapshot(&self) -> &dyn Any {
        &self.snapshot
    }

    fn reconcile(&mut self, _pending: Option<Box<dyn Any>>) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Who releases a state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StateOwner {
    Global,
    Scope(ScopeId),
    Param(ScopeId),
}

/// Arena entry of a state cell
pub(crate) struct StateSlot {
    pub cell: Box<dyn Cell>,
    pub dependencies: Dependencies,
    pub modified: bool,
    /// Set when no write happened since the last reconcile
    pub synced: bool,
    pub name: Option<String>,
    pub owner: StateOwner,
}

impl StateSlot {
    pub fn new(cell: Box<dyn Cell>, name: Option<String>, owner: StateOwner) -> Self {
        Self {
            cell,
            dependencies: Dependencies::new(),
            modified: false,
            synced: true,
            name,
            owner,
        }
    }

    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| "<unnamed>".to_string())
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Read access shared by every state handle
pub trait State<V> {
    fn id(&self) -> StateId;

    /// Current value; registers the computing scope as a dependent
    fn value(&self) -> Result<V>;

    /// Whether the last update pass changed the value
    fn modified(&self) -> Result<bool>;
}

fn upgrade(manager: &Weak<ManagerInner>) -> Result<StateManager> {
    manager
        .upgrade()
        .map(StateManager::from_inner)
        .ok_or(RuntimeError::DisposedState)
}

/// A journaled scalar state
pub struct MutableState<V> {
    id: StateId,
    manager: Weak<ManagerInner>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for MutableState<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            manager: self.manager.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> fmt::Debug for MutableState<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MutableState").field(&self.id).finish()
    }
}

impl<V: Clone + 'static> MutableState<V> {
    pub(crate) fn new(id: StateId, manager: Weak<ManagerInner>) -> Self {
        Self {
            id,
            manager,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    /// Current value; registers the computing scope as a dependent
    pub fn value(&self) -> Result<V> {
        upgrade(&self.manager)?.read_state(self.id, true, V::clone)
    }

    /// Current value without registering a dependency
    pub fn peek(&self) -> Result<V> {
        upgrade(&self.manager)?.read_state(self.id, false, V::clone)
    }

    /// Borrow the current value. The closure must not call back into the manager.
    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> Result<R> {
        upgrade(&self.manager)?.read_state(self.id, true, f)
    }

    /// Journal a new value
    pub fn set(&self, value: V) -> Result<()> {
        upgrade(&self.manager)?.write_state(self.id, value)
    }

    /// Journal a value computed from the current one
    pub fn update(&self, f: impl FnOnce(&V) -> V) -> Result<()> {
        let manager = upgrade(&self.manager)?;
        let next = manager.read_state(self.id, false, f)?;
        manager.write_state(self.id, next)
    }

    pub fn modified(&self) -> Result<bool> {
        upgrade(&self.manager)?.state_modified(self.id)
    }

    /// Read-only view of this state
    pub fn as_read(&self) -> ReadState<V> {
        ReadState::new(self.id, self.manager.clone())
    }

    pub fn dispose(&self) -> Result<()> {
        upgrade(&self.manager)?.dispose_state(self.id)
    }

    pub fn is_disposed(&self) -> bool {
        self.manager
            .upgrade()
            .map_or(true, |inner| !StateManager::from_inner(inner).contains_state(self.id))
    }
}

impl<V: Clone + 'static> State<V> for MutableState<V> {
    fn id(&self) -> StateId {
        self.id
    }

    fn value(&self) -> Result<V> {
        MutableState::value(self)
    }

    fn modified(&self) -> Result<bool> {
        MutableState::modified(self)
    }
}

/// A journaled array state with copy-on-first-write mutators
pub struct ArrayState<T> {
    id: StateId,
    manager: Weak<ManagerInner>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ArrayState<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            manager: self.manager.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ArrayState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArrayState").field(&self.id).finish()
    }
}

impl<T: Clone + 'static> ArrayState<T> {
    pub(crate) fn new(id: StateId, manager: Weak<ManagerInner>) -> Self {
        Self {
            id,
            manager,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    /// Copy of the current items; registers the computing scope as a dependent
    pub fn value(&self) -> Result<Vec<T>> {
        self.with(|items| items.to_vec())
    }

    /// Borrow the current items. The closure must not call back into the manager.
    pub fn with<R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        upgrade(&self.manager)?.read_state(self.id, true, |items: &Vec<T>| f(items))
    }

    pub fn len(&self) -> Result<usize> {
        self.with(<[T]>::len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.with(<[T]>::is_empty)
    }

    pub fn get(&self, index: usize) -> Result<Option<T>> {
        self.with(|items| items.get(index).cloned())
    }

    /// Item at `index`, counting from the end when negative
    pub fn at(&self, index: isize) -> Result<Option<T>> {
        self.with(|items| {
            let resolved = if index < 0 {
                items.len().checked_sub(index.unsigned_abs())
            } else {
                Some(index as usize)
            };
            resolved.and_then(|i| items.get(i)).cloned()
        })
    }

    /// Replace the whole array
    pub fn set(&self, items: Vec<T>) -> Result<()> {
        upgrade(&self.manager)?.write_state(self.id, items)
    }

    /// Mutate the journaled copy of the array
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> Result<R> {
        upgrade(&self.manager)?.mutate_array(self.id, f)
    }

    pub fn push(&self, item: T) -> Result<()> {
        self.mutate(|items| items.push(item))
    }

    pub fn pop(&self) -> Result<Option<T>> {
        self.mutate(Vec::pop)
    }

    /// Remove the first item
    pub fn shift(&self) -> Result<Option<T>> {
        self.mutate(|items| (!items.is_empty()).then(|| items.remove(0)))
    }

    /// Insert an item at the front
    pub fn unshift(&self, item: T) -> Result<()> {
        self.mutate(|items| items.insert(0, item))
    }

    pub fn insert(&self, index: usize, item: T) -> Result<()> {
        self.mutate(|items| {
            let index = index.min(items.len());
            items.insert(index, item)
        })
    }

    pub fn remove(&self, index: usize) -> Result<Option<T>> {
        self.mutate(|items| (index < items.len()).then(|| items.remove(index)))
    }

    /// Replace the item at `index`; out-of-range indices are ignored
    pub fn set_at(&self, index: usize, item: T) -> Result<()> {
        self.mutate(|items| {
            if let Some(slot) = items.get_mut(index) {
                *slot = item;
            }
        })
    }

    /// Remove `delete_count` items starting at `start` and insert `insert` in
    /// their place, returning the removed items
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        insert: impl IntoIterator<Item = T>,
    ) -> Result<Vec<T>> {
        self.mutate(|items| {
            let start = start.min(items.len());
            let end = start.saturating_add(delete_count).min(items.len());
            items.splice(start..end, insert).collect()
        })
    }

    pub fn sort_by(&self, compare: impl FnMut(&T, &T) -> std::cmp::Ordering) -> Result<()> {
        self.mutate(|items| items.sort_by(compare))
    }

    pub fn reverse(&self) -> Result<()> {
        self.mutate(|items| items.reverse())
    }

    pub fn fill(&self, item: T) -> Result<()> {
        self.mutate(|items| items.fill(item))
    }

    pub fn truncate(&self, len: usize) -> Result<()> {
        self.mutate(|items| items.truncate(len))
    }

    pub fn clear(&self) -> Result<()> {
        self.mutate(Vec::clear)
    }

    pub fn modified(&self) -> Result<bool> {
        upgrade(&self.manager)?.state_modified(self.id)
    }

    pub fn dispose(&self) -> Result<()> {
        upgrade(&self.manager)?.dispose_state(self.id)
    }
}

impl<T: Clone + 'static> State<Vec<T>> for ArrayState<T> {
    fn id(&self) -> StateId {
        self.id
    }

    fn value(&self) -> Result<Vec<T>> {
        ArrayState::value(self)
    }

    fn modified(&self) -> Result<bool> {
        ArrayState::modified(self)
    }
}

/// Read-only state handle (scope parameters, named lookups)
pub struct ReadState<V> {
    id: StateId,
    manager: Weak<ManagerInner>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for ReadState<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            manager: self.manager.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> fmt::Debug for ReadState<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadState").field(&self.id).finish()
    }
}

impl<V: Clone + 'static> ReadState<V> {
    pub(crate) fn new(id: StateId, manager: Weak<ManagerInner>) -> Self {
        Self {
            id,
            manager,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn value(&self) -> Result<V> {
        upgrade(&self.manager)?.read_state(self.id, true, V::clone)
    }

    pub fn with<R>(&self, f: impl FnOnce(&V) -> R) -> Result<R> {
        upgrade(&self.manager)?.read_state(self.id, true, f)
    }

    pub fn modified(&self) -> Result<bool> {
        upgrade(&self.manager)?.state_modified(self.id)
    }
}

impl<V: Clone + 'static> State<V> for ReadState<V> {
    fn id(&self) -> StateId {
        self.id
    }

    fn value(&self) -> Result<V> {
        ReadState::value(self)
    }

    fn modified(&self) -> Result<bool> {
        ReadState::modified(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_without_equivalence_every_write_modifies() {
        let mut cell = ScalarCell {
            snapshot: 1,
            equivalence: Equivalence::never(),
            tracker: None,
        };
        assert!(!cell.reconcile(None));
        assert!(cell.reconcile(Some(Box::new(1))));
        assert_eq!(cell.snapshot, 1);
    }

    #[test]
    fn test_scalar_equivalence_downgrades() {
        let mut cell = ScalarCell {
            snapshot: 1,
            equivalence: Equivalence::new(|_: &i32, _: &i32| true),
            tracker: None,
        };
        assert!(!cell.reconcile(Some(Box::new(42))));
        assert_eq!(cell.snapshot, 42);
    }

    #[test]
    fn test_scalar_by_eq() {
        let mut cell = ScalarCell {
            snapshot: String::from("a"),
            equivalence: Equivalence::by_eq(),
            tracker: None,
        };
        assert!(!cell.reconcile(Some(Box::new(String::from("a")))));
        assert!(cell.reconcile(Some(Box::new(String::from("b")))));
    }

    #[test]
    fn test_scalar_ignores_foreign_type() {
        let mut cell = ScalarCell {
            snapshot: 1i32,
            equivalence: Equivalence::never(),
            tracker: None,
        };
        assert!(!cell.reconcile(Some(Box::new("text"))));
        assert_eq!(cell.snapshot, 1);
    }

    #[test]
    fn test_array_compares_items() {
        let mut cell = ArrayCell {
            snapshot: vec![1, 2, 3],
            item_equivalence: Equivalence::by_eq(),
        };
        assert!(!cell.reconcile(Some(Box::new(vec![1, 2, 3]))));
        assert!(cell.reconcile(Some(Box::new(vec![1, 2]))));
        assert!(cell.reconcile(Some(Box::new(vec![1, 5]))));
        assert_eq!(cell.kind(), CellKind::Array);
    }

    #[test]
    fn test_param_update() {
        let mut cell = ParamCell { snapshot: 3 };
        assert!(!cell.update(3, &Equivalence::by_eq()));
        assert!(cell.update(4, &Equivalence::by_eq()));
        assert!(cell.update(4, &Equivalence::never()));
        assert!(!cell.reconcile(Some(Box::new(5))));
        assert_eq!(cell.snapshot, 4);
    }
}
