//! State manager
//!
//! Owns every registry of the runtime: state cells, scopes, tree nodes, the
//! change journal, the dirty-root set, recycle pools and the deferred callback
//! queue. A manager is single-threaded (`Rc` inside) and cheap to clone; state
//! handles keep a weak reference to it.
//!
//! One update cycle:
//!
//! 1. writes land in the live journal chunk,
//! 2. [`StateManager::sync_changes`] seals the chunk,
//! 3. [`StateManager::update_snapshot`] reconciles every cell against the
//!    sealed chunks (phase 1), then recomputes the dirty roots (phase 2),
//! 4. the integrator recomputes its trees (`ComputableState::value`) and drains
//!    [`StateManager::call_callbacks`] whenever it wants effects to run.

use indexmap::IndexSet;
use rustc_hash::{FxBuildHasher, FxHashMap};
use slotmap::SlotMap;
use std::any::{type_name, Any};
use std::cell::{Cell, Ref, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::config::ManagerConfig;
use crate::error::{Result, RuntimeError};
use crate::journal::Journal;
use crate::key::CallsiteKey;
use crate::recycle::{PoolKey, RecyclePool};
use crate::scope::{scope_is_live, InternalScope, Owned, ScopeId, ScopeOptions, ScopeSlot};
use crate::state::{
    ArrayCell, ArrayState, CellKind, Equivalence, MutableState, ReadState, ScalarCell, StateId,
    StateOwner, StateSlot, ValueTracker,
};
use crate::tree::{NodeContent, NodeId, NodeTree};

/// A value delivered from outside the update cycle
pub(crate) type Delivery = (StateId, Box<dyn Any + Send>);

pub(crate) type Inbox = Arc<Mutex<Vec<Delivery>>>;

pub(crate) struct ManagerInner {
    pub config: ManagerConfig,
    pub states: RefCell<SlotMap<StateId, StateSlot>>,
    pub scopes: RefCell<SlotMap<ScopeId, ScopeSlot>>,
    pub tree: RefCell<NodeTree>,
    pub journal: RefCell<Journal>,
    pub globals: RefCell<FxHashMap<String, StateId>>,
    pub dirty: RefCell<IndexSet<ScopeId, FxBuildHasher>>,
    pub pools: RefCell<FxHashMap<NodeId, RecyclePool<PoolKey, ScopeId>>>,
    pub callbacks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    pub inbox: Inbox,
    pub current: Cell<Option<ScopeId>>,
    pub frozen: Cell<bool>,
    /// Name of the named state whose initializer is running
    pub creating: RefCell<Option<String>>,
    pub needs_update: Cell<bool>,
}

/// Counters describing the registries of a manager
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub state_count: usize,
    pub scope_count: usize,
    pub node_count: usize,
    pub dirty_scopes: usize,
    pub pooled_scopes: usize,
    pub pending_callbacks: usize,
    pub journal_chunks: usize,
}

/// Orchestrates state cells, scopes and the two-phase update protocol
#[derive(Clone)]
pub struct StateManager {
    inner: Rc<ManagerInner>,
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static INSTANCE: RefCell<Option<StateManager>> = const { RefCell::new(None) };
}

impl StateManager {
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        Self {
            inner: Rc::new(ManagerInner {
                config,
                states: RefCell::new(SlotMap::with_key()),
                scopes: RefCell::new(SlotMap::with_key()),
                tree: RefCell::new(NodeTree::new()),
                journal: RefCell::new(Journal::new()),
                globals: RefCell::new(FxHashMap::default()),
                dirty: RefCell::new(IndexSet::default()),
                pools: RefCell::new(FxHashMap::default()),
                callbacks: RefCell::new(VecDeque::new()),
                inbox: Arc::new(Mutex::new(Vec::new())),
                current: Cell::new(None),
                frozen: Cell::new(false),
                creating: RefCell::new(None),
                needs_update: Cell::new(false),
            }),
        }
    }

    /// The manager of the calling thread, created on first use
    pub fn instance() -> StateManager {
        INSTANCE.with(|slot| slot.borrow_mut().get_or_insert_with(StateManager::new).clone())
    }

    /// Drop the manager of the calling thread; the next `instance()` call
    /// creates a fresh one
    pub fn reset_instance() {
        let previous = INSTANCE.with(|slot| slot.borrow_mut().take());
        if previous.is_some() {
            debug!("thread state manager reset");
        }
    }

    pub(crate) fn from_inner(inner: Rc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &ManagerInner {
        &self.inner
    }

    pub(crate) fn weak(&self) -> Weak<ManagerInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Returns true when a write happened since the last update pass
    pub fn is_update_needed(&self) -> bool {
        self.inner.needs_update.get()
    }

    /// Returns true while reads are served from committed snapshots
    pub fn frozen(&self) -> bool {
        self.inner.frozen.get()
    }

    /// Scope currently being computed
    pub fn current_scope(&self) -> Option<ScopeId> {
        self.inner.current.get()
    }

    /// Borrow the node tree. The borrow must end before the next manager call.
    pub fn tree(&self) -> Ref<'_, NodeTree> {
        self.inner.tree.borrow()
    }

    /// Read the content of a node
    pub fn with_node<N: 'static, R>(&self, node: NodeId, f: impl FnOnce(&N) -> R) -> Result<R> {
        let tree = self.inner.tree.borrow();
        if !tree.contains(node) {
            return Err(RuntimeError::DisposedNode);
        }
        tree.content::<N>(node)
            .map(f)
            .ok_or(RuntimeError::TypeMismatch(type_name::<N>()))
    }

    /// Modify the content of a node
    pub fn with_node_mut<N: 'static, R>(&self, node: NodeId, f: impl FnOnce(&mut N) -> R) -> Result<R> {
        let mut tree = self.inner.tree.borrow_mut();
        if !tree.contains(node) {
            return Err(RuntimeError::DisposedNode);
        }
        tree.content_mut::<N>(node)
            .map(f)
            .ok_or(RuntimeError::TypeMismatch(type_name::<N>()))
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            state_count: self.inner.states.borrow().len(),
            scope_count: self.inner.scopes.borrow().len(),
            node_count: self.inner.tree.borrow().len(),
            dirty_scopes: self.inner.dirty.borrow().len(),
            pooled_scopes: self.inner.pools.borrow().values().map(RecyclePool::len).sum(),
            pending_callbacks: self.inner.callbacks.borrow().len(),
            journal_chunks: self.inner.journal.borrow().chunk_count(),
        }
    }

    // =========================================================================
    // STATE CREATION
    // =========================================================================

    /// Create a scalar state compared with `PartialEq`: writing an equal value
    /// is not a change. `global = Some(true)` makes it independent of any
    /// scope; otherwise it belongs to the current (remembered) scope.
    pub fn mutable_state<V: Clone + PartialEq + 'static>(
        &self,
        initial: V,
        global: Option<bool>,
    ) -> Result<MutableState<V>> {
        self.mutable_state_with(initial, global, Equivalence::by_eq(), None)
    }

    pub fn mutable_state_with<V: Clone + 'static>(
        &self,
        initial: V,
        global: Option<bool>,
        equivalence: Equivalence<V>,
        tracker: Option<Rc<dyn ValueTracker<V>>>,
    ) -> Result<MutableState<V>> {
        let owner = self.resolve_owner(global, false)?;
        let snapshot = match &tracker {
            Some(tracker) => tracker.on_create(initial),
            None => initial,
        };
        let cell = ScalarCell {
            snapshot,
            equivalence,
            tracker,
        };
        let id = self.insert_state(Box::new(cell), None, owner);
        Ok(MutableState::new(id, self.weak()))
    }

    /// Create an array state compared element-wise with `PartialEq`
    pub fn array_state<T: Clone + PartialEq + 'static>(
        &self,
        initial: Vec<T>,
        global: Option<bool>,
    ) -> Result<ArrayState<T>> {
        self.array_state_with(initial, global, Equivalence::by_eq())
    }

    pub fn array_state_with<T: Clone + 'static>(
        &self,
        initial: Vec<T>,
        global: Option<bool>,
        item_equivalence: Equivalence<T>,
    ) -> Result<ArrayState<T>> {
        let owner = self.resolve_owner(global, false)?;
        let cell = ArrayCell {
            snapshot: initial,
            item_equivalence,
        };
        let id = self.insert_state(Box::new(cell), None, owner);
        Ok(ArrayState::new(id, self.weak()))
    }

    /// Get or create a named state. Global names live in the manager table,
    /// local names in the current scope.
    pub fn named_state<V: Clone + PartialEq + 'static>(
        &self,
        name: &str,
        create: impl FnOnce() -> V,
        global: Option<bool>,
    ) -> Result<MutableState<V>> {
        let owner = self.resolve_owner(global, true)?;
        let existing = match owner {
            StateOwner::Scope(scope) => self
                .inner
                .scopes
                .borrow()
                .get(scope)
                .and_then(|slot| slot.named.as_ref()?.get(name).copied()),
            _ => self.inner.globals.borrow().get(name).copied(),
        };
        if let Some(id) = existing {
            self.expect_type::<V>(id)?;
            return Ok(MutableState::new(id, self.weak()));
        }

        self.check_creation()?;
        let previous = self.inner.creating.replace(Some(name.to_string()));
        let initial = create();
        *self.inner.creating.borrow_mut() = previous;

        let cell = ScalarCell {
            snapshot: initial,
            equivalence: Equivalence::by_eq(),
            tracker: None,
        };
        let id = self.insert_state(Box::new(cell), Some(name.to_string()), owner);
        match owner {
            StateOwner::Scope(scope) => {
                if let Some(slot) = self.inner.scopes.borrow_mut().get_mut(scope) {
                    slot.named
                        .get_or_insert_with(Default::default)
                        .insert(name.to_string(), id);
                }
            }
            _ => {
                self.inner.globals.borrow_mut().insert(name.to_string(), id);
            }
        }
        Ok(MutableState::new(id, self.weak()))
    }

    /// Look up a named state. Local lookups walk the scope ancestry; global
    /// lookups use the manager table; `None` tries both in that order.
    pub fn state_by<V: Clone + 'static>(&self, name: &str, global: Option<bool>) -> Result<ReadState<V>> {
        let local = if global == Some(true) {
            None
        } else {
            self.lookup_local(name)
        };
        let found = local.or_else(|| {
            (global != Some(false))
                .then(|| self.inner.globals.borrow().get(name).copied())
                .flatten()
        });
        let id = found.ok_or_else(|| RuntimeError::UnknownName(name.to_string()))?;
        self.expect_type::<V>(id)?;
        Ok(ReadState::new(id, self.weak()))
    }

    /// Value of a named state
    pub fn value_by<V: Clone + 'static>(&self, name: &str, global: Option<bool>) -> Result<V> {
        self.state_by::<V>(name, global)?.value()
    }

    fn lookup_local(&self, name: &str) -> Option<StateId> {
        let scopes = self.inner.scopes.borrow();
        let mut current = self.inner.current.get();
        while let Some(id) = current {
            let slot = scopes.get(id)?;
            if let Some(state) = slot.named.as_ref().and_then(|named| named.get(name)) {
                return Some(*state);
            }
            current = slot.parent;
        }
        None
    }

    fn expect_type<V: 'static>(&self, id: StateId) -> Result<()> {
        let states = self.inner.states.borrow();
        let slot = states.get(id).ok_or(RuntimeError::DisposedState)?;
        if slot.cell.snapshot().is::<V>() {
            Ok(())
        } else {
            Err(RuntimeError::TypeMismatch(type_name::<V>()))
        }
    }

    /// Decide who owns a new state
    fn resolve_owner(&self, global: Option<bool>, named: bool) -> Result<StateOwner> {
        self.check_creation()?;
        if global == Some(true) {
            return Ok(StateOwner::Global);
        }
        let current = self.inner.current.get().ok_or(RuntimeError::TopLevelState)?;
        if !named {
            let remembered = self
                .inner
                .scopes
                .borrow()
                .get(current)
                .is_some_and(|slot| slot.once);
            if !remembered {
                return Err(RuntimeError::UnrememberedLocalState);
            }
        }
        Ok(StateOwner::Scope(current))
    }

    fn insert_state(&self, cell: Box<dyn crate::state::Cell>, name: Option<String>, owner: StateOwner) -> StateId {
        let id = self
            .inner
            .states
            .borrow_mut()
            .insert(StateSlot::new(cell, name, owner));
        if let StateOwner::Scope(scope) = owner {
            if let Some(slot) = self.inner.scopes.borrow_mut().get_mut(scope) {
                slot.owned.push(Owned::State(id));
            }
        }
        id
    }

    /// Fails while a named state initializer is running
    pub(crate) fn check_creation(&self) -> Result<()> {
        match self.inner.creating.borrow().as_ref() {
            Some(name) => Err(RuntimeError::CreationProhibited(name.clone())),
            None => Ok(()),
        }
    }

    // =========================================================================
    // STATE ACCESS
    // =========================================================================

    /// Computing scope that should record reads
    pub(crate) fn tracking_scope(&self) -> Option<ScopeId> {
        let current = self.inner.current.get()?;
        let scopes = self.inner.scopes.borrow();
        let slot = scopes.get(current)?;
        (slot.computing && !slot.once && !slot.disposed).then_some(current)
    }

    fn track_state(&self, id: StateId) {
        let Some(reader) = self.tracking_scope() else {
            return;
        };
        let scopes = self.inner.scopes.borrow();
        if let Some(slot) = self.inner.states.borrow_mut().get_mut(id) {
            slot.dependencies
                .register(reader, |dep| scope_is_live(&scopes, dep));
        }
    }

    /// Read a state: the newest journaled value unless frozen, else the
    /// committed snapshot
    pub(crate) fn read_state<V: 'static, R>(
        &self,
        id: StateId,
        track: bool,
        f: impl FnOnce(&V) -> R,
    ) -> Result<R> {
        if track {
            self.track_state(id);
        }
        let states = self.inner.states.borrow();
        let slot = states.get(id).ok_or(RuntimeError::DisposedState)?;
        if slot.cell.kind() != CellKind::Parameter && !self.inner.frozen.get() {
            let journal = self.inner.journal.borrow();
            if let Some(pending) = journal.latest(id) {
                return pending
                    .downcast_ref::<V>()
                    .map(f)
                    .ok_or(RuntimeError::TypeMismatch(type_name::<V>()));
            }
        }
        slot.cell
            .snapshot()
            .downcast_ref::<V>()
            .map(f)
            .ok_or(RuntimeError::TypeMismatch(type_name::<V>()))
    }

    /// Fails when a scope is computing and the state already has live readers
    fn check_modify(&self, slot: &StateSlot) -> Result<()> {
        let Some(current) = self.inner.current.get() else {
            return Ok(());
        };
        let scopes = self.inner.scopes.borrow();
        match scopes.get(current) {
            Some(scope) if scope.computing => {
                if slot.dependencies.has_live(|dep| scope_is_live(&scopes, dep)) {
                    Err(RuntimeError::ModifyDuringComputation(slot.label(), scope.key))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Journal a new value for a scalar or array state
    pub(crate) fn write_state<V: 'static>(&self, id: StateId, value: V) -> Result<()> {
        let tracker = {
            let states = self.inner.states.borrow();
            let slot = states.get(id).ok_or(RuntimeError::DisposedState)?;
            if slot.cell.kind() == CellKind::Parameter {
                return Err(RuntimeError::ParameterWrite(slot.label()));
            }
            if !slot.cell.snapshot().is::<V>() {
                return Err(RuntimeError::TypeMismatch(type_name::<V>()));
            }
            self.check_modify(slot)?;
            slot.cell
                .as_any()
                .downcast_ref::<ScalarCell<V>>()
                .and_then(|cell| cell.tracker.clone())
        };
        let value = match tracker {
            Some(tracker) => tracker.on_update(value),
            None => value,
        };
        self.inner.journal.borrow_mut().add_change(id, Box::new(value));
        self.mark_pending(id);
        Ok(())
    }

    /// Run `f` on the journaled copy of an array, copying it on first write
    pub(crate) fn mutate_array<T: Clone + 'static, R>(
        &self,
        id: StateId,
        f: impl FnOnce(&mut Vec<T>) -> R,
    ) -> Result<R> {
        let result = {
            let states = self.inner.states.borrow();
            let slot = states.get(id).ok_or(RuntimeError::DisposedState)?;
            if slot.cell.kind() != CellKind::Array {
                return Err(RuntimeError::TypeMismatch(type_name::<Vec<T>>()));
            }
            self.check_modify(slot)?;

            let mut journal = self.inner.journal.borrow_mut();
            if !journal.live_contains(id) {
                let copy = journal
                    .latest(id)
                    .unwrap_or_else(|| slot.cell.snapshot())
                    .downcast_ref::<Vec<T>>()
                    .cloned()
                    .ok_or(RuntimeError::TypeMismatch(type_name::<Vec<T>>()))?;
                journal.add_change(id, Box::new(copy));
            }
            let items = journal
                .live_mut(id)
                .and_then(|value| value.downcast_mut::<Vec<T>>())
                .ok_or(RuntimeError::TypeMismatch(type_name::<Vec<T>>()))?;
            f(items)
        };
        self.mark_pending(id);
        Ok(result)
    }

    fn mark_pending(&self, id: StateId) {
        if let Some(slot) = self.inner.states.borrow_mut().get_mut(id) {
            slot.synced = false;
        }
        self.inner.needs_update.set(true);
    }

    pub(crate) fn state_modified(&self, id: StateId) -> Result<bool> {
        self.inner
            .states
            .borrow()
            .get(id)
            .map(|slot| slot.modified)
            .ok_or(RuntimeError::DisposedState)
    }

    pub(crate) fn contains_state(&self, id: StateId) -> bool {
        self.inner.states.borrow().contains_key(id)
    }

    /// Explicit disposal through a handle
    pub(crate) fn dispose_state(&self, id: StateId) -> Result<()> {
        let (owner, name) = {
            let states = self.inner.states.borrow();
            let Some(slot) = states.get(id) else {
                return Ok(());
            };
            (slot.owner, slot.name.clone())
        };
        if let (StateOwner::Scope(scope), Some(name)) = (owner, name) {
            if let Some(named) = self
                .inner
                .scopes
                .borrow_mut()
                .get_mut(scope)
                .and_then(|slot| slot.named.as_mut())
            {
                named.remove(&name);
            }
        }
        self.release_state(id);
        Ok(())
    }

    /// Drop a state and everything recorded for it
    pub(crate) fn release_state(&self, id: StateId) {
        let Some(slot) = self.inner.states.borrow_mut().remove(id) else {
            return;
        };
        self.inner.journal.borrow_mut().forget(id);
        if let (StateOwner::Global, Some(name)) = (slot.owner, slot.name) {
            let mut globals = self.inner.globals.borrow_mut();
            if globals.get(&name) == Some(&id) {
                globals.remove(&name);
            }
        }
    }

    // =========================================================================
    // SCOPES
    // =========================================================================

    /// Find, reuse or create a child of the current scope
    pub fn scope<V: Clone + 'static>(&self, key: CallsiteKey, options: ScopeOptions) -> Result<InternalScope<'_, V>> {
        let id = self.child_scope(key, options)?;
        Ok(InternalScope::new(self, id))
    }

    /// Create a lazily computed value that tracks what it reads
    pub fn computable_state<V: Clone + 'static>(
        &self,
        compute: impl Fn(&StateManager) -> Result<V> + 'static,
    ) -> Result<ComputableState<V>> {
        self.computable_state_with(compute, Equivalence::never())
    }

    /// Computable whose recomputations producing an equivalent value leave
    /// its readers untouched
    pub fn computable_state_with<V: Clone + 'static>(
        &self,
        compute: impl Fn(&StateManager) -> Result<V> + 'static,
        equivalence: Equivalence<V>,
    ) -> Result<ComputableState<V>> {
        let owner = self.computable_owner()?;
        let options = ScopeOptions::new().compute(compute).equivalence(equivalence);
        let id = self.insert_root(CallsiteKey::default(), options, None, owner);
        Ok(ComputableState::new(id, self.weak()))
    }

    /// Attach a recomputation tree to `root`. `update` runs whenever the
    /// returned state is read after something it depends on changed.
    pub fn updatable_node<N: NodeContent + 'static>(
        &self,
        root: N,
        update: impl Fn(&StateManager) -> Result<()> + 'static,
    ) -> Result<ComputableState<NodeId>> {
        self.updatable_node_with_cleanup(root, update, |_| Ok(()))
    }

    pub fn updatable_node_with_cleanup<N: NodeContent + 'static>(
        &self,
        root: N,
        update: impl Fn(&StateManager) -> Result<()> + 'static,
        cleanup: impl FnOnce(&StateManager) -> Result<()> + 'static,
    ) -> Result<ComputableState<NodeId>> {
        self.check_creation()?;
        let owner = self.inner.current.get();
        let node = self.inner.tree.borrow_mut().create(root);
        let options = ScopeOptions::new()
            .compute(move |cx| {
                update(cx)?;
                Ok(node)
            })
            .cleanup(move |cx, _: Option<NodeId>| cleanup(cx));
        let id = self.insert_root(CallsiteKey::default(), options, Some(node), owner);
        Ok(ComputableState::new(id, self.weak()))
    }

    fn computable_owner(&self) -> Result<Option<ScopeId>> {
        self.check_creation()?;
        let Some(current) = self.inner.current.get() else {
            return Ok(None);
        };
        let remembered = self
            .inner
            .scopes
            .borrow()
            .get(current)
            .is_some_and(|slot| slot.once);
        if remembered {
            Ok(Some(current))
        } else {
            Err(RuntimeError::UnrememberedLocalState)
        }
    }

    fn insert_root(
        &self,
        key: CallsiteKey,
        options: ScopeOptions,
        node: Option<NodeId>,
        owner: Option<ScopeId>,
    ) -> ScopeId {
        let mut slot = ScopeSlot::new(key, None);
        slot.compute = options.compute;
        slot.cleanup = options.cleanup;
        slot.equivalence = options.equivalence;
        slot.node = node;
        let mut scopes = self.inner.scopes.borrow_mut();
        let id = scopes.insert(slot);
        if let Some(owner) = owner.and_then(|owner| scopes.get_mut(owner)) {
            owner.owned.push(Owned::Scope(id));
        }
        id
    }

    /// Recompute a root scope if it needs it. Returns whether a
    /// recomputation produced a modified value.
    pub(crate) fn refresh_scope(&self, id: ScopeId) -> Result<bool> {
        let Some(pass) = self.begin_scope(id)? else {
            return Ok(false);
        };
        let (compute, key) = {
            let scopes = self.inner.scopes.borrow();
            let slot = scopes.get(id).ok_or(RuntimeError::DisposedScope)?;
            (slot.compute.clone(), slot.key)
        };
        let compute = compute.ok_or(RuntimeError::NotComputed(key))?;
        let value = compute(self)?;
        pass.finish(value)?;
        Ok(self
            .inner
            .scopes
            .borrow()
            .get(id)
            .is_some_and(|slot| slot.modified))
    }

    fn computable_value<V: Clone + 'static>(&self, id: ScopeId) -> Result<V> {
        self.track_scope(id);
        self.refresh_scope(id)?;
        InternalScope::<V>::new(self, id).cached()
    }

    // =========================================================================
    // UPDATE PROTOCOL
    // =========================================================================

    /// Seal the journal chunk, folding in values delivered by resolvers
    pub fn sync_changes(&self) {
        self.drain_inbox();
        self.inner.journal.borrow_mut().set_marker();
    }

    fn drain_inbox(&self) {
        let deliveries = {
            let mut inbox = self.inner.inbox.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *inbox)
        };
        for (id, value) in deliveries {
            if !self.contains_state(id) {
                continue;
            }
            let value: Box<dyn Any> = value;
            self.inner.journal.borrow_mut().add_change(id, value);
            self.mark_pending(id);
        }
    }

    /// Apply the sealed journal chunks to every cell, then recompute dirty
    /// roots. Returns the number of modified cells plus modified roots.
    pub fn update_snapshot(&self) -> Result<usize> {
        if !self.inner.needs_update.get() && self.inner.dirty.borrow().is_empty() {
            return Ok(0);
        }

        let mut modified_states = 0;
        let mut invalidated = Vec::new();
        {
            let scopes = self.inner.scopes.borrow();
            let mut states = self.inner.states.borrow_mut();
            let mut journal = self.inner.journal.borrow_mut();
            {
                let mut changes = journal.changes();
                for (id, slot) in states.iter_mut() {
                    if slot.cell.kind() == CellKind::Parameter {
                        continue;
                    }
                    let modified = !slot.synced && slot.cell.reconcile(changes.take(id));
                    slot.modified = modified;
                    if modified {
                        modified_states += 1;
                    }
                    invalidated.extend(
                        slot.dependencies
                            .update(modified, |dep| scope_is_live(&scopes, dep)),
                    );
                }
            }
            journal.clear();
            for (id, slot) in states.iter_mut() {
                if !slot.synced {
                    slot.synced = !journal.live_contains(id);
                }
            }
            self.inner.needs_update.set(journal.has_live_changes());
        }
        for scope in invalidated {
            self.invalidate(scope);
        }

        let limit = self.inner.config.max_update_rounds;
        let mut rounds = 0;
        let mut modified_scopes = 0;
        loop {
            let next = self.inner.dirty.borrow_mut().shift_remove_index(0);
            let Some(root) = next else {
                break;
            };
            rounds += 1;
            if rounds > limit {
                self.inner.dirty.borrow_mut().clear();
                return Err(RuntimeError::UpdateLoop(limit));
            }
            if self.refresh_scope(root)? {
                modified_scopes += 1;
            }
        }

        debug!(
            "snapshot updated: {} states modified, {} of {} dirty roots modified",
            modified_states, modified_scopes, rounds
        );
        Ok(modified_states + modified_scopes)
    }

    // =========================================================================
    // CALLBACKS
    // =========================================================================

    /// Queue a callback for the next [`call_callbacks`](Self::call_callbacks)
    pub fn schedule_callback(&self, callback: impl FnOnce() + 'static) {
        self.inner.callbacks.borrow_mut().push_back(Box::new(callback));
    }

    /// Run the callbacks queued so far in FIFO order. Callbacks queued while
    /// draining wait for the next drain. Returns how many ran.
    pub fn call_callbacks(&self) -> usize {
        let batch: Vec<_> = self.inner.callbacks.borrow_mut().drain(..).collect();
        let count = batch.len();
        for callback in batch {
            callback();
        }
        if count > 0 {
            debug!("ran {} scheduled callbacks", count);
        }
        count
    }
}

// =============================================================================
// COMPUTABLE STATE
// =============================================================================

/// Handle on a lazily recomputed root scope
pub struct ComputableState<V> {
    id: ScopeId,
    manager: Weak<ManagerInner>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for ComputableState<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            manager: self.manager.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> fmt::Debug for ComputableState<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ComputableState").field(&self.id).finish()
    }
}

impl<V: Clone + 'static> ComputableState<V> {
    pub(crate) fn new(id: ScopeId, manager: Weak<ManagerInner>) -> Self {
        Self {
            id,
            manager,
            _marker: PhantomData,
        }
    }

    fn manager(&self) -> Result<StateManager> {
        self.manager
            .upgrade()
            .map(StateManager::from_inner)
            .ok_or(RuntimeError::DisposedScope)
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Current value, recomputed first when a dependency changed
    pub fn value(&self) -> Result<V> {
        self.manager()?.computable_value(self.id)
    }

    /// Whether the last recomputation produced a modified value
    pub fn modified(&self) -> Result<bool> {
        let manager = self.manager()?;
        let modified = manager.inner.scopes.borrow().get(self.id).map(|slot| slot.modified);
        modified.ok_or(RuntimeError::DisposedScope)
    }

    pub fn dispose(&self) -> Result<()> {
        self.manager()?.dispose_scope(self.id)
    }

    pub fn is_disposed(&self) -> bool {
        match self.manager.upgrade() {
            Some(inner) => {
                let live = inner.scopes.borrow().contains_key(self.id);
                !live
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn cycle(manager: &StateManager) -> usize {
        manager.sync_changes();
        manager.update_snapshot().unwrap()
    }

    #[test]
    fn test_nothing_written_returns_zero() {
        let manager = StateManager::new();
        assert_eq!(manager.update_snapshot().unwrap(), 0);
        let _state = manager.mutable_state(1, Some(true)).unwrap();
        assert_eq!(cycle(&manager), 0);
    }

    #[test]
    fn test_write_is_visible_before_and_committed_after_update() {
        let manager = StateManager::new();
        let state = manager.mutable_state(1, Some(true)).unwrap();
        state.set(2).unwrap();
        assert_eq!(state.value().unwrap(), 2);
        assert!(manager.is_update_needed());

        assert_eq!(cycle(&manager), 1);
        assert!(state.modified().unwrap());
        assert!(!manager.is_update_needed());

        assert_eq!(cycle(&manager), 0);
        assert_eq!(state.value().unwrap(), 2);
    }

    #[test]
    fn test_write_after_marker_waits_for_next_cycle() {
        let manager = StateManager::new();
        let state = manager.mutable_state(1, Some(true)).unwrap();
        state.set(2).unwrap();
        manager.sync_changes();
        state.set(3).unwrap();

        assert_eq!(manager.update_snapshot().unwrap(), 1);
        assert!(manager.is_update_needed());
        assert_eq!(state.value().unwrap(), 3);

        assert_eq!(cycle(&manager), 1);
        assert_eq!(state.value().unwrap(), 3);
    }

    #[test]
    fn test_exactly_once_cascade() {
        let manager = StateManager::new();
        let a = manager.mutable_state(1, Some(true)).unwrap();
        let runs = Rc::new(RefCell::new((0, 0)));

        let b = {
            let a = a.clone();
            let runs = runs.clone();
            manager
                .computable_state(move |_| {
                    runs.borrow_mut().0 += 1;
                    Ok(a.value()? + 1)
                })
                .unwrap()
        };
        let c = {
            let b = b.clone();
            let runs = runs.clone();
            manager
                .computable_state(move |_| {
                    runs.borrow_mut().1 += 1;
                    Ok(b.value()? * 2)
                })
                .unwrap()
        };

        assert_eq!(c.value().unwrap(), 4);
        assert_eq!(*runs.borrow(), (1, 1));

        a.set(5).unwrap();
        cycle(&manager);
        assert_eq!(c.value().unwrap(), 12);
        assert_eq!(c.value().unwrap(), 12);
        assert_eq!(*runs.borrow(), (2, 2));
    }

    #[test]
    fn test_writing_equal_value_is_unmodified() {
        let manager = StateManager::new();
        let state = manager.mutable_state(1, Some(true)).unwrap();
        let runs = Rc::new(RefCell::new(0));
        let derived = {
            let state = state.clone();
            let runs = runs.clone();
            manager
                .computable_state(move |_| {
                    *runs.borrow_mut() += 1;
                    state.value()
                })
                .unwrap()
        };
        derived.value().unwrap();

        state.set(1).unwrap();
        assert_eq!(cycle(&manager), 0);
        assert!(!state.modified().unwrap());
        derived.value().unwrap();
        assert_eq!(*runs.borrow(), 1);

        state.set(2).unwrap();
        assert_eq!(cycle(&manager), 1);
        assert_eq!(derived.value().unwrap(), 2);
        assert_eq!(*runs.borrow(), 2);
    }

    #[test]
    fn test_failed_dirty_root_recovers() {
        let manager = StateManager::new();
        let source = manager.mutable_state(1, Some(true)).unwrap();
        let scaled = {
            let source = source.clone();
            manager
                .computable_state(move |_| {
                    let value = source.value()?;
                    if value < 0 {
                        return Err(RuntimeError::callback("negative"));
                    }
                    Ok(value * 10)
                })
                .unwrap()
        };
        let reader = {
            let scaled = scaled.clone();
            manager.computable_state(move |_| scaled.value()).unwrap()
        };
        assert_eq!(reader.value().unwrap(), 10);

        source.set(-1).unwrap();
        manager.sync_changes();
        assert_eq!(
            manager.update_snapshot().err(),
            Some(RuntimeError::callback("negative"))
        );

        source.set(7).unwrap();
        assert_eq!(cycle(&manager), 1);
        assert_eq!(reader.value().unwrap(), 70);

        source.set(8).unwrap();
        cycle(&manager);
        assert_eq!(reader.value().unwrap(), 80);
    }

    struct Clamp;

    impl ValueTracker<i32> for Clamp {
        fn on_create(&self, value: i32) -> i32 {
            value.max(0)
        }

        fn on_update(&self, value: i32) -> i32 {
            value.min(100)
        }
    }

    #[test]
    fn test_value_tracker_rewrites_values() {
        let manager = StateManager::new();
        let tracker: Rc<dyn ValueTracker<i32>> = Rc::new(Clamp);
        let state = manager
            .mutable_state_with(-5, Some(true), Equivalence::by_eq(), Some(tracker))
            .unwrap();
        assert_eq!(state.value().unwrap(), 0);

        let doubled = {
            let state = state.clone();
            manager.computable_state(move |_| Ok(state.value()? * 2)).unwrap()
        };
        assert_eq!(doubled.value().unwrap(), 0);

        state.set(250).unwrap();
        assert_eq!(state.value().unwrap(), 100);
        assert_eq!(cycle(&manager), 1);
        assert!(state.modified().unwrap());
        assert_eq!(state.value().unwrap(), 100);
        assert_eq!(doubled.value().unwrap(), 200);

        state.set(300).unwrap();
        assert_eq!(cycle(&manager), 0);
        assert!(!state.modified().unwrap());
        assert_eq!(doubled.value().unwrap(), 200);
    }

    #[test]
    fn test_equivalence_downgrade_never_recomputes() {
        let manager = StateManager::new();
        let state = manager
            .mutable_state_with(1, Some(true), Equivalence::new(|_: &i32, _: &i32| true), None)
            .unwrap();
        let runs = Rc::new(RefCell::new(0));
        let derived = {
            let state = state.clone();
            let runs = runs.clone();
            manager
                .computable_state(move |_| {
                    *runs.borrow_mut() += 1;
                    state.value()
                })
                .unwrap()
        };
        derived.value().unwrap();

        for value in [2, 3, 4] {
            state.set(value).unwrap();
            assert_eq!(cycle(&manager), 0);
            assert!(!state.modified().unwrap());
        }
        derived.value().unwrap();
        assert_eq!(*runs.borrow(), 1);
    }

    #[test]
    fn test_scope_equivalence_keeps_readers() {
        let manager = StateManager::new();
        let source = manager.mutable_state(1, Some(true)).unwrap();
        let parity = {
            let source = source.clone();
            manager
                .computable_state_with(move |_| Ok(source.value()? % 2), Equivalence::by_eq())
                .unwrap()
        };
        let reads = Rc::new(RefCell::new(0));
        let reader = {
            let parity = parity.clone();
            let reads = reads.clone();
            manager
                .computable_state(move |_| {
                    *reads.borrow_mut() += 1;
                    parity.value()
                })
                .unwrap()
        };
        assert_eq!(reader.value().unwrap(), 1);

        source.set(3).unwrap();
        cycle(&manager);
        assert!(!parity.modified().unwrap());
        assert_eq!(reader.value().unwrap(), 1);
        assert_eq!(*reads.borrow(), 1);
    }

    #[test]
    fn test_modify_during_computation() {
        let manager = StateManager::new();
        let watched = manager.mutable_state(0, Some(true)).unwrap();
        let free = manager.mutable_state(0, Some(true)).unwrap();

        let computed = {
            let watched = watched.clone();
            let free = free.clone();
            manager
                .computable_state(move |_| {
                    let value = watched.value()?;
                    free.set(value)?;
                    watched.set(value + 1)?;
                    Ok(value)
                })
                .unwrap()
        };
        let err = computed.value().err();
        assert!(matches!(
            err,
            Some(RuntimeError::ModifyDuringComputation(_, _))
        ));
        assert_eq!(manager.current_scope(), None);
        assert!(!manager.frozen());
        assert_eq!(free.value().unwrap(), 0);
    }

    #[test]
    fn test_local_state_rules() {
        let manager = StateManager::new();
        assert_eq!(
            manager.mutable_state(1, None).err(),
            Some(RuntimeError::TopLevelState)
        );
        let root = manager
            .updatable_node((), |cx| {
                let err = cx.mutable_state(1, None).err();
                assert_eq!(err, Some(RuntimeError::UnrememberedLocalState));
                let remembered = cx.remember_mutable_state(|| 1)?;
                assert_eq!(remembered.value()?, 1);
                Ok(())
            })
            .unwrap();
        root.value().unwrap();
        assert_eq!(manager.stats().state_count, 1);

        root.dispose().unwrap();
        assert_eq!(manager.stats().state_count, 0);
    }

    #[test]
    fn test_named_states() {
        let manager = StateManager::new();
        let theme = manager.named_state("theme", || "dark", Some(true)).unwrap();
        let again = manager.named_state("theme", || "light", Some(true)).unwrap();
        assert_eq!(theme.id(), again.id());
        assert_eq!(manager.value_by::<&str>("theme", None).unwrap(), "dark");
        assert_eq!(
            manager.value_by::<&str>("missing", None).err(),
            Some(RuntimeError::UnknownName("missing".into()))
        );
        assert_eq!(
            manager.value_by::<i32>("theme", Some(true)).err(),
            Some(RuntimeError::TypeMismatch("i32"))
        );

        let err = manager
            .named_state(
                "outer",
                || manager.mutable_state(0, Some(true)).err(),
                Some(true),
            )
            .unwrap()
            .value()
            .unwrap();
        assert_eq!(err, Some(RuntimeError::CreationProhibited("outer".into())));

        theme.dispose().unwrap();
        assert!(theme.is_disposed());
        assert!(manager.value_by::<&str>("theme", Some(true)).is_err());
    }

    #[test]
    fn test_callbacks_drain_in_order() {
        let manager = StateManager::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for index in 0..3 {
            let log = log.clone();
            let inner = manager.clone();
            manager.schedule_callback(move || {
                log.borrow_mut().push(index);
                let log = log.clone();
                inner.schedule_callback(move || log.borrow_mut().push(index + 10));
            });
        }
        assert_eq!(manager.update_snapshot().unwrap(), 0);
        assert!(log.borrow().is_empty());

        assert_eq!(manager.call_callbacks(), 3);
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert_eq!(manager.call_callbacks(), 3);
        assert_eq!(*log.borrow(), vec![0, 1, 2, 10, 11, 12]);
        assert_eq!(manager.call_callbacks(), 0);
    }

    #[test]
    fn test_array_round_trip() {
        let manager = StateManager::new();
        let items = manager.array_state(Vec::<u32>::new(), Some(true)).unwrap();
        for item in 1..=5 {
            items.push(item).unwrap();
        }
        assert_eq!(items.len().unwrap(), 5);
        assert_eq!(items.at(-1).unwrap(), Some(5));

        assert_eq!(cycle(&manager), 1);
        assert_eq!(items.len().unwrap(), 5);
        assert_eq!(items.at(-1).unwrap(), Some(5));
        assert_eq!(items.at(-6).unwrap(), None);

        items.splice(1, 2, [20, 30, 40]).unwrap();
        assert_eq!(items.value().unwrap(), vec![1, 20, 30, 40, 4, 5]);
        items.sort_by(|a, b| b.cmp(a)).unwrap();
        cycle(&manager);
        assert_eq!(items.get(0).unwrap(), Some(40));

        items.reverse().unwrap();
        items.reverse().unwrap();
        assert_eq!(cycle(&manager), 0);
        assert!(!items.modified().unwrap());
    }

    #[test]
    fn test_dispose_state() {
        let manager = StateManager::new();
        let state = manager.mutable_state(1, Some(true)).unwrap();
        state.set(2).unwrap();
        state.dispose().unwrap();
        assert!(state.is_disposed());
        assert_eq!(state.value().err(), Some(RuntimeError::DisposedState));
        assert_eq!(state.set(3).err(), Some(RuntimeError::DisposedState));
        assert_eq!(cycle(&manager), 0);
    }

    #[test]
    fn test_thread_instance() {
        StateManager::reset_instance();
        let first = StateManager::instance();
        let state = first.mutable_state(1, Some(true)).unwrap();
        assert!(!state.is_disposed());

        drop(first);
        StateManager::reset_instance();
        assert!(state.is_disposed());
        assert_eq!(StateManager::instance().stats().state_count, 0);
        StateManager::reset_instance();
    }

    #[test]
    fn test_dirty_roots_within_round_limit() {
        let manager = StateManager::with_config(ManagerConfig::new().max_update_rounds(3));
        let source = manager.mutable_state(0, Some(true)).unwrap();
        let first = {
            let source = source.clone();
            manager.computable_state(move |_| source.value()).unwrap()
        };
        let reader = {
            let first = first.clone();
            manager.computable_state(move |_| first.value()).unwrap()
        };
        reader.value().unwrap();

        source.set(1).unwrap();
        assert_eq!(cycle(&manager), 2);
        assert_eq!(reader.value().unwrap(), 1);
    }
}
