//! Scope graph
//!
//! Scopes are cached units of computation arranged in a tree. Each scope keeps
//! its children as a singly linked list (`child` / `next`, arena keys) plus an
//! incremental cursor: the last child matched in the running pass.
//!
//! A pass over a scope looks like this:
//!
//! ```ignore
//! let scope = cx.scope::<u32>(key, ScopeOptions::new().params(1))?;
//! scope.param(0, item)?;
//! match scope.begin()? {
//!     None => scope.cached(),            // unchanged: its nodes are skipped in place
//!     Some(pass) => {
//!         let value = expensive(cx, item)?;
//!         pass.recache(value)            // detaches stale children, attaches the node
//!     }
//! }
//! ```
//!
//! Children not revisited during a pass are detached when the pass is
//! recached: disposed, or parked in a recycle pool when they carry a reuse key.

use slotmap::{new_key_type, SlotMap};
use smallvec::SmallVec;
use std::any::{type_name, Any};
use std::marker::PhantomData;
use std::mem;
use std::rc::Rc;
use tracing::{trace, warn};

use crate::dependency::Dependencies;
use crate::error::{Result, RuntimeError};
use crate::key::{CallsiteKey, ReuseKey};
use crate::manager::StateManager;
use crate::recycle::{PoolKey, Recyclable, RecyclePool};
use crate::state::{Equivalence, ParamCell, ReadState, StateId, StateOwner, StateSlot};
use crate::tree::{NodeContent, NodeId, NodeKind};

new_key_type! {
    /// Unique identifier for a scope
    pub struct ScopeId;
}

pub(crate) type ComputeFn = Rc<dyn Fn(&StateManager) -> Result<Box<dyn Any>>>;
pub(crate) type CleanupFn = Box<dyn FnOnce(&StateManager, Option<Box<dyn Any>>) -> Result<()>>;
pub(crate) type CreateNodeFn = Box<dyn FnOnce(&StateManager) -> Result<Box<dyn NodeContent>>>;
pub(crate) type ScopeEquivalenceFn = Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>;

/// Something a scope releases when it is disposed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Owned {
    State(StateId),
    Scope(ScopeId),
}

/// Arena entry of a scope
pub(crate) struct ScopeSlot {
    pub key: CallsiteKey,
    pub parent: Option<ScopeId>,
    pub next: Option<ScopeId>,
    pub child: Option<ScopeId>,
    /// Last child matched in the running pass
    pub incremental: Option<ScopeId>,
    pub params: SmallVec<[Option<StateId>; 2]>,
    pub owned: Vec<Owned>,
    pub named: Option<rustc_hash::FxHashMap<String, StateId>>,
    pub compute: Option<ComputeFn>,
    pub cleanup: Option<CleanupFn>,
    pub equivalence: Option<ScopeEquivalenceFn>,
    pub value: Option<Box<dyn Any>>,
    pub modified: bool,
    pub recompute_needed: bool,
    pub computing: bool,
    pub once: bool,
    pub disposed: bool,
    pub recycled: bool,
    pub node: Option<NodeId>,
    /// Nodes this scope contributed to the nearest ancestor node in its last pass
    pub node_count: usize,
    pub reuse_key: Option<ReuseKey>,
    pub pool_kind: NodeKind,
    pub dependencies: Dependencies,
    pub on_invalidate: Option<Rc<dyn Fn()>>,
}

impl ScopeSlot {
    pub fn new(key: CallsiteKey, parent: Option<ScopeId>) -> Self {
        Self {
            key,
            parent,
            next: None,
            child: None,
            incremental: None,
            params: SmallVec::new(),
            owned: Vec::new(),
            named: None,
            compute: None,
            cleanup: None,
            equivalence: None,
            value: None,
            modified: false,
            recompute_needed: false,
            computing: false,
            once: false,
            disposed: false,
            recycled: false,
            node: None,
            node_count: 0,
            reuse_key: None,
            pool_kind: NodeKind::NONE,
            dependencies: Dependencies::new(),
            on_invalidate: None,
        }
    }
}

pub(crate) fn scope_is_live(scopes: &SlotMap<ScopeId, ScopeSlot>, id: ScopeId) -> bool {
    scopes.get(id).is_some_and(|slot| !slot.disposed)
}

fn keep_first(result: &mut Result<()>, next: Result<()>) {
    if result.is_ok() {
        *result = next;
    }
}

// =============================================================================
// OPTIONS
// =============================================================================

/// How a scope is built when its callsite is visited for the first time.
///
/// Options are ignored when the lookup finds an existing child.
#[derive(Default)]
pub struct ScopeOptions {
    pub(crate) param_count: usize,
    pub(crate) once: bool,
    pub(crate) reuse_key: Option<ReuseKey>,
    pub(crate) node_kind: Option<NodeKind>,
    pub(crate) create: Option<CreateNodeFn>,
    pub(crate) compute: Option<ComputeFn>,
    pub(crate) cleanup: Option<CleanupFn>,
    pub(crate) equivalence: Option<ScopeEquivalenceFn>,
    pub(crate) on_invalidate: Option<Rc<dyn Fn()>>,
}

impl ScopeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of parameter slots
    pub fn params(mut self, count: usize) -> Self {
        self.param_count = count;
        self
    }

    /// Compute once and never recompute from dependency changes
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Recycle the scope under this key instead of disposing it
    pub fn reuse_key(mut self, key: impl Into<ReuseKey>) -> Self {
        self.reuse_key = Some(key.into());
        self
    }

    /// Kind used to match recycled scopes
    pub fn node_kind(mut self, kind: NodeKind) -> Self {
        self.node_kind = Some(kind);
        self
    }

    /// Attach a node created by `create` when the scope is constructed
    pub fn create_node<N: NodeContent + 'static>(
        mut self,
        create: impl FnOnce(&StateManager) -> Result<N> + 'static,
    ) -> Self {
        self.create = Some(Box::new(move |cx: &StateManager| {
            create(cx).map(|content| Box::new(content) as Box<dyn NodeContent>)
        }));
        self
    }

    /// Closure recomputing the value of a computable scope
    pub fn compute<V: 'static>(
        mut self,
        compute: impl Fn(&StateManager) -> Result<V> + 'static,
    ) -> Self {
        self.compute = Some(Rc::new(move |cx: &StateManager| {
            compute(cx).map(|value| Box::new(value) as Box<dyn Any>)
        }));
        self
    }

    /// Called with the last cached value when the scope is disposed
    pub fn cleanup<V: 'static>(
        mut self,
        cleanup: impl FnOnce(&StateManager, Option<V>) -> Result<()> + 'static,
    ) -> Self {
        self.cleanup = Some(Box::new(move |cx: &StateManager, value: Option<Box<dyn Any>>| {
            let value = value.and_then(|value| value.downcast::<V>().ok()).map(|value| *value);
            cleanup(cx, value)
        }));
        self
    }

    /// Report recomputations that produce an equivalent value as unmodified
    pub fn equivalence<V: 'static>(mut self, equivalence: Equivalence<V>) -> Self {
        if equivalence.is_set() {
            self.equivalence = Some(Rc::new(move |old: &dyn Any, new: &dyn Any| {
                match (old.downcast_ref::<V>(), new.downcast_ref::<V>()) {
                    (Some(old), Some(new)) => equivalence.equivalent(old, new),
                    _ => false,
                }
            }));
        }
        self
    }

    /// Enqueue `callback` instead of invalidating the parent chain
    pub(crate) fn on_invalidate(mut self, callback: impl Fn() + 'static) -> Self {
        self.on_invalidate = Some(Rc::new(callback));
        self
    }

    fn pool_kind(&self) -> NodeKind {
        self.node_kind.unwrap_or(if self.create.is_some() {
            NodeKind::DEFAULT
        } else {
            NodeKind::NONE
        })
    }
}

// =============================================================================
// GUARDS
// =============================================================================

/// Makes a scope current until dropped
pub(crate) struct CurrentGuard<'a> {
    manager: &'a StateManager,
    previous: Option<ScopeId>,
}

impl<'a> CurrentGuard<'a> {
    pub fn enter(manager: &'a StateManager, scope: Option<ScopeId>) -> Self {
        let previous = manager.inner().current.replace(scope);
        Self { manager, previous }
    }
}

impl Drop for CurrentGuard<'_> {
    fn drop(&mut self) {
        self.manager.inner().current.set(self.previous);
    }
}

/// An open recomputation of one scope. Dropping it without finishing aborts
/// the pass, leaves the scope marked for recomputation and invalidates its
/// readers so they pull a fresh value once the failure clears.
pub(crate) struct Pass<'a> {
    manager: &'a StateManager,
    scope: ScopeId,
    previous: Option<ScopeId>,
    unfreeze: bool,
    finished: bool,
}

impl<'a> Pass<'a> {
    pub fn finish(mut self, value: Box<dyn Any>) -> Result<()> {
        self.finished = true;
        let recached = self.manager.recache_scope(self.scope, value);
        self.restore();
        let modified = recached?;
        self.manager.notify_scope_dependents(self.scope, modified);
        Ok(())
    }

    fn restore(&mut self) {
        let inner = self.manager.inner();
        inner.current.set(self.previous);
        if self.unfreeze {
            inner.frozen.set(false);
        }
    }
}

impl Drop for Pass<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(slot) = self.manager.inner().scopes.borrow_mut().get_mut(self.scope) {
                slot.computing = false;
            }
            self.restore();
            if !std::thread::panicking() {
                self.manager.notify_scope_dependents(self.scope, true);
            }
        }
    }
}

// =============================================================================
// SCOPE HANDLE
// =============================================================================

/// Typed handle on a child scope returned by [`StateManager::scope`]
pub struct InternalScope<'a, V> {
    manager: &'a StateManager,
    id: ScopeId,
    _marker: PhantomData<fn() -> V>,
}

impl<'a, V: Clone + 'static> InternalScope<'a, V> {
    pub(crate) fn new(manager: &'a StateManager, id: ScopeId) -> Self {
        Self {
            manager,
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Returns true when [`begin`](Self::begin) would reuse the cached value
    pub fn is_unchanged(&self) -> bool {
        self.manager
            .inner()
            .scopes
            .borrow()
            .get(self.id)
            .is_some_and(|slot| slot.value.is_some() && !slot.recompute_needed)
    }

    /// Node attached to this scope
    pub fn node(&self) -> Option<NodeId> {
        self.manager
            .inner()
            .scopes
            .borrow()
            .get(self.id)
            .and_then(|slot| slot.node)
    }

    /// Feed a parameter compared with `PartialEq`
    pub fn param<P: Clone + PartialEq + 'static>(&self, index: usize, value: P) -> Result<ReadState<P>> {
        self.param_with(index, value, Equivalence::by_eq(), None)
    }

    /// Feed a parameter with a custom equivalence, optionally publishing it
    /// under `name` for context-local lookups
    pub fn param_with<P: Clone + 'static>(
        &self,
        index: usize,
        value: P,
        equivalence: Equivalence<P>,
        name: Option<&str>,
    ) -> Result<ReadState<P>> {
        self.manager
            .scope_param(self.id, index, value, &equivalence, name)
            .map(|state| ReadState::new(state, self.manager.weak()))
    }

    /// Start recomputing, or report the scope unchanged with `None`
    pub fn begin(&self) -> Result<Option<Recompute<'a, V>>> {
        Ok(self.manager.begin_scope(self.id)?.map(|pass| Recompute {
            pass,
            _marker: PhantomData,
        }))
    }

    /// Last value stored by [`Recompute::recache`]
    pub fn cached(&self) -> Result<V> {
        let scopes = self.manager.inner().scopes.borrow();
        let slot = scopes.get(self.id).ok_or(RuntimeError::DisposedScope)?;
        let value = slot.value.as_ref().ok_or(RuntimeError::NotComputed(slot.key))?;
        value
            .downcast_ref::<V>()
            .cloned()
            .ok_or(RuntimeError::TypeMismatch(type_name::<V>()))
    }
}

/// Guard of a running recomputation; restores the previous current scope
/// on every exit path
pub struct Recompute<'a, V> {
    pass: Pass<'a>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Clone + 'static> Recompute<'_, V> {
    pub fn scope(&self) -> ScopeId {
        self.pass.scope
    }

    /// Store the computed value and close the pass
    pub fn recache(self, value: V) -> Result<V> {
        self.pass.finish(Box::new(value.clone()))?;
        Ok(value)
    }
}

// =============================================================================
// GRAPH OPERATIONS
// =============================================================================

enum Visit {
    Unchanged {
        parent: Option<ScopeId>,
        count: usize,
    },
    Reentered,
    Changed {
        node: Option<NodeId>,
        root: bool,
    },
}

impl StateManager {
    /// Find, reuse or create the child of the current scope keyed `key`
    pub(crate) fn child_scope(&self, key: CallsiteKey, options: ScopeOptions) -> Result<ScopeId> {
        let parent = self
            .inner()
            .current
            .get()
            .ok_or(RuntimeError::TopLevelScope(key))?;

        let (cursor, mut candidate) = {
            let scopes = self.inner().scopes.borrow();
            let slot = scopes
                .get(parent)
                .filter(|slot| !slot.disposed)
                .ok_or(RuntimeError::DisposedScope)?;
            let first = match slot.incremental {
                Some(cursor) => scopes.get(cursor).and_then(|slot| slot.next),
                None => slot.child,
            };
            (slot.incremental, first)
        };

        while let Some(id) = candidate {
            let (found, next) = {
                let scopes = self.inner().scopes.borrow();
                scopes
                    .get(id)
                    .map_or((false, None), |slot| (slot.key == key, slot.next))
            };
            if found {
                self.detach_range(parent, cursor, Some(id))?;
                if let Some(slot) = self.inner().scopes.borrow_mut().get_mut(parent) {
                    slot.incremental = Some(id);
                }
                return Ok(id);
            }
            candidate = next;
        }

        if let Some(id) = self.reuse_scope(parent, key, &options) {
            self.link_after(parent, cursor, id);
            return Ok(id);
        }

        self.check_creation()?;
        let id = self.create_scope(key, parent, options)?;
        self.link_after(parent, cursor, id);
        Ok(id)
    }

    fn reuse_scope(&self, parent: ScopeId, key: CallsiteKey, options: &ScopeOptions) -> Option<ScopeId> {
        let reuse_key = options.reuse_key.clone()?;
        let owner = self.node_ref(parent)?;
        let pool_key = PoolKey::new(reuse_key, options.pool_kind());
        let id = self
            .inner()
            .pools
            .borrow_mut()
            .get_mut(&owner)
            .and_then(|pool| pool.reuse(&pool_key))?;
        if let Some(slot) = self.inner().scopes.borrow_mut().get_mut(id) {
            slot.key = key;
            slot.parent = Some(parent);
            slot.next = None;
            slot.recycled = false;
        }
        self.force_recompute(id);
        trace!("scope reused: {} as {:?}", key, pool_key.reuse_key);
        Some(id)
    }

    fn create_scope(&self, key: CallsiteKey, parent: ScopeId, options: ScopeOptions) -> Result<ScopeId> {
        let pool_kind = options.pool_kind();
        let ScopeOptions {
            param_count,
            once,
            reuse_key,
            create,
            compute,
            cleanup,
            equivalence,
            on_invalidate,
            ..
        } = options;

        let mut slot = ScopeSlot::new(key, Some(parent));
        slot.params = SmallVec::from_elem(None, param_count);
        slot.once = once;
        slot.reuse_key = reuse_key;
        slot.pool_kind = pool_kind;
        slot.compute = compute;
        slot.cleanup = cleanup;
        slot.equivalence = equivalence;
        slot.on_invalidate = on_invalidate;
        let id = self.inner().scopes.borrow_mut().insert(slot);

        if let Some(create) = create {
            let content = {
                let _guard = CurrentGuard::enter(self, Some(id));
                self.set_once(id, true);
                let content = create(self);
                self.set_once(id, once);
                content
            };
            match content {
                Ok(content) => {
                    let node = self.inner().tree.borrow_mut().create_boxed(content);
                    if let Some(slot) = self.inner().scopes.borrow_mut().get_mut(id) {
                        slot.node = Some(node);
                    }
                }
                Err(err) => {
                    if let Err(cleanup_err) = self.dispose_scope(id) {
                        warn!("scope {} failed to clean up after node creation: {}", key, cleanup_err);
                    }
                    return Err(err);
                }
            }
        }
        trace!("scope created: {}", key);
        Ok(id)
    }

    fn set_once(&self, id: ScopeId, once: bool) {
        if let Some(slot) = self.inner().scopes.borrow_mut().get_mut(id) {
            slot.once = once;
        }
    }

    fn link_after(&self, parent: ScopeId, after: Option<ScopeId>, id: ScopeId) {
        let mut scopes = self.inner().scopes.borrow_mut();
        let next = match after {
            Some(after) => scopes.get_mut(after).and_then(|slot| slot.next.replace(id)),
            None => scopes.get_mut(parent).and_then(|slot| slot.child.replace(id)),
        };
        if let Some(slot) = scopes.get_mut(id) {
            slot.parent = Some(parent);
            slot.next = next;
        }
        if let Some(slot) = scopes.get_mut(parent) {
            slot.incremental = Some(id);
        }
    }

    /// Unlink the children of `parent` strictly between `after` and `until`
    /// and dispose or recycle them in forward order
    fn detach_range(&self, parent: ScopeId, after: Option<ScopeId>, until: Option<ScopeId>) -> Result<()> {
        let stale = {
            let mut scopes = self.inner().scopes.borrow_mut();
            let mut stale: SmallVec<[ScopeId; 4]> = SmallVec::new();
            let mut current = match after {
                Some(after) => scopes.get(after).and_then(|slot| slot.next),
                None => scopes.get(parent).and_then(|slot| slot.child),
            };
            while current != until {
                let Some(id) = current else { break };
                current = scopes.get(id).and_then(|slot| slot.next);
                stale.push(id);
            }
            if stale.is_empty() {
                return Ok(());
            }
            match after {
                Some(after) => {
                    if let Some(slot) = scopes.get_mut(after) {
                        slot.next = until;
                    }
                }
                None => {
                    if let Some(slot) = scopes.get_mut(parent) {
                        slot.child = until;
                    }
                }
            }
            for id in &stale {
                if let Some(slot) = scopes.get_mut(*id) {
                    slot.parent = None;
                    slot.next = None;
                }
            }
            stale
        };

        let mut result = Ok(());
        for id in stale {
            let reusable = self
                .inner()
                .scopes
                .borrow()
                .get(id)
                .is_some_and(|slot| slot.reuse_key.is_some());
            let detached = if reusable {
                self.recycle_scope(parent, id)
            } else {
                self.dispose_scope(id)
            };
            keep_first(&mut result, detached);
        }
        result
    }

    /// Park a detached scope in the pool of the nearest node above `parent`
    fn recycle_scope(&self, parent: ScopeId, id: ScopeId) -> Result<()> {
        let Some(owner) = self.node_ref(parent) else {
            return self.dispose_scope(id);
        };
        let entry = self.inner().scopes.borrow().get(id).and_then(|slot| {
            slot.reuse_key
                .clone()
                .map(|key| (PoolKey::new(key, slot.pool_kind), slot.node))
        });
        let Some((pool_key, node)) = entry else {
            return self.dispose_scope(id);
        };

        let capacity = self.inner().config.recycle_pool_capacity;
        let parked = self
            .inner()
            .pools
            .borrow_mut()
            .entry(owner)
            .or_insert_with(|| RecyclePool::new(capacity))
            .recycle(pool_key.clone(), id)
            .is_ok();
        if !parked {
            return self.dispose_scope(id);
        }

        if let Some(slot) = self.inner().scopes.borrow_mut().get_mut(id) {
            slot.recycled = true;
        }
        self.inner().dirty.borrow_mut().shift_remove(&id);
        if let Some(node) = node {
            self.inner().tree.borrow_mut().detach(node)?;
        }
        trace!("scope recycled: {:?}", pool_key.reuse_key);
        Ok(())
    }

    /// Mark a reused scope and its descendants for recomputation, stopping at
    /// descendants that own a node or are remembered
    fn force_recompute(&self, id: ScopeId) {
        let mut scopes = self.inner().scopes.borrow_mut();
        let mut stack = Vec::new();
        if let Some(slot) = scopes.get_mut(id) {
            slot.recompute_needed = true;
            stack.extend(slot.child);
        }
        while let Some(current) = stack.pop() {
            let Some(slot) = scopes.get_mut(current) else {
                continue;
            };
            stack.extend(slot.next);
            if slot.once || slot.node.is_some() {
                continue;
            }
            slot.recompute_needed = true;
            stack.extend(slot.child);
        }
    }

    /// Mark a scope so that its next visit recomputes it
    pub(crate) fn mark_recompute(&self, id: ScopeId) {
        if let Some(slot) = self.inner().scopes.borrow_mut().get_mut(id) {
            slot.recompute_needed = true;
        }
    }

    /// Nearest node at or above `scope`
    pub(crate) fn node_ref(&self, scope: ScopeId) -> Option<NodeId> {
        let scopes = self.inner().scopes.borrow();
        let mut current = Some(scope);
        while let Some(id) = current {
            let slot = scopes.get(id)?;
            if slot.node.is_some() {
                return slot.node;
            }
            current = slot.parent;
        }
        None
    }

    /// Account `count` nodes of a child to `scope`; when skipping, confirm
    /// them in place in the nearest ancestor node
    fn increment(&self, scope: ScopeId, count: usize, skip: bool) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if let Some(slot) = self.inner().scopes.borrow_mut().get_mut(scope) {
            slot.node_count += count;
        }
        if skip {
            if let Some(node) = self.node_ref(scope) {
                self.inner().tree.borrow_mut().incremental_update_skip(node, count)?;
            }
        }
        Ok(())
    }

    pub(crate) fn begin_scope(&self, id: ScopeId) -> Result<Option<Pass<'_>>> {
        let visit = {
            let mut scopes = self.inner().scopes.borrow_mut();
            let slot = scopes
                .get_mut(id)
                .filter(|slot| !slot.disposed)
                .ok_or(RuntimeError::DisposedScope)?;
            if slot.computing {
                if slot.value.is_none() {
                    return Err(RuntimeError::NotComputed(slot.key));
                }
                Visit::Reentered
            } else if slot.value.is_some() && !slot.recompute_needed {
                Visit::Unchanged {
                    parent: slot.parent,
                    count: if slot.node.is_some() { 1 } else { slot.node_count },
                }
            } else {
                slot.computing = true;
                slot.incremental = None;
                slot.node_count = 0;
                Visit::Changed {
                    node: slot.node,
                    root: slot.parent.is_none(),
                }
            }
        };

        match visit {
            Visit::Reentered => Ok(None),
            Visit::Unchanged { parent, count } => {
                if let Some(parent) = parent {
                    self.increment(parent, count, true)?;
                }
                Ok(None)
            }
            Visit::Changed { node, root } => {
                if let Some(node) = node {
                    self.inner().tree.borrow_mut().reset_cursor(node);
                }
                let previous = self.inner().current.replace(Some(id));
                let unfreeze = root
                    && self.inner().config.freeze_during_compute
                    && !self.inner().frozen.replace(true);
                Ok(Some(Pass {
                    manager: self,
                    scope: id,
                    previous,
                    unfreeze,
                    finished: false,
                }))
            }
        }
    }

    /// Store a recomputed value, detach stale children and attach the node.
    /// Returns whether the value counts as modified.
    fn recache_scope(&self, id: ScopeId, value: Box<dyn Any>) -> Result<bool> {
        let (parent, cursor, node, count, modified) = {
            let mut scopes = self.inner().scopes.borrow_mut();
            let slot = scopes.get_mut(id).ok_or(RuntimeError::DisposedScope)?;
            let modified = match (&slot.value, &slot.equivalence) {
                (Some(old), Some(equivalent)) => !equivalent(old.as_ref(), value.as_ref()),
                _ => true,
            };
            slot.value = Some(value);
            slot.modified = modified;
            slot.recompute_needed = false;
            slot.computing = false;
            let count = if slot.node.is_some() { 1 } else { slot.node_count };
            (slot.parent, slot.incremental.take(), slot.node, count, modified)
        };

        let mut result = self.detach_range(id, cursor, None);
        if let Some(parent) = parent {
            keep_first(&mut result, self.increment(parent, count, false));
        }
        if let Some(node) = node {
            let parent_node = parent.and_then(|parent| self.node_ref(parent));
            let done = self
                .inner()
                .tree
                .borrow_mut()
                .incremental_update_done(node, parent_node);
            keep_first(&mut result, done);
        }
        result.map(|()| modified)
    }

    pub(crate) fn notify_scope_dependents(&self, id: ScopeId, modified: bool) {
        let invalidated = {
            let mut scopes = self.inner().scopes.borrow_mut();
            let Some(mut dependencies) = scopes
                .get_mut(id)
                .map(|slot| mem::take(&mut slot.dependencies))
            else {
                return;
            };
            let invalidated = dependencies.update(modified, |dep| scope_is_live(&scopes, dep));
            if let Some(slot) = scopes.get_mut(id) {
                slot.dependencies = dependencies;
            }
            invalidated
        };
        for dependent in invalidated {
            self.invalidate(dependent);
        }
    }

    /// Register the computing scope as a reader of the value of `id`
    pub(crate) fn track_scope(&self, id: ScopeId) {
        let Some(reader) = self.tracking_scope().filter(|reader| *reader != id) else {
            return;
        };
        let mut scopes = self.inner().scopes.borrow_mut();
        let Some(mut dependencies) = scopes
            .get_mut(id)
            .map(|slot| mem::take(&mut slot.dependencies))
        else {
            return;
        };
        dependencies.register(reader, |dep| scope_is_live(&scopes, dep));
        if let Some(slot) = scopes.get_mut(id) {
            slot.dependencies = dependencies;
        }
    }

    /// Mark `scope` and its ancestors for recomputation. A root with live
    /// dependents lands in the dirty set; a controlled scope enqueues its
    /// callback instead of propagating.
    pub(crate) fn invalidate(&self, scope: ScopeId) {
        let mut controlled = None;
        let mut dirty_root = None;
        {
            let mut scopes = self.inner().scopes.borrow_mut();
            let mut current = scope;
            loop {
                let Some(slot) = scopes.get_mut(current) else {
                    break;
                };
                if slot.disposed || slot.recycled || slot.computing {
                    break;
                }
                if !slot.once {
                    if slot.recompute_needed {
                        break;
                    }
                    slot.recompute_needed = true;
                }
                if let Some(callback) = &slot.on_invalidate {
                    controlled = Some(callback.clone());
                    break;
                }
                match slot.parent {
                    Some(parent) => current = parent,
                    None => {
                        let dependents: SmallVec<[ScopeId; 4]> = slot.dependencies.iter().collect();
                        if dependents.iter().any(|dep| scope_is_live(&scopes, *dep)) {
                            dirty_root = Some(current);
                        }
                        break;
                    }
                }
            }
        }
        if let Some(root) = dirty_root {
            self.inner().dirty.borrow_mut().insert(root);
        }
        if let Some(callback) = controlled {
            self.inner()
                .callbacks
                .borrow_mut()
                .push_back(Box::new(move || callback()));
        }
    }

    /// Create or update parameter `index` of `scope`
    pub(crate) fn scope_param<P: Clone + 'static>(
        &self,
        scope: ScopeId,
        index: usize,
        value: P,
        equivalence: &Equivalence<P>,
        name: Option<&str>,
    ) -> Result<StateId> {
        let existing = {
            let scopes = self.inner().scopes.borrow();
            let slot = scopes.get(scope).ok_or(RuntimeError::DisposedScope)?;
            let count = slot.params.len();
            *slot
                .params
                .get(index)
                .ok_or(RuntimeError::ParamOutOfBounds { index, count })?
        };

        match existing {
            Some(state) => {
                let (changed, dependents) = {
                    let mut states = self.inner().states.borrow_mut();
                    let slot = states.get_mut(state).ok_or(RuntimeError::DisposedState)?;
                    let cell = slot
                        .cell
                        .as_any_mut()
                        .downcast_mut::<ParamCell<P>>()
                        .ok_or(RuntimeError::TypeMismatch(type_name::<P>()))?;
                    let changed = cell.update(value, equivalence);
                    slot.modified = changed;
                    let scopes = self.inner().scopes.borrow();
                    let dependents = slot
                        .dependencies
                        .update(changed, |dep| scope_is_live(&scopes, dep));
                    (changed, dependents)
                };
                if changed {
                    self.mark_recompute(scope);
                    for dependent in dependents {
                        self.invalidate(dependent);
                    }
                }
                Ok(state)
            }
            None => {
                self.check_creation()?;
                if let Some(name) = name {
                    let scopes = self.inner().scopes.borrow();
                    let taken = scopes
                        .get(scope)
                        .and_then(|slot| slot.named.as_ref())
                        .is_some_and(|named| named.contains_key(name));
                    if taken {
                        return Err(RuntimeError::DuplicateName(name.to_string()));
                    }
                }
                let state = self.inner().states.borrow_mut().insert(StateSlot::new(
                    Box::new(ParamCell { snapshot: value }),
                    name.map(str::to_string),
                    StateOwner::Param(scope),
                ));
                let mut scopes = self.inner().scopes.borrow_mut();
                if let Some(slot) = scopes.get_mut(scope) {
                    slot.params[index] = Some(state);
                    if let Some(name) = name {
                        slot.named
                            .get_or_insert_with(Default::default)
                            .insert(name.to_string(), state);
                    }
                }
                Ok(state)
            }
        }
    }

    // =========================================================================
    // DISPOSAL
    // =========================================================================

    /// Tear down a scope: bookkeeping, own cleanup, children in forward order,
    /// owned states and scopes, then the node and the scopes pooled under it.
    /// Teardown always completes; the first error is returned afterwards.
    pub(crate) fn dispose_scope(&self, id: ScopeId) -> Result<()> {
        let (key, cleanup, value) = {
            let mut scopes = self.inner().scopes.borrow_mut();
            let Some(slot) = scopes.get_mut(id).filter(|slot| !slot.disposed) else {
                return Ok(());
            };
            slot.disposed = true;
            (slot.key, slot.cleanup.take(), slot.value.take())
        };
        self.inner().dirty.borrow_mut().shift_remove(&id);
        trace!("scope disposed: {}", key);

        let mut result = Ok(());
        if let Some(cleanup) = cleanup {
            let _guard = CurrentGuard::enter(self, None);
            if let Err(err) = cleanup(self, value) {
                warn!("cleanup of scope {} failed: {}", key, err);
                result = Err(err);
            }
        }

        let mut child = self
            .inner()
            .scopes
            .borrow_mut()
            .get_mut(id)
            .and_then(|slot| slot.child.take());
        while let Some(current) = child {
            child = self
                .inner()
                .scopes
                .borrow()
                .get(current)
                .and_then(|slot| slot.next);
            keep_first(&mut result, self.dispose_scope(current));
        }

        let (owned, params, node) = {
            let mut scopes = self.inner().scopes.borrow_mut();
            match scopes.get_mut(id) {
                Some(slot) => (
                    mem::take(&mut slot.owned),
                    mem::take(&mut slot.params),
                    slot.node.take(),
                ),
                None => (Vec::new(), SmallVec::new(), None),
            }
        };
        for owned in owned {
            match owned {
                Owned::State(state) => self.release_state(state),
                Owned::Scope(scope) => keep_first(&mut result, self.dispose_scope(scope)),
            }
        }
        for state in params.into_iter().flatten() {
            self.release_state(state);
        }
        if let Some(node) = node {
            keep_first(&mut result, self.dispose_node(node));
        }

        self.inner().scopes.borrow_mut().remove(id);
        result
    }

    /// Dispose a node subtree and every scope pooled under its nodes
    pub(crate) fn dispose_node(&self, node: NodeId) -> Result<()> {
        let disposed = self.inner().tree.borrow_mut().dispose(node);
        let mut result = Ok(());
        for node in disposed {
            let pool = self.inner().pools.borrow_mut().remove(&node);
            if let Some(mut pool) = pool {
                for scope in pool.drain() {
                    keep_first(&mut result, self.dispose_scope(scope));
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_top_level_scope_is_prohibited() {
        let manager = StateManager::new();
        let key = CallsiteKey::from_raw(7);
        let err = manager.scope::<()>(key, ScopeOptions::new()).err();
        assert_eq!(err, Some(RuntimeError::TopLevelScope(key)));
    }

    #[test]
    fn test_unchanged_scope_is_not_recomputed() {
        let manager = StateManager::new();
        let source = manager.mutable_state(1, Some(true)).unwrap();
        let other = manager.mutable_state(10, Some(true)).unwrap();
        let runs = Rc::new(RefCell::new(Vec::new()));

        let root = {
            let source = source.clone();
            let other = other.clone();
            let runs = runs.clone();
            manager
                .updatable_node((), move |cx| {
                    let a = cx.memo_keyed(CallsiteKey::from_raw(1), |_| {
                        runs.borrow_mut().push("a");
                        source.value()
                    })?;
                    let b = cx.memo_keyed(CallsiteKey::from_raw(2), |_| {
                        runs.borrow_mut().push("b");
                        other.value()
                    })?;
                    assert!(a > 0 && b > 0);
                    Ok(())
                })
                .unwrap()
        };

        root.value().unwrap();
        assert_eq!(*runs.borrow(), vec!["a", "b"]);

        source.set(2).unwrap();
        manager.sync_changes();
        manager.update_snapshot().unwrap();
        root.value().unwrap();
        assert_eq!(*runs.borrow(), vec!["a", "b", "a"]);

        // nothing changed: the root itself is unchanged
        root.value().unwrap();
        assert_eq!(*runs.borrow(), vec!["a", "b", "a"]);
    }

    #[test]
    fn test_stale_children_are_disposed_in_forward_order() {
        let manager = StateManager::new();
        let shown = manager.mutable_state(vec![1, 2, 3], Some(true)).unwrap();
        let disposed = Rc::new(RefCell::new(Vec::new()));

        let root = {
            let shown = shown.clone();
            let disposed = disposed.clone();
            manager
                .updatable_node((), move |cx| {
                    for item in shown.value()? {
                        let disposed = disposed.clone();
                        let scope = cx.scope::<()>(
                            CallsiteKey::of(&item),
                            ScopeOptions::new().cleanup(move |_, _: Option<()>| {
                                disposed.borrow_mut().push(item);
                                Ok(())
                            }),
                        )?;
                        if let Some(pass) = scope.begin()? {
                            pass.recache(())?;
                        }
                    }
                    Ok(())
                })
                .unwrap()
        };
        root.value().unwrap();

        shown.set(vec![3]).unwrap();
        manager.sync_changes();
        manager.update_snapshot().unwrap();
        root.value().unwrap();
        assert_eq!(*disposed.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_cleanup_error_surfaces_after_teardown() {
        let manager = StateManager::new();
        let cleaned = Rc::new(RefCell::new(Vec::new()));
        let root = {
            let cleaned = cleaned.clone();
            manager
                .updatable_node((), move |cx| {
                    for (index, fails) in [(1u64, true), (2u64, false)] {
                        let cleaned = cleaned.clone();
                        let scope = cx.scope::<()>(
                            CallsiteKey::from_raw(index),
                            ScopeOptions::new().cleanup(move |_, _: Option<()>| {
                                cleaned.borrow_mut().push(index);
                                if fails {
                                    Err(RuntimeError::callback("cleanup failed"))
                                } else {
                                    Ok(())
                                }
                            }),
                        )?;
                        if let Some(pass) = scope.begin()? {
                            pass.recache(())?;
                        }
                    }
                    Ok(())
                })
                .unwrap()
        };
        root.value().unwrap();

        let err = root.dispose().err();
        assert_eq!(err, Some(RuntimeError::callback("cleanup failed")));
        assert_eq!(*cleaned.borrow(), vec![1, 2]);
        assert_eq!(manager.current_scope(), None);
        assert_eq!(manager.stats().scope_count, 0);
    }

    #[test]
    fn test_recycled_scope_is_picked_up_again() {
        let manager = StateManager::with_config(crate::ManagerConfig::new().recycle_pool_capacity(4));
        let rows = manager.mutable_state(vec!["a"], Some(true)).unwrap();
        let created = Rc::new(RefCell::new(0));

        let root = {
            let rows = rows.clone();
            let created = created.clone();
            manager
                .updatable_node((), move |cx| {
                    for row in rows.value()? {
                        let created = created.clone();
                        cx.attach_reusable_keyed(
                            CallsiteKey::of(row),
                            "row",
                            move || {
                                *created.borrow_mut() += 1;
                            },
                            |_, _| Ok(()),
                        )?;
                    }
                    Ok(())
                })
                .unwrap()
        };
        let tree_root = root.value().unwrap();
        assert_eq!(*created.borrow(), 1);

        rows.set(vec![]).unwrap();
        manager.sync_changes();
        manager.update_snapshot().unwrap();
        root.value().unwrap();
        assert_eq!(manager.tree().child_count(tree_root), 0);

        rows.set(vec!["b"]).unwrap();
        manager.sync_changes();
        manager.update_snapshot().unwrap();
        root.value().unwrap();
        // the recycled row was picked up instead of building a new node
        assert_eq!(*created.borrow(), 1);
        assert_eq!(manager.tree().child_count(tree_root), 1);
    }

    #[test]
    fn test_scope_equivalence_reports_unmodified() {
        let manager = StateManager::new();
        let source = manager.mutable_state(1, Some(true)).unwrap();
        let parity = {
            let source = source.clone();
            manager
                .computable_state_with(move |_| Ok(source.value()? % 2), Equivalence::by_eq())
                .unwrap()
        };
        assert_eq!(parity.value().unwrap(), 1);
        assert!(parity.modified().unwrap());

        source.set(3).unwrap();
        manager.sync_changes();
        manager.update_snapshot().unwrap();
        assert_eq!(parity.value().unwrap(), 1);
        assert!(!parity.modified().unwrap());

        source.set(4).unwrap();
        manager.sync_changes();
        manager.update_snapshot().unwrap();
        assert_eq!(parity.value().unwrap(), 0);
        assert!(parity.modified().unwrap());
    }
}
