//! Remember / memo helpers
//!
//! Thin wrappers over [`StateManager::scope`] covering the usual patterns.
//! Every helper derives its callsite key from the caller's source location;
//! the `_keyed` variants take an explicit key for calls made in loops.
//!
//! | helper | scope kind | recomputes when |
//! |---|---|---|
//! | `memo` | memo | a state it read changed |
//! | `remember*` | once | never |
//! | `memo_entry` | memo, 1 param | the argument or a read state changed |
//! | `run_effect` / `on_change` | memo, 1 param | the value changed |
//! | `attach` | memo with node | every visit |
//! | `context_local_scope` | memo, 1 named param | the value or a read state changed |

use std::rc::Rc;

use crate::error::{Result, RuntimeError};
use crate::key::{CallsiteKey, ReuseKey};
use crate::manager::{ComputableState, StateManager};
use crate::scope::ScopeOptions;
use crate::state::{ArrayState, Equivalence, MutableState, ReadState};
use crate::tree::{NodeContent, NodeId};

impl StateManager {
    // =========================================================================
    // MEMO
    // =========================================================================

    /// Cache the result of `compute` until a state it reads changes
    #[track_caller]
    pub fn memo<V: Clone + 'static>(&self, compute: impl FnOnce(&StateManager) -> Result<V>) -> Result<V> {
        self.memo_keyed(CallsiteKey::caller(), compute)
    }

    pub fn memo_keyed<V: Clone + 'static>(
        &self,
        key: CallsiteKey,
        compute: impl FnOnce(&StateManager) -> Result<V>,
    ) -> Result<V> {
        let scope = self.scope::<V>(key, ScopeOptions::new())?;
        match scope.begin()? {
            None => scope.cached(),
            Some(pass) => pass.recache(compute(self)?),
        }
    }

    /// Cache the result of `compute` for `arg`
    #[track_caller]
    pub fn memo_entry<A, V>(&self, arg: A, compute: impl FnOnce(&StateManager, A) -> Result<V>) -> Result<V>
    where
        A: Clone + PartialEq + 'static,
        V: Clone + 'static,
    {
        self.memo_entry_keyed(CallsiteKey::caller(), arg, compute)
    }

    pub fn memo_entry_keyed<A, V>(
        &self,
        key: CallsiteKey,
        arg: A,
        compute: impl FnOnce(&StateManager, A) -> Result<V>,
    ) -> Result<V>
    where
        A: Clone + PartialEq + 'static,
        V: Clone + 'static,
    {
        let scope = self.scope::<V>(key, ScopeOptions::new().params(1))?;
        scope.param(0, arg.clone())?;
        match scope.begin()? {
            None => scope.cached(),
            Some(pass) => pass.recache(compute(self, arg)?),
        }
    }

    // =========================================================================
    // REMEMBER
    // =========================================================================

    /// Compute a value on the first visit and return it unchanged afterwards
    #[track_caller]
    pub fn remember<V: Clone + 'static>(&self, init: impl FnOnce() -> V) -> Result<V> {
        self.remember_keyed(CallsiteKey::caller(), |_| Ok(init()))
    }

    pub fn remember_keyed<V: Clone + 'static>(
        &self,
        key: CallsiteKey,
        init: impl FnOnce(&StateManager) -> Result<V>,
    ) -> Result<V> {
        let scope = self.scope::<V>(key, ScopeOptions::new().once())?;
        match scope.begin()? {
            None => scope.cached(),
            Some(pass) => pass.recache(init(self)?),
        }
    }

    /// A local scalar state that lives as long as the enclosing scope
    #[track_caller]
    pub fn remember_mutable_state<V: Clone + PartialEq + 'static>(&self, initial: impl FnOnce() -> V) -> Result<MutableState<V>> {
        self.remember_keyed(CallsiteKey::caller(), |cx| cx.mutable_state(initial(), None))
    }

    /// A local array state that lives as long as the enclosing scope
    #[track_caller]
    pub fn remember_array_state<T: Clone + PartialEq + 'static>(
        &self,
        initial: impl FnOnce() -> Vec<T>,
    ) -> Result<ArrayState<T>> {
        self.remember_keyed(CallsiteKey::caller(), |cx| cx.array_state(initial(), None))
    }

    /// A local state published under `name` in the current scope, visible to
    /// descendants through `state_by`. Named states are found again by name,
    /// so no remember scope is needed.
    pub fn remember_named_state<V: Clone + PartialEq + 'static>(
        &self,
        name: &str,
        create: impl FnOnce() -> V,
    ) -> Result<MutableState<V>> {
        self.named_state(name, create, Some(false))
    }

    /// Remember a value and hand it to `cleanup` when the scope is disposed
    #[track_caller]
    pub fn remember_disposable<V: Clone + 'static>(
        &self,
        init: impl FnOnce() -> V,
        cleanup: impl FnOnce(V) + 'static,
    ) -> Result<V> {
        let options = ScopeOptions::new()
            .once()
            .cleanup(move |_, value: Option<V>| {
                if let Some(value) = value {
                    cleanup(value);
                }
                Ok(())
            });
        let scope = self.scope::<V>(CallsiteKey::caller(), options)?;
        match scope.begin()? {
            None => scope.cached(),
            Some(pass) => pass.recache(init()),
        }
    }

    /// A computable owned by the enclosing scope
    #[track_caller]
    pub fn remember_computable_state<V: Clone + 'static>(
        &self,
        compute: impl Fn(&StateManager) -> Result<V> + 'static,
    ) -> Result<ComputableState<V>> {
        self.remember_keyed(CallsiteKey::caller(), move |cx| cx.computable_state(compute))
    }

    // =========================================================================
    // EFFECTS
    // =========================================================================

    /// Schedule `on_attach` when first visited and run `on_detach` when the
    /// callsite goes away
    #[track_caller]
    pub fn memo_lifecycle(&self, on_attach: impl FnOnce() + 'static, on_detach: impl FnOnce() + 'static) -> Result<()> {
        let options = ScopeOptions::new().once().cleanup(move |_, _: Option<()>| {
            on_detach();
            Ok(())
        });
        let scope = self.scope::<()>(CallsiteKey::caller(), options)?;
        if let Some(pass) = scope.begin()? {
            self.schedule_callback(on_attach);
            pass.recache(())?;
        }
        Ok(())
    }

    /// Schedule `effect` on the first visit only
    #[track_caller]
    pub fn once(&self, effect: impl FnOnce() + 'static) -> Result<()> {
        let scope = self.scope::<()>(CallsiteKey::caller(), ScopeOptions::new().once())?;
        if let Some(pass) = scope.begin()? {
            self.schedule_callback(effect);
            pass.recache(())?;
        }
        Ok(())
    }

    /// Schedule `effect` with `value` on the first visit and whenever the
    /// value changes
    #[track_caller]
    pub fn run_effect<V: Clone + PartialEq + 'static>(&self, value: V, effect: impl FnOnce(V) + 'static) -> Result<()> {
        let scope = self.scope::<()>(CallsiteKey::caller(), ScopeOptions::new().params(1))?;
        scope.param(0, value.clone())?;
        if let Some(pass) = scope.begin()? {
            self.schedule_callback(move || effect(value));
            pass.recache(())?;
        }
        Ok(())
    }

    /// Call `f` synchronously on the first visit and whenever `value` changes
    #[track_caller]
    pub fn on_change<V: Clone + PartialEq + 'static>(&self, value: V, f: impl FnOnce(&V)) -> Result<()> {
        let scope = self.scope::<()>(CallsiteKey::caller(), ScopeOptions::new().params(1))?;
        scope.param(0, value.clone())?;
        if let Some(pass) = scope.begin()? {
            f(&value);
            pass.recache(())?;
        }
        Ok(())
    }

    // =========================================================================
    // NODES
    // =========================================================================

    /// Create a node on the first visit and attach it under the nearest
    /// ancestor node. `update` runs on every visit; nested scopes created
    /// inside it attach their nodes under this one.
    #[track_caller]
    pub fn attach<N: NodeContent + 'static>(
        &self,
        create: impl FnOnce() -> N + 'static,
        update: impl FnOnce(&StateManager, NodeId) -> Result<()>,
    ) -> Result<NodeId> {
        self.attach_keyed(CallsiteKey::caller(), create, update)
    }

    pub fn attach_keyed<N: NodeContent + 'static>(
        &self,
        key: CallsiteKey,
        create: impl FnOnce() -> N + 'static,
        update: impl FnOnce(&StateManager, NodeId) -> Result<()>,
    ) -> Result<NodeId> {
        let options = ScopeOptions::new().create_node(move |_| Ok(create()));
        self.attach_with(key, options, update)
    }

    /// Like [`attach`](Self::attach), but a detached node is recycled under
    /// `reuse_key` and may be picked up by another callsite
    #[track_caller]
    pub fn attach_reusable<N: NodeContent + 'static>(
        &self,
        reuse_key: impl Into<ReuseKey>,
        create: impl FnOnce() -> N + 'static,
        update: impl FnOnce(&StateManager, NodeId) -> Result<()>,
    ) -> Result<NodeId> {
        self.attach_reusable_keyed(CallsiteKey::caller(), reuse_key, create, update)
    }

    pub fn attach_reusable_keyed<N: NodeContent + 'static>(
        &self,
        key: CallsiteKey,
        reuse_key: impl Into<ReuseKey>,
        create: impl FnOnce() -> N + 'static,
        update: impl FnOnce(&StateManager, NodeId) -> Result<()>,
    ) -> Result<NodeId> {
        let options = ScopeOptions::new()
            .reuse_key(reuse_key)
            .create_node(move |_| Ok(create()));
        self.attach_with(key, options, update)
    }

    fn attach_with(
        &self,
        key: CallsiteKey,
        options: ScopeOptions,
        update: impl FnOnce(&StateManager, NodeId) -> Result<()>,
    ) -> Result<NodeId> {
        let scope = self.scope::<NodeId>(key, options)?;
        self.mark_recompute(scope.id());
        match scope.begin()? {
            None => scope.cached(),
            Some(pass) => {
                let node = scope.node().ok_or(RuntimeError::NotComputed(key))?;
                update(self, node)?;
                pass.recache(node)
            }
        }
    }

    // =========================================================================
    // CONTEXT LOCALS
    // =========================================================================

    /// Publish `value` under `name` to every scope computed by `content`
    #[track_caller]
    pub fn context_local_scope<V, R>(
        &self,
        name: &str,
        value: V,
        content: impl FnOnce(&StateManager) -> Result<R>,
    ) -> Result<R>
    where
        V: Clone + PartialEq + 'static,
        R: Clone + 'static,
    {
        let key = CallsiteKey::caller().combine(CallsiteKey::of(name));
        let scope = self.scope::<R>(key, ScopeOptions::new().params(1))?;
        scope.param_with(0, value, Equivalence::by_eq(), Some(name))?;
        match scope.begin()? {
            None => scope.cached(),
            Some(pass) => pass.recache(content(self)?),
        }
    }

    /// Nearest context local named `name`
    pub fn context_local<V: Clone + 'static>(&self, name: &str) -> Result<ReadState<V>> {
        self.state_by(name, Some(false))
    }

    pub fn context_local_value<V: Clone + 'static>(&self, name: &str) -> Result<V> {
        self.context_local::<V>(name)?.value()
    }

    // =========================================================================
    // CONTROLLED SCOPES
    // =========================================================================

    /// Compute `content` in a scope whose invalidation is reported through
    /// `invalidate` (queued with the scheduled callbacks) instead of
    /// recomputing the enclosing scopes. The content recomputes on the next
    /// visit after an invalidation.
    #[track_caller]
    pub fn controlled_scope<V: Clone + 'static>(
        &self,
        invalidate: impl Fn() + 'static,
        content: impl FnOnce(&StateManager) -> Result<V>,
    ) -> Result<V> {
        let options = ScopeOptions::new().on_invalidate(invalidate);
        let scope = self.scope::<V>(CallsiteKey::caller(), options)?;
        match scope.begin()? {
            None => scope.cached(),
            Some(pass) => pass.recache(content(self)?),
        }
    }
}

/// Shared flag for controlled scopes that only need to know they went stale
#[derive(Clone, Debug, Default)]
pub struct StaleFlag(Rc<std::cell::Cell<bool>>);

impl StaleFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.set(true);
    }

    /// Read and reset the flag
    pub fn take(&self) -> bool {
        self.0.replace(false)
    }

    /// Callback to pass to [`StateManager::controlled_scope`]
    pub fn notifier(&self) -> impl Fn() + 'static {
        let flag = self.clone();
        move || flag.set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn cycle(manager: &StateManager) {
        manager.sync_changes();
        manager.update_snapshot().unwrap();
    }

    #[test]
    fn test_memo_and_remember() {
        let manager = StateManager::new();
        let source = manager.mutable_state(1, Some(true)).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));

        let root = {
            let source = source.clone();
            let log = log.clone();
            manager
                .updatable_node((), move |cx| {
                    let remembered = cx.remember(|| source.peek().unwrap_or_default())?;
                    let doubled = cx.memo(|_| Ok(source.value()? * 2))?;
                    log.borrow_mut().push((remembered, doubled));
                    Ok(())
                })
                .unwrap()
        };
        root.value().unwrap();
        source.set(5).unwrap();
        cycle(&manager);
        root.value().unwrap();
        assert_eq!(*log.borrow(), vec![(1, 2), (1, 10)]);
    }

    #[test]
    fn test_memo_entry_tracks_argument() {
        let manager = StateManager::new();
        let arg = manager.mutable_state(2, Some(true)).unwrap();
        let runs = Rc::new(RefCell::new(0));
        let root = {
            let arg = arg.clone();
            let runs = runs.clone();
            manager
                .updatable_node((), move |cx| {
                    let value = arg.value()?;
                    let runs = runs.clone();
                    cx.memo_entry(value / 2, move |_, half| {
                        *runs.borrow_mut() += 1;
                        Ok(half)
                    })?;
                    Ok(())
                })
                .unwrap()
        };
        root.value().unwrap();
        arg.set(3).unwrap();
        cycle(&manager);
        root.value().unwrap();
        assert_eq!(*runs.borrow(), 1);

        arg.set(4).unwrap();
        cycle(&manager);
        root.value().unwrap();
        assert_eq!(*runs.borrow(), 2);
    }

    #[test]
    fn test_effects_are_scheduled() {
        let manager = StateManager::new();
        let value = manager.mutable_state(1, Some(true)).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let root = {
            let value = value.clone();
            let log = log.clone();
            manager
                .updatable_node((), move |cx| {
                    let current = value.value()?;
                    let once_log = log.clone();
                    cx.once(move || once_log.borrow_mut().push("once".to_string()))?;
                    let effect_log = log.clone();
                    cx.run_effect(current, move |v| effect_log.borrow_mut().push(format!("effect {v}")))?;
                    cx.on_change(current, |v| log.borrow_mut().push(format!("change {v}")))?;
                    Ok(())
                })
                .unwrap()
        };
        root.value().unwrap();
        assert_eq!(*log.borrow(), vec!["change 1"]);
        manager.call_callbacks();
        assert_eq!(*log.borrow(), vec!["change 1", "once", "effect 1"]);

        value.set(2).unwrap();
        cycle(&manager);
        root.value().unwrap();
        manager.call_callbacks();
        assert_eq!(
            *log.borrow(),
            vec!["change 1", "once", "effect 1", "change 2", "effect 2"]
        );
    }

    #[test]
    fn test_lifecycle_and_disposable() {
        let manager = StateManager::new();
        let shown = manager.mutable_state(true, Some(true)).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        let root = {
            let shown = shown.clone();
            let log = log.clone();
            manager
                .updatable_node((), move |cx| {
                    if shown.value()? {
                        let (attach, detach, dispose) = (log.clone(), log.clone(), log.clone());
                        cx.memo_lifecycle(
                            move || attach.borrow_mut().push("attach"),
                            move || detach.borrow_mut().push("detach"),
                        )?;
                        cx.remember_disposable(|| 7, move |_| dispose.borrow_mut().push("dispose"))?;
                    }
                    Ok(())
                })
                .unwrap()
        };
        root.value().unwrap();
        manager.call_callbacks();
        assert_eq!(*log.borrow(), vec!["attach"]);

        shown.set(false).unwrap();
        cycle(&manager);
        root.value().unwrap();
        assert_eq!(*log.borrow(), vec!["attach", "detach", "dispose"]);
    }

    #[test]
    fn test_context_locals() {
        let manager = StateManager::new();
        let theme = manager.mutable_state("dark", Some(true)).unwrap();
        let reads = Rc::new(RefCell::new(Vec::new()));
        let root = {
            let theme = theme.clone();
            let reads = reads.clone();
            manager
                .updatable_node((), move |cx| {
                    let reads = reads.clone();
                    cx.context_local_scope("theme", theme.value()?, move |cx| {
                        cx.memo(|cx| {
                            let value = cx.context_local_value::<&str>("theme")?;
                            reads.borrow_mut().push(value);
                            Ok(())
                        })?;
                        cx.memo(|_| Ok(()))
                    })
                })
                .unwrap()
        };
        root.value().unwrap();
        theme.set("light").unwrap();
        cycle(&manager);
        root.value().unwrap();
        assert_eq!(*reads.borrow(), vec!["dark", "light"]);
        assert!(manager.context_local::<&str>("theme").is_err());
    }

    #[test]
    fn test_duplicate_context_name() {
        let manager = StateManager::new();
        let root = manager
            .updatable_node((), |cx| {
                let scope = cx.scope::<()>(CallsiteKey::from_raw(1), ScopeOptions::new().params(2))?;
                scope.param_with(0, 1, Equivalence::by_eq(), Some("dup"))?;
                let err = scope.param_with(1, 2, Equivalence::by_eq(), Some("dup")).err();
                assert_eq!(err, Some(RuntimeError::DuplicateName("dup".into())));
                let err = scope.param(2, 3).err();
                assert_eq!(err, Some(RuntimeError::ParamOutOfBounds { index: 2, count: 2 }));
                if let Some(pass) = scope.begin()? {
                    pass.recache(())?;
                }
                Ok(())
            })
            .unwrap();
        root.value().unwrap();
    }

    #[test]
    fn test_named_local_state_is_inherited() {
        let manager = StateManager::new();
        let root = manager
            .updatable_node((), |cx| {
                let counter = cx.remember_named_state("counter", || 3)?;
                let seen = cx.memo(|cx| cx.value_by::<i32>("counter", Some(false)))?;
                assert_eq!(seen, counter.value()?);
                Ok(())
            })
            .unwrap();
        root.value().unwrap();
    }

    #[test]
    fn test_controlled_scope_defers_invalidation() {
        let manager = StateManager::new();
        let source = manager.mutable_state(1, Some(true)).unwrap();
        let stale = StaleFlag::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let root = {
            let source = source.clone();
            let stale = stale.clone();
            let seen = seen.clone();
            manager
                .updatable_node((), move |cx| {
                    let value = cx.controlled_scope(stale.notifier(), |_| source.value())?;
                    seen.borrow_mut().push(value);
                    Ok(())
                })
                .unwrap()
        };
        root.value().unwrap();

        source.set(2).unwrap();
        cycle(&manager);
        // the root was not invalidated
        root.value().unwrap();
        assert_eq!(*seen.borrow(), vec![1]);
        assert!(!stale.take());

        manager.call_callbacks();
        assert!(stale.take());
    }

    #[test]
    fn test_attach_builds_nested_nodes() {
        struct Label(&'static str);
        impl NodeContent for Label {}

        let manager = StateManager::new();
        let root = manager
            .updatable_node((), |cx| {
                cx.attach(
                    || Label("outer"),
                    |cx, _| {
                        cx.attach(|| Label("inner"), |_, _| Ok(()))?;
                        Ok(())
                    },
                )?;
                Ok(())
            })
            .unwrap();
        let tree_root = root.value().unwrap();
        let tree = manager.tree();
        let outer: Vec<_> = tree.children(tree_root).collect();
        assert_eq!(outer.len(), 1);
        assert_eq!(tree.content::<Label>(outer[0]).map(|l| l.0), Some("outer"));
        let inner: Vec<_> = tree.children(outer[0]).collect();
        assert_eq!(tree.content::<Label>(inner[0]).map(|l| l.0), Some("inner"));
        assert_eq!(tree.path(inner[0]), vec![0, 0]);
    }
}
