//! Collection reconciliation
//!
//! Every item of a collection runs in its own child scope. Keyed items keep
//! their scope (and with it their states and nodes) while the key is present:
//! inserting, removing or moving a key only touches that item's nodes.
//!
//! ```ignore
//! cx.repeat_with_key(&rows, |row, _| row.id, |cx, row, index| {
//!     cx.attach(|| RowNode::new(&row), |cx, node| render_row(cx, node, &row, index))?;
//!     Ok(())
//! })?;
//! ```
//!
//! The unkeyed [`repeat`](StateManager::repeat) identifies items by index.
//! Removing an item from the middle of such a list keeps the scopes (and
//! nodes) of the first indices and drops the last one; the remaining items
//! see their new values on recomputation. Use keys when node identity
//! matters.

use std::hash::Hash;
use std::ops::Range;

use crate::error::Result;
use crate::key::CallsiteKey;
use crate::manager::StateManager;
use crate::scope::ScopeOptions;

impl StateManager {
    /// Run `action` for every index in `0..count`, keyed by index
    #[track_caller]
    pub fn repeat(&self, count: usize, action: impl Fn(&StateManager, usize) -> Result<()>) -> Result<()> {
        self.repeat_indices(CallsiteKey::caller(), 0..count, action)
    }

    /// Run `action` for every index in `start..end`, keyed by index
    #[track_caller]
    pub fn repeat_range(
        &self,
        start: usize,
        end: usize,
        action: impl Fn(&StateManager, usize) -> Result<()>,
    ) -> Result<()> {
        self.repeat_indices(CallsiteKey::caller(), start..end, action)
    }

    /// Run `action` for every item, identifying items by `key`. Keys must be
    /// unique among the items and stable across passes.
    #[track_caller]
    pub fn repeat_with_key<T, K>(
        &self,
        items: &[T],
        key: impl Fn(&T, usize) -> K,
        action: impl Fn(&StateManager, T, usize) -> Result<()>,
    ) -> Result<()>
    where
        T: Clone + PartialEq + 'static,
        K: Hash,
    {
        self.repeat_keyed(CallsiteKey::caller(), items, key, action)
    }

    /// Like [`repeat_with_key`](Self::repeat_with_key), but the whole loop is
    /// skipped while `items` compares equal to the previous pass
    #[track_caller]
    pub fn repeat_by_array<T, K>(
        &self,
        items: &[T],
        key: impl Fn(&T, usize) -> K,
        action: impl Fn(&StateManager, T, usize) -> Result<()>,
    ) -> Result<()>
    where
        T: Clone + PartialEq + 'static,
        K: Hash,
    {
        let base = CallsiteKey::caller();
        let scope = self.scope::<()>(base, ScopeOptions::new().params(1))?;
        scope.param(0, items.to_vec())?;
        if let Some(pass) = scope.begin()? {
            self.repeat_keyed(base, items, key, action)?;
            pass.recache(())?;
        }
        Ok(())
    }

    fn repeat_indices(
        &self,
        base: CallsiteKey,
        indices: Range<usize>,
        action: impl Fn(&StateManager, usize) -> Result<()>,
    ) -> Result<()> {
        for index in indices {
            let scope = self.scope::<()>(base.combine(CallsiteKey::of(&index)), ScopeOptions::new())?;
            if let Some(pass) = scope.begin()? {
                action(self, index)?;
                pass.recache(())?;
            }
        }
        Ok(())
    }

    fn repeat_keyed<T, K>(
        &self,
        base: CallsiteKey,
        items: &[T],
        key: impl Fn(&T, usize) -> K,
        action: impl Fn(&StateManager, T, usize) -> Result<()>,
    ) -> Result<()>
    where
        T: Clone + PartialEq + 'static,
        K: Hash,
    {
        for (index, item) in items.iter().enumerate() {
            let item_key = base.combine(CallsiteKey::of(&key(item, index)));
            let scope = self.scope::<()>(item_key, ScopeOptions::new().params(2))?;
            scope.param(0, item.clone())?;
            scope.param(1, index)?;
            if let Some(pass) = scope.begin()? {
                action(self, item.clone(), index)?;
                pass.recache(())?;
            }
        }
        Ok(())
    }
}
