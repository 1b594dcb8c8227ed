//! Dependency registry
//!
//! Every state cell and every scope keeps the set of scopes that read it during
//! their last computation. Most cells are read by exactly one scope, so the
//! registry stores a single dependent inline and only allocates a set once a
//! second distinct dependent registers.
//!
//! Dependents are arena keys. A disposed scope is "obsolete": registering it is
//! a no-op and every notification prunes it.

use indexmap::IndexSet;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::scope::ScopeId;

/// Observers to invalidate when the owner of this registry changes
#[derive(Debug, Default, Clone)]
pub enum Dependencies {
    /// Nobody observed the owner yet
    #[default]
    Empty,
    /// Exactly one observer, stored without allocation
    Single(ScopeId),
    /// Two or more observers in registration order
    Many(IndexSet<ScopeId, FxBuildHasher>),
}

impl Dependencies {
    pub fn new() -> Self {
        Dependencies::Empty
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Dependencies::Empty)
    }

    pub fn len(&self) -> usize {
        match self {
            Dependencies::Empty => 0,
            Dependencies::Single(_) => 1,
            Dependencies::Many(set) => set.len(),
        }
    }

    /// Register an observer. Duplicates and obsolete observers are ignored.
    pub fn register(&mut self, dependent: ScopeId, is_live: impl Fn(ScopeId) -> bool) {
        if !is_live(dependent) {
            return;
        }
        match self {
            Dependencies::Empty => *self = Dependencies::Single(dependent),
            Dependencies::Single(latest) => {
                if *latest != dependent {
                    let mut set = IndexSet::with_capacity_and_hasher(2, FxBuildHasher);
                    set.insert(*latest);
                    set.insert(dependent);
                    *self = Dependencies::Many(set);
                }
            }
            Dependencies::Many(set) => {
                if set.last() != Some(&dependent) {
                    set.insert(dependent);
                }
            }
        }
    }

    /// Prune obsolete observers and, when `invalidate` is set, return the live
    /// observers that must be invalidated.
    pub fn update(
        &mut self,
        invalidate: bool,
        is_live: impl Fn(ScopeId) -> bool,
    ) -> SmallVec<[ScopeId; 4]> {
        let mut out = SmallVec::new();
        match self {
            Dependencies::Empty => {}
            Dependencies::Single(id) => {
                if !is_live(*id) {
                    *self = Dependencies::Empty;
                } else if invalidate {
                    out.push(*id);
                }
            }
            Dependencies::Many(set) => {
                set.retain(|id| is_live(*id));
                if invalidate {
                    out.extend(set.iter().copied());
                }
                match set.len() {
                    0 => *self = Dependencies::Empty,
                    1 => {
                        let only = set[0];
                        *self = Dependencies::Single(only);
                    }
                    _ => {}
                }
            }
        }
        out
    }

    /// Returns true when at least one live observer remains
    pub fn has_live(&self, is_live: impl Fn(ScopeId) -> bool) -> bool {
        match self {
            Dependencies::Empty => false,
            Dependencies::Single(id) => is_live(*id),
            Dependencies::Many(set) => set.iter().any(|id| is_live(*id)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = ScopeId> + '_ {
        let (single, many) = match self {
            Dependencies::Empty => (None, None),
            Dependencies::Single(id) => (Some(*id), None),
            Dependencies::Many(set) => (None, Some(set.iter().copied())),
        };
        single.into_iter().chain(many.into_iter().flatten())
    }
}
