//! Callsite and reuse keys.
//!
//! Every scope is identified among its siblings by a [`CallsiteKey`]. Helper
//! methods on the state manager derive it from the source location of the call
//! with `#[track_caller]`, so two different `memo` calls in one function never
//! collide. Loops need explicit keys: a `memo` inside a `for` resolves to the
//! same location every iteration, which the child lookup treats positionally.
//!
//! ```ignore
//! // Implicit key from the source location
//! let total = cx.memo(|cx| Ok(items.value()?.len()))?;
//!
//! // Explicit key for items of a collection
//! for item in rows {
//!     cx.memo_keyed(CallsiteKey::of(&item.id), |cx| render_row(cx, &item))?;
//! }
//! ```

use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::rc::Rc;

/// Identity of a scope among its siblings
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CallsiteKey(u64);

impl CallsiteKey {
    /// Key derived from the source location of the caller
    #[track_caller]
    pub fn caller() -> Self {
        Self::from_location(Location::caller())
    }

    /// Key derived from a source location
    pub fn from_location(location: &Location<'_>) -> Self {
        let mut hasher = FxHasher::default();
        location.file().hash(&mut hasher);
        location.line().hash(&mut hasher);
        location.column().hash(&mut hasher);
        CallsiteKey(hasher.finish())
    }

    /// Key derived from any hashable value (item ids, strings, indices)
    pub fn of<K: Hash + ?Sized>(key: &K) -> Self {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        CallsiteKey(hasher.finish())
    }

    /// Wrap a raw key value
    pub const fn from_raw(raw: u64) -> Self {
        CallsiteKey(raw)
    }

    /// Get the raw key value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Mix another key into this one
    pub fn combine(self, other: CallsiteKey) -> Self {
        let mut hasher = FxHasher::default();
        self.0.hash(&mut hasher);
        other.0.hash(&mut hasher);
        CallsiteKey(hasher.finish())
    }
}

impl From<u64> for CallsiteKey {
    fn from(raw: u64) -> Self {
        CallsiteKey(raw)
    }
}

impl From<&str> for CallsiteKey {
    fn from(key: &str) -> Self {
        CallsiteKey::of(key)
    }
}

impl fmt::Debug for CallsiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallsiteKey({:#x})", self.0)
    }
}

impl fmt::Display for CallsiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Tag under which a detached scope may be recycled and handed to another callsite.
///
/// Scopes sharing a reuse key are interchangeable templates: a list row scope
/// recycled under `"row"` can be picked up by any later row, keeping its
/// allocated states, nested scopes and node.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ReuseKey(Rc<str>);

impl ReuseKey {
    pub fn new(key: impl AsRef<str>) -> Self {
        ReuseKey(Rc::from(key.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ReuseKey {
    fn from(key: &str) -> Self {
        ReuseKey::new(key)
    }
}

impl From<String> for ReuseKey {
    fn from(key: String) -> Self {
        ReuseKey(Rc::from(key))
    }
}

impl fmt::Debug for ReuseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReuseKey({})", self.0)
    }
}
