//! Ripple Core Runtime
//!
//! Incremental recomputation of scoped, state-tracked computations:
//!
//! - **State cells**: scalar and array values with a committed snapshot and a
//!   journal of pending writes
//! - **Scopes**: cached units of computation keyed by callsite, recomputed
//!   only when a state they read changed
//! - **Node tree**: the output of a computation, patched in place by the
//!   scopes that own its nodes
//! - **Repeat**: keyed and index-based reconciliation of collections
//!
//! # Example
//!
//! ```rust
//! use ripple_core::StateManager;
//!
//! let manager = StateManager::new();
//! let count = manager.mutable_state(1, Some(true))?;
//! let doubled = {
//!     let count = count.clone();
//!     manager.computable_state(move |_| Ok(count.value()? * 2))?
//! };
//! assert_eq!(doubled.value()?, 2);
//!
//! // Writes are journaled; an update cycle commits them and invalidates readers
//! count.set(5)?;
//! manager.sync_changes();
//! manager.update_snapshot()?;
//! assert_eq!(doubled.value()?, 10);
//! # Ok::<(), ripple_core::RuntimeError>(())
//! ```

pub mod async_state;
pub mod config;
pub mod dependency;
pub mod error;
pub mod journal;
pub mod key;
pub mod manager;
pub mod memo;
pub mod recycle;
pub mod repeat;
pub mod scope;
pub mod state;
pub mod tree;

pub use async_state::{AsyncValue, Resolver};
pub use config::ManagerConfig;
pub use error::{Result, RuntimeError};
pub use key::{CallsiteKey, ReuseKey};
pub use manager::{ComputableState, ManagerStats, StateManager};
pub use memo::StaleFlag;
pub use recycle::{PoolKey, Recyclable, RecyclePool};
pub use scope::{InternalScope, Recompute, ScopeId, ScopeOptions};
pub use state::{ArrayState, CellKind, Equivalence, MutableState, ReadState, State, StateId, ValueTracker};
pub use tree::{AsAny, NodeContent, NodeId, NodeKind, NodeTree};
