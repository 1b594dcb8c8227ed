//! Runtime error types

use thiserror::Error;

use crate::key::CallsiteKey;

/// Errors raised by the recomputation runtime.
///
/// Two families exist. Contract violations are caused by the integrating code
/// (creating state at the top level, mutating a tracked state while it is being
/// computed, ...). Consistency violations mean the tree-node bookkeeping was
/// driven outside of its protocol. Neither family is caught inside the runtime:
/// they surface at the entry point that started the recomputation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// A scope was requested while no scope is being computed
    #[error("prohibited to create scope({0}) for the top level")]
    TopLevelScope(CallsiteKey),

    /// A local state was requested while no scope is being computed
    #[error("prohibited to create local state for the top level; pass global = Some(true)")]
    TopLevelState,

    /// A local unnamed state was created outside of a remember scope
    #[error("unnamed local state must be remembered")]
    UnrememberedLocalState,

    /// A state or scope was created while a named state initializer was running
    #[error("prohibited when computing state({0})")]
    CreationProhibited(String),

    /// A state with dependents was written while a scope is being computed
    #[error("prohibited to modify state({0}) while computing scope({1})")]
    ModifyDuringComputation(String, CallsiteKey),

    /// A parameter state was written through a mutable accessor
    #[error("parameter state({0}) can only be changed by its scope")]
    ParameterWrite(String),

    /// A named lookup found no definition in the scope ancestry or global table
    #[error("state named \"{0}\" is not defined")]
    UnknownName(String),

    /// A context-local name was defined twice in the same scope
    #[error("state name \"{0}\" must be unique")]
    DuplicateName(String),

    /// A parameter index exceeds the arity declared for the scope
    #[error("parameter index {index} is out of bounds for {count} parameters")]
    ParamOutOfBounds { index: usize, count: usize },

    /// The state handle refers to a disposed state (or a dropped manager)
    #[error("state is disposed")]
    DisposedState,

    /// The scope handle refers to a disposed scope
    #[error("scope is disposed")]
    DisposedScope,

    /// A value was read back with a different type than it was stored with
    #[error("value type mismatch: expected {0}")]
    TypeMismatch(&'static str),

    /// The cached value of a scope was requested before its first computation
    #[error("scope({0}) has no computed value")]
    NotComputed(CallsiteKey),

    /// A node that already has a parent was attached to a different parent
    #[error("child node belongs to another parent")]
    ForeignChild,

    /// A skip walked past the last child of a node
    #[error("child node is expected here")]
    ChildExpected,

    /// A skip was requested with a count of zero
    #[error("unexpected count of child nodes to skip: {0}")]
    InvalidSkip(usize),

    /// A disposed node was passed to the incremental update protocol
    #[error("child node is already disposed")]
    DisposedNode,

    /// Dirty scopes kept invalidating each other
    #[error("dirty scopes did not settle after {0} rounds")]
    UpdateLoop(usize),

    /// Failure reported by a user callback (compute, cleanup, update)
    #[error("{0}")]
    Callback(String),
}

impl RuntimeError {
    /// Create an error for a failing user callback
    pub fn callback(message: impl Into<String>) -> Self {
        RuntimeError::Callback(message.into())
    }

    /// Returns true for errors caused by the detected corruption of tree bookkeeping
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            RuntimeError::ChildExpected | RuntimeError::InvalidSkip(_) | RuntimeError::DisposedNode
        )
    }

    /// Returns true for errors caused by the integrating code breaking a usage contract
    pub fn is_contract_violation(&self) -> bool {
        !self.is_consistency_violation() && !matches!(self, RuntimeError::Callback(_))
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
