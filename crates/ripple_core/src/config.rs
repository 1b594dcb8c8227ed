//! Manager configuration

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tunables of a [`StateManager`](crate::StateManager)
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    /// Maximum number of recycled scopes parked under one node
    pub recycle_pool_capacity: usize,
    /// Serve committed snapshots (ignoring journaled writes) while a root
    /// scope is computing
    pub freeze_during_compute: bool,
    /// Upper bound on dirty-root recomputations in one update pass
    pub max_update_rounds: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            recycle_pool_capacity: 32,
            freeze_during_compute: true,
            max_update_rounds: 1000,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recycle_pool_capacity(mut self, capacity: usize) -> Self {
        self.recycle_pool_capacity = capacity;
        self
    }

    pub fn freeze_during_compute(mut self, freeze: bool) -> Self {
        self.freeze_during_compute = freeze;
        self
    }

    pub fn max_update_rounds(mut self, rounds: usize) -> Self {
        self.max_update_rounds = rounds;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = ManagerConfig::new()
            .recycle_pool_capacity(4)
            .freeze_during_compute(false)
            .max_update_rounds(10);
        assert_eq!(config.recycle_pool_capacity, 4);
        assert!(!config.freeze_during_compute);
        assert_eq!(config.max_update_rounds, 10);
        assert_eq!(ManagerConfig::default().recycle_pool_capacity, 32);
    }
}
