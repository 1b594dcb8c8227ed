//! Demo configuration file handling
//!
//! ```toml
//! unkeyed = false
//!
//! [manager]
//! recycle_pool_capacity = 8
//! freeze_during_compute = true
//! max_update_rounds = 100
//! ```

use anyhow::{Context, Result};
use ripple_core::ManagerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DemoConfig {
    /// Reconcile by index instead of by key
    #[serde(default)]
    pub unkeyed: bool,
    #[serde(default)]
    pub manager: ManagerConfig,
}

impl DemoConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}
