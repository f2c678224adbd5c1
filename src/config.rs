//! Configuration system
//!
//! Provides hierarchical configuration loading from:
//! - `aggview.toml` (default configuration)
//! - `aggview.local.toml` (git-ignored local overrides)
//! - Environment variables (`AGGVIEW_*` prefix)
//!
//! ## Example
//!
//! ```toml
//! # aggview.toml
//! [planner]
//! top_k_threshold = 1000
//! vectorize_group_by = true
//! ```
//!
//! ```bash
//! AGGVIEW_PLANNER__TOP_K_THRESHOLD=500
//! ```

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Top-level configuration for a streaming collection / planner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub planner: PlannerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Planner tunables referenced by spec.md §4.2's optimization hints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannerConfig {
    /// `$sort` immediately followed by `$limit` with a constant below this
    /// threshold switches the sort stage into bounded top-k mode (its
    /// order-stat tree never grows past this many entries).
    pub top_k_threshold: usize,

    /// Attempt `canVectorize` planning for single-field numeric group-bys
    /// over a backing column, when one exists.
    #[serde(default = "default_true")]
    pub vectorize_group_by: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            // Below this, rebuilding a full order-stat tree per delta is
            // cheaper than the bookkeeping a capped tree needs; above it,
            // bounding the tree to k entries pays for itself.
            top_k_threshold: 1_000,
            vectorize_group_by: true,
        }
    }
}

/// Columnar store tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Initial capacity hint for lazily-created columns and the live-set
    /// bitset, to avoid repeated reallocation during bulk loads.
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            initial_capacity: default_initial_capacity(),
        }
    }
}

fn default_initial_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Config {
            planner: PlannerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration layering `aggview.toml`, `aggview.local.toml`,
    /// and `AGGVIEW_*` environment variables over the built-in defaults.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file("aggview.toml"))
            .merge(Toml::file("aggview.local.toml"))
            .merge(Env::prefixed("AGGVIEW_").split("__"))
            .extract()
    }
}
