// src/resolver/mod.rs

//! Dependency and supersedence resolution
//!
//! This module turns an install request into an ordered install graph:
//! - `supersedence` holds the pure update/upgrade classification and the
//!   who-wins priority arbitration
//! - `engine` walks dependencies and supersedents recursively
//! - `plan` is the resolved, deduplicated install order

pub mod engine;
pub mod plan;
pub mod supersedence;

pub use engine::Resolver;
pub use plan::InstallGraph;
pub use supersedence::{
    MatchRule, PriorityTier, ScanRule, is_update_for, is_upgrade_for, supersedes, who_wins,
};
