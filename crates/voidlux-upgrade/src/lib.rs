//! # VoidLux Upgrade
//!
//! The seneschal's rolling-upgrade coordinator: canary a single worker,
//! roll the rest sequentially, restart the emperor last (regicide), and
//! revert every updated node the moment anything fails. Every run is
//! persisted to the upgrade history.

mod coordinator;
mod switcher;

pub use coordinator::{UpgradeConfig, UpgradeCoordinator};
pub use switcher::{CommitSwitcher, NullSwitcher};
