//! Wildcard value cycling and usage tracking.

mod factory;
mod manager;
mod usage;

pub use factory::{SharedManager, WildcardFactory};
pub use manager::WildcardManager;
pub use usage::{UsageCounts, UsageStore};
