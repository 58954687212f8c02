//! Holder-league pipeline: page holders, classify against the ladder,
//! reconcile TOTAL, compare with last week, publish.

pub mod classifier;
pub mod history;
pub mod orchestrator;
pub mod pager;
pub mod publisher;
pub mod reconciler;
pub mod store_impls;
pub mod store_traits;
pub mod tracker;
