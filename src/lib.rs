//! Earnings Tracker Library
//!
//! Tracks earnings-report dates and post-report price reactions for index
//! constituents. Exposes the reconciliation pipeline and the read-side view
//! for use by the binary and tests.

pub mod batch;
pub mod config;
pub mod models;
pub mod query;
pub mod reconcile;
pub mod source;
pub mod stats;
pub mod store;

pub use config::AppConfig;
pub use models::{Dataset, Entity, EntityRecord, Symbol};
pub use reconcile::{ReconcileReport, Reconciler};
pub use store::SnapshotStore;
