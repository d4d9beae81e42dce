//! cadence metrics server
//!
//! Load jobs post their observations here; the controller reads them back
//! once a job has finished. Rows land in the configured
//! [`StorageBackend`](cadence_metrics_store::StorageBackend).

pub mod api;
pub mod config;
pub mod state;
