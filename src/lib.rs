//! Library root for the `snapguard` crate
//! Deployment snapshot & rollback controller

// Core error handling
pub mod errors;

// Configuration & logging
pub mod config;
pub mod config_loader;
pub mod log_sink;

// Snapshot model and storage
pub mod archive;
pub mod integrity;
pub mod lock;
pub mod registry;
pub mod secure_file_ops;
pub mod snapshot;
pub mod store;

// Rollback & retention
pub mod audit;
pub mod cancel;
pub mod emergency;
pub mod retention;
pub mod rollback;

// Health scoring & auto-recovery
pub mod health;
pub mod recovery;

// External collaborators
pub mod collaborators;
pub mod notify;
pub mod process;

// Wiring & CLI
pub mod cli;
pub mod controller;


pub use cancel::CancelToken;
pub use config::ControllerConfig;
pub use controller::Controller;
pub use errors::{SnapError, SnapResult};
pub use rollback::{RollbackOptions, RollbackReport};
pub use snapshot::{Snapshot, SnapshotKind, SnapshotOptions};
pub use store::{CreateRequest, SnapshotStore};
