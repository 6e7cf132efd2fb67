//! Relay engine: async glue between the backend and the relay_core stores.
mod backend;
mod engine;
mod persist;
mod reconcile;
mod settings;

pub use backend::{Backend, BackendError};
pub use engine::SyncEngine;
pub use persist::{ensure_state_dir, AtomicFileWriter, PersistError};
pub use reconcile::{ReconcileError, ReconciliationReader};
pub use settings::EngineSettings;
