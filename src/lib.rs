//! Cadence - Transactional Loop Controller
//!
//! A controller for long-running iteration loops with durable,
//! transactional state: every state change goes through an atomic
//! write-ahead transaction, termination is decided by pluggable
//! conditions, and a loop's full history can be rebuilt from its
//! committed transaction log.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`controller`] - Loop lifecycle: start, iterate, terminate
//! - [`conditions`] - Termination condition trait and built-ins
//! - [`persistence`] - Transactional state storage with atomic file writes
//! - [`state`] - Persisted state vocabulary and typed accessors
//! - [`error`] - Custom error types and handling
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cadence::{ControllerConfig, LoopController, PersistenceConfig, StatePersistenceManager};
//!
//! let persistence = Arc::new(StatePersistenceManager::new(
//!     PersistenceConfig::new(".cadence"),
//! )?);
//!
//! let controller = LoopController::new("nightly-sync", persistence, ControllerConfig::default())?;
//! controller.set_max_iterations(100)?;
//! controller.set_timeout(3600.0)?;
//!
//! controller.start(|state| {
//!     // one unit of work per iteration
//!     Ok(serde_json::json!({"synced": true}))
//! }).await?;
//! ```

pub mod conditions;
pub mod controller;
pub mod error;
pub mod persistence;
pub mod state;

// Re-export commonly used types
pub use error::{CadenceError, Result};

// Re-export controller types
pub use controller::{ControllerConfig, IterationFn, LoopController};

// Re-export condition types
pub use conditions::{
    ConditionCheck, MaxIterationsCondition, PredicateCondition, ResourceLimitCondition,
    TerminationCondition, TimeoutCondition,
};

// Re-export persistence types
pub use persistence::{
    transaction::{StateTransaction, TransactionStatus},
    PersistenceConfig, StatePersistenceManager,
};

// Re-export state vocabulary
pub use state::{keys, ExecutionRecord, LoopState, StateMap, TerminationReason};
