//! Loop state types and transitions.
//!
//! This module defines the lifecycle enums, the flat persisted state map,
//! and the per-iteration execution record. State is deliberately stored as
//! a JSON object rather than a rigid struct: the controller owns a set of
//! reserved keys (see [`keys`]) and callers may attach arbitrary extra keys
//! through `update_state`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The flat key→value map persisted for each loop.
pub type StateMap = serde_json::Map<String, Value>;

/// Reserved state keys owned by the controller.
pub mod keys {
    /// Current [`LoopState`](super::LoopState), stored as its wire string.
    pub const STATE: &str = "state";
    /// RFC 3339 creation timestamp, written once on first construction.
    pub const CREATED_AT: &str = "created_at";
    /// Monotonically non-decreasing iteration counter, starts at 0.
    pub const CURRENT_ITERATION: &str = "current_iteration";
    /// Optional iteration cap.
    pub const MAX_ITERATIONS: &str = "max_iterations";
    /// Epoch seconds when the current run started.
    pub const START_TIME: &str = "start_time";
    /// Epoch seconds when the loop reached a terminal state.
    pub const END_TIME: &str = "end_time";
    /// [`TerminationReason`](super::TerminationReason) wire string.
    pub const TERMINATION_REASON: &str = "termination_reason";
    /// Free-form detail recorded alongside the termination reason.
    pub const TERMINATION_DETAILS: &str = "termination_details";
    /// Map of resource name → numeric usage, pushed by the caller.
    pub const RESOURCE_USAGE: &str = "resource_usage";
    /// Bounded ordered list of [`ExecutionRecord`](super::ExecutionRecord)s.
    pub const EXECUTION_HISTORY: &str = "execution_history";
    /// Count of failed iterations in the current run.
    pub const ERROR_COUNT: &str = "error_count";
    /// Message from the most recent failed iteration.
    pub const LAST_ERROR: &str = "last_error";
    /// Caller-owned metadata map.
    pub const METADATA: &str = "metadata";
}

/// Lifecycle state of a loop.
///
/// Created `Initialized` on first construction, moves to `Running` on
/// `start`, and ends in exactly one of the terminal states. There is no
/// paused state: every state other than `Initialized` and `Running` is
/// terminal.
///
/// # Example
///
/// ```
/// use cadence::state::LoopState;
///
/// assert_eq!(LoopState::Completed.to_string(), "completed");
/// assert!(LoopState::Completed.is_terminal());
/// assert!(!LoopState::Running.is_terminal());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Constructed but never started
    Initialized,
    /// Execution loop is live
    Running,
    /// Terminated by a condition, iteration cap, or natural completion
    Completed,
    /// Terminated by the error threshold or a dependency failure
    Failed,
    /// Terminated by a manual stop
    Aborted,
}

impl LoopState {
    /// The string form used in the persisted state map.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Initialized => "initialized",
            LoopState::Running => "running",
            LoopState::Completed => "completed",
            LoopState::Failed => "failed",
            LoopState::Aborted => "aborted",
        }
    }

    /// Whether this state is terminal (no further transitions).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopState::Completed | LoopState::Failed | LoopState::Aborted
        )
    }

    /// Parse a wire string back into a state.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialized" => Some(LoopState::Initialized),
            "running" => Some(LoopState::Running),
            "completed" => Some(LoopState::Completed),
            "failed" => Some(LoopState::Failed),
            "aborted" => Some(LoopState::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a loop terminated.
///
/// Recorded exactly once at finalization; maps deterministically onto the
/// final [`LoopState`] via [`TerminationReason::final_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Execution loop exited without any other reason firing
    Completed,
    /// Iteration counter reached the configured cap
    MaxIterations,
    /// A timeout condition fired
    Timeout,
    /// A resource-limit condition fired
    ResourceLimit,
    /// A registered condition reported met
    ConditionMet,
    /// The error threshold was reached
    Error,
    /// An external collaborator failed
    DependencyFailure,
    /// The caller requested a stop
    Manual,
}

impl TerminationReason {
    /// The string form used in the persisted state map.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Completed => "completed",
            TerminationReason::MaxIterations => "max_iterations",
            TerminationReason::Timeout => "timeout",
            TerminationReason::ResourceLimit => "resource_limit",
            TerminationReason::ConditionMet => "condition_met",
            TerminationReason::Error => "error",
            TerminationReason::DependencyFailure => "dependency_failure",
            TerminationReason::Manual => "manual",
        }
    }

    /// The terminal [`LoopState`] this reason maps to.
    ///
    /// The mapping is fixed: it is not reconfigurable by callers.
    #[must_use]
    pub fn final_state(&self) -> LoopState {
        match self {
            TerminationReason::Completed
            | TerminationReason::MaxIterations
            | TerminationReason::Timeout
            | TerminationReason::ResourceLimit
            | TerminationReason::ConditionMet => LoopState::Completed,
            TerminationReason::Error | TerminationReason::DependencyFailure => LoopState::Failed,
            TerminationReason::Manual => LoopState::Aborted,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single iteration, retained in the bounded execution history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    /// Iteration index at the time the record was appended (0-based).
    pub iteration: u64,
    /// Epoch seconds when the iteration finished.
    pub timestamp: f64,
    /// Whether the iteration function returned successfully.
    pub success: bool,
    /// Wall-clock duration of the iteration function in milliseconds.
    pub duration_ms: u64,
    /// Stringified result, truncated to the configured byte limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Error message when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ----------------------------------------------------------------------------
// Typed readers over the flat state map
// ----------------------------------------------------------------------------

/// Read an unsigned integer key, defaulting to 0 when absent or non-numeric.
#[must_use]
pub fn get_u64(state: &StateMap, key: &str) -> u64 {
    state.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// Read an optional unsigned integer key.
#[must_use]
pub fn get_opt_u64(state: &StateMap, key: &str) -> Option<u64> {
    state.get(key).and_then(Value::as_u64)
}

/// Read an optional float key (epoch timestamps).
#[must_use]
pub fn get_opt_f64(state: &StateMap, key: &str) -> Option<f64> {
    state.get(key).and_then(Value::as_f64)
}

/// Read an optional string key.
#[must_use]
pub fn get_str<'a>(state: &'a StateMap, key: &str) -> Option<&'a str> {
    state.get(key).and_then(Value::as_str)
}

/// Read the current [`LoopState`] from a state map, if present and valid.
#[must_use]
pub fn loop_state_of(state: &StateMap) -> Option<LoopState> {
    get_str(state, keys::STATE).and_then(LoopState::parse)
}

/// Deserialize the execution history from a state map.
///
/// Missing or malformed history yields an empty list rather than an error;
/// the history is diagnostic data, not a correctness input.
#[must_use]
pub fn execution_history_of(state: &StateMap) -> Vec<ExecutionRecord> {
    state
        .get(keys::EXECUTION_HISTORY)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

/// Current wall-clock time as fractional epoch seconds.
#[must_use]
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
