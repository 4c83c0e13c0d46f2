//! Loop lifecycle controller.
//!
//! A [`LoopController`] owns exactly one named loop: it runs a
//! caller-supplied iteration function on a spawned background task,
//! persists every state change transactionally, evaluates termination
//! conditions in registration order, and guarantees that termination is
//! recorded exactly once with a consistent (state, reason) pair.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cadence::controller::{ControllerConfig, LoopController};
//! use cadence::persistence::{PersistenceConfig, StatePersistenceManager};
//!
//! let persistence = Arc::new(StatePersistenceManager::new(
//!     PersistenceConfig::new(".cadence"),
//! )?);
//! let controller = LoopController::new("loop-1", persistence, ControllerConfig::default())?;
//!
//! controller.set_max_iterations(10)?;
//! controller.start(|state| Ok(state.len().into())).await?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::conditions::{
    MaxIterationsCondition, PredicateCondition, ResourceLimitCondition, TerminationCondition,
    TimeoutCondition,
};
use crate::error::{CadenceError, Result};
use crate::persistence::StatePersistenceManager;
use crate::state::{
    self, keys, ExecutionRecord, LoopState, StateMap, TerminationReason,
};

/// Iteration function run once per loop cycle.
///
/// Receives a snapshot of the loop's state and returns an arbitrary JSON
/// value on success. An `Err` counts as a failed iteration; failures below
/// the error threshold are tolerated and the loop re-enters.
pub type IterationFn = Arc<dyn Fn(&StateMap) -> anyhow::Result<Value> + Send + Sync>;

/// Tuning knobs for a controller.
///
/// Defaults mirror long-standing behavior: three tolerated iteration
/// failures, a five second stop grace period, and a hundred-entry
/// execution history.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Failed iterations tolerated before the loop terminates with an error.
    pub error_threshold: u32,
    /// How long `stop` waits for the execution task to acknowledge
    /// cancellation before recording the abort anyway.
    pub stop_grace: Duration,
    /// Maximum execution-history entries retained; oldest evicted first.
    pub history_limit: usize,
    /// Byte cap on stringified iteration results stored in history.
    pub result_max_bytes: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            stop_grace: Duration::from_secs(5),
            history_limit: 100,
            result_max_bytes: 256,
        }
    }
}

impl ControllerConfig {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the error threshold.
    #[must_use]
    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Set the stop grace period.
    #[must_use]
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Set the execution-history cap.
    #[must_use]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Set the stored-result byte cap.
    #[must_use]
    pub fn with_result_max_bytes(mut self, max_bytes: usize) -> Self {
        self.result_max_bytes = max_bytes;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.error_threshold == 0 {
            return Err(CadenceError::invalid_config(
                "error_threshold",
                "must be at least 1",
            ));
        }
        if self.history_limit == 0 {
            return Err(CadenceError::invalid_config(
                "history_limit",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn unpoison<'a, T>(
    result: std::result::Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Cancellation and finalization flags for one run of the execution loop.
///
/// Each `start` issues a fresh token and the spawned task keeps its own
/// handle to it: a task still blocked inside the iteration function when
/// its run's grace period expires stays cancelled forever instead of being
/// revived by a later restart.
struct RunToken {
    /// Cooperative cancellation signal, observed between iterations.
    cancel: AtomicBool,
    /// Set exactly once by whichever termination path wins the race.
    finalized: AtomicBool,
}

impl RunToken {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        })
    }
}

/// State shared between the controller handle and its execution task.
struct Inner {
    loop_id: String,
    persistence: Arc<StatePersistenceManager>,
    config: ControllerConfig,
    /// Registered conditions in registration order; name-keyed replacement
    /// keeps the original slot.
    conditions: StdMutex<Vec<Arc<dyn TerminationCondition>>>,
    /// Token of the current (or most recent) run.
    token: StdMutex<Arc<RunToken>>,
}

impl Inner {
    fn current_token(&self) -> Arc<RunToken> {
        unpoison(self.token.lock()).clone()
    }

    /// Evaluate conditions in registration order against a snapshot.
    /// First met wins; the rest are not evaluated.
    fn first_met_condition(&self, snapshot: &StateMap) -> Option<(String, Option<String>)> {
        let conditions = unpoison(self.conditions.lock());
        for condition in conditions.iter() {
            let check = condition.check(snapshot);
            if check.met {
                return Some((condition.name().to_string(), check.reason));
            }
        }
        None
    }

    /// Record termination exactly once: final state, end time, reason, and
    /// details in one transaction, then raise the cancellation signal.
    ///
    /// Losing the first-finalization race is a no-op.
    fn finalize(&self, token: &RunToken, reason: TerminationReason, details: impl Into<String>) {
        if token
            .finalized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(
                "Loop '{}' already finalized; ignoring late {reason}",
                self.loop_id
            );
            return;
        }

        let details = details.into();
        info!(
            "Loop '{}' terminating: {reason} ({details})",
            self.loop_id
        );

        let final_state = reason.final_state();
        let result = self.persistence.with_transaction(&self.loop_id, |_state, txn| {
            txn.set(keys::STATE, final_state.as_str());
            txn.set(keys::END_TIME, state::epoch_now());
            txn.set(keys::TERMINATION_REASON, reason.as_str());
            txn.set(keys::TERMINATION_DETAILS, details.clone());
            txn.annotate("event", "termination");
            Ok(())
        });
        if let Err(e) = result {
            error!(
                "Loop '{}': failed to record termination: {e}",
                self.loop_id
            );
        }

        token.cancel.store(true, Ordering::SeqCst);
    }

    /// The background execution routine.
    async fn execution_loop(self: Arc<Self>, token: Arc<RunToken>, iteration_fn: IterationFn) {
        debug!("Loop '{}': execution task started", self.loop_id);
        self.run_iterations(&token, iteration_fn).await;

        if token.cancel.load(Ordering::SeqCst) && !token.finalized.load(Ordering::SeqCst) {
            // Exited via cancellation: stop() owns recording the abort.
            debug!("Loop '{}': cancellation observed, exiting", self.loop_id);
            return;
        }
        // Catch-all for any exit without an explicit termination.
        self.finalize(&token, TerminationReason::Completed, "execution loop exited");
    }

    async fn run_iterations(&self, token: &RunToken, iteration_fn: IterationFn) {
        while !token.cancel.load(Ordering::SeqCst) {
            let snapshot = self.persistence.load_state(&self.loop_id);

            // A panicking condition must not unwind out of the task and
            // strand the loop in running.
            let evaluated = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.first_met_condition(&snapshot)
            }));
            let fired = match evaluated {
                Ok(fired) => fired,
                Err(payload) => {
                    self.finalize(
                        token,
                        TerminationReason::Error,
                        format!("condition check panicked: {}", panic_message(&*payload)),
                    );
                    return;
                }
            };
            if let Some((name, reason)) = fired {
                let details = reason.unwrap_or_else(|| format!("condition '{name}' met"));
                self.finalize(token, TerminationReason::ConditionMet, details);
                return;
            }

            let iteration = state::get_u64(&snapshot, keys::CURRENT_ITERATION);
            let started = Instant::now();
            let outcome = run_iteration_fn(&iteration_fn, &snapshot);
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    if !self.record_success(token, iteration, duration_ms, &value) {
                        return;
                    }
                    let current = self.persistence.load_state(&self.loop_id);
                    if let Some(max) = state::get_opt_u64(&current, keys::MAX_ITERATIONS) {
                        if state::get_u64(&current, keys::CURRENT_ITERATION) >= max {
                            self.finalize(
                                token,
                                TerminationReason::MaxIterations,
                                format!("completed {max} iterations"),
                            );
                            return;
                        }
                    }
                }
                Err(message) => {
                    let Some(error_count) =
                        self.record_failure(token, iteration, duration_ms, &message)
                    else {
                        return;
                    };
                    if error_count >= u64::from(self.config.error_threshold) {
                        self.finalize(token, TerminationReason::Error, message);
                        return;
                    }
                    warn!(
                        "Loop '{}': iteration {iteration} failed ({error_count}/{}): {message}",
                        self.loop_id, self.config.error_threshold
                    );
                }
            }

            // Keep the scheduler fair; iterations themselves are opaque.
            tokio::task::yield_now().await;
        }
    }

    /// Append a success record and increment the iteration counter in one
    /// transaction. Returns false if the commit failed (loop terminates).
    fn record_success(
        &self,
        token: &RunToken,
        iteration: u64,
        duration_ms: u64,
        value: &Value,
    ) -> bool {
        let result_string = stringify_result(value, self.config.result_max_bytes);
        let history_limit = self.config.history_limit;

        let committed = self.persistence.with_transaction(&self.loop_id, |current, txn| {
            let mut history = state::execution_history_of(current);
            history.push(ExecutionRecord {
                iteration,
                timestamp: state::epoch_now(),
                success: true,
                duration_ms,
                result: Some(result_string.clone()),
                error: None,
            });
            bound_history(&mut history, history_limit);
            txn.set(keys::EXECUTION_HISTORY, serde_json::to_value(&history)?);

            let counter = state::get_u64(current, keys::CURRENT_ITERATION);
            txn.set(keys::CURRENT_ITERATION, counter + 1);
            Ok(())
        });

        match committed {
            Ok(_) => true,
            Err(e) => {
                error!(
                    "Loop '{}': failed to commit iteration {iteration}: {e}",
                    self.loop_id
                );
                self.finalize(
                    token,
                    TerminationReason::Error,
                    format!("state commit failed: {e}"),
                );
                false
            }
        }
    }

    /// Append a failure record, bump `error_count`, and store `last_error`
    /// in one transaction. The iteration counter does not move on failure.
    /// Returns the new error count, or `None` if the commit failed.
    fn record_failure(
        &self,
        token: &RunToken,
        iteration: u64,
        duration_ms: u64,
        message: &str,
    ) -> Option<u64> {
        let history_limit = self.config.history_limit;
        let mut new_count = 0u64;

        let committed = self.persistence.with_transaction(&self.loop_id, |current, txn| {
            let mut history = state::execution_history_of(current);
            history.push(ExecutionRecord {
                iteration,
                timestamp: state::epoch_now(),
                success: false,
                duration_ms,
                result: None,
                error: Some(message.to_string()),
            });
            bound_history(&mut history, history_limit);
            txn.set(keys::EXECUTION_HISTORY, serde_json::to_value(&history)?);

            new_count = state::get_u64(current, keys::ERROR_COUNT) + 1;
            txn.set(keys::ERROR_COUNT, new_count);
            txn.set(keys::LAST_ERROR, message);
            Ok(())
        });

        match committed {
            Ok(_) => Some(new_count),
            Err(e) => {
                error!(
                    "Loop '{}': failed to commit failed iteration {iteration}: {e}",
                    self.loop_id
                );
                self.finalize(
                    token,
                    TerminationReason::Error,
                    format!("state commit failed: {e}"),
                );
                None
            }
        }
    }
}

/// Run the iteration function, converting panics into failed iterations.
fn run_iteration_fn(
    iteration_fn: &IterationFn,
    snapshot: &StateMap,
) -> std::result::Result<Value, String> {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        iteration_fn(snapshot)
    }));
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        // Deref the box so downcasting sees the payload, not the Box
        // itself unsized into the trait object.
        Err(payload) => Err(format!("iteration panicked: {}", panic_message(&*payload))),
    }
}

/// Best-effort extraction of a panic payload's message.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Stringify an iteration result, bounded so history cannot grow unbounded.
fn stringify_result(value: &Value, max_bytes: usize) -> String {
    let mut s = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if s.len() > max_bytes {
        let mut end = max_bytes;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

/// FIFO bound: evict oldest entries once the cap is exceeded.
fn bound_history(history: &mut Vec<ExecutionRecord>, limit: usize) {
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(0..excess);
    }
}

/// Owns the lifecycle of one named loop.
///
/// Construction seeds a fresh loop's persisted state (or resumes an
/// existing one untouched). `start` spawns the execution task and returns
/// immediately; `stop` requests cooperative cancellation.
pub struct LoopController {
    inner: Arc<Inner>,
    /// Handle of the live execution task, if any. Guarded so concurrent
    /// `start` calls cannot spawn twice.
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LoopController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopController")
            .field("loop_id", &self.inner.loop_id)
            .finish_non_exhaustive()
    }
}

impl LoopController {
    /// Create a controller for the given loop id.
    ///
    /// A fresh loop is seeded as `initialized` with zeroed counters in one
    /// transaction; an existing loop's state is left untouched so a
    /// controller can be re-attached after a restart.
    ///
    /// # Errors
    ///
    /// Returns an error if the loop id is empty or not usable as a
    /// directory name, if the configuration is invalid, or if seeding the
    /// initial state fails.
    pub fn new(
        loop_id: impl Into<String>,
        persistence: Arc<StatePersistenceManager>,
        config: ControllerConfig,
    ) -> Result<Self> {
        let loop_id = loop_id.into();
        validate_loop_id(&loop_id)?;
        config.validate()?;

        let inner = Arc::new(Inner {
            loop_id: loop_id.clone(),
            persistence,
            config,
            conditions: StdMutex::new(Vec::new()),
            token: StdMutex::new(RunToken::new()),
        });

        let existing = inner.persistence.load_state(&loop_id);
        if !existing.contains_key(keys::STATE) {
            inner.persistence.with_transaction(&loop_id, |_state, txn| {
                txn.set(keys::STATE, LoopState::Initialized.as_str());
                txn.set(keys::CREATED_AT, chrono::Utc::now().to_rfc3339());
                txn.set(keys::CURRENT_ITERATION, 0);
                txn.set(keys::ERROR_COUNT, 0);
                txn.set(keys::RESOURCE_USAGE, json!({}));
                txn.set(keys::EXECUTION_HISTORY, json!([]));
                txn.set(keys::METADATA, json!({}));
                txn.annotate("event", "initialized");
                Ok(())
            })?;
            debug!("Seeded initial state for loop '{loop_id}'");
        }

        Ok(Self {
            inner,
            handle: tokio::sync::Mutex::new(None),
        })
    }

    /// The immutable identity of this loop.
    #[must_use]
    pub fn loop_id(&self) -> &str {
        &self.inner.loop_id
    }

    /// The controller configuration.
    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------------
    // State access
    // ------------------------------------------------------------------------

    /// Current persisted state snapshot (read-through).
    #[must_use]
    pub fn get_state(&self) -> StateMap {
        self.inner.persistence.load_state(&self.inner.loop_id)
    }

    /// Apply an arbitrary set of key updates as one transaction.
    ///
    /// A `null` value deletes the key.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be committed.
    pub fn update_state(&self, updates: StateMap) -> Result<()> {
        self.inner
            .persistence
            .with_transaction(&self.inner.loop_id, |_state, txn| {
                for (key, value) in &updates {
                    txn.set(key.clone(), value.clone());
                }
                txn.annotate("event", "update_state");
                Ok(())
            })?;
        Ok(())
    }

    /// Report a resource's current usage (push-based; absolute value).
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be committed.
    pub fn update_resource_usage(&self, resource: &str, usage: f64) -> Result<()> {
        self.inner
            .persistence
            .with_transaction(&self.inner.loop_id, |current, txn| {
                let mut usage_map = current
                    .get(keys::RESOURCE_USAGE)
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                usage_map.insert(resource.to_string(), json!(usage));
                txn.set(keys::RESOURCE_USAGE, Value::Object(usage_map));
                Ok(())
            })?;
        Ok(())
    }

    /// Ordered per-iteration outcome records.
    #[must_use]
    pub fn get_execution_history(&self) -> Vec<ExecutionRecord> {
        state::execution_history_of(&self.get_state())
    }

    /// Whether the persisted state says the loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        state::loop_state_of(&self.get_state()) == Some(LoopState::Running)
    }

    // ------------------------------------------------------------------------
    // Condition registration
    // ------------------------------------------------------------------------

    /// Cap the iteration count, persisting the cap and installing the
    /// matching condition.
    ///
    /// # Errors
    ///
    /// Returns an error if `max_iterations` is zero or persistence fails.
    pub fn set_max_iterations(&self, max_iterations: u64) -> Result<()> {
        let condition = MaxIterationsCondition::new(max_iterations)?;
        self.inner
            .persistence
            .with_transaction(&self.inner.loop_id, |_state, txn| {
                txn.set(keys::MAX_ITERATIONS, max_iterations);
                Ok(())
            })?;
        self.add_termination_condition(Arc::new(condition));
        Ok(())
    }

    /// Bound total run time, persisting the span and installing the
    /// matching condition.
    ///
    /// # Errors
    ///
    /// Returns an error if `seconds` is not positive finite or persistence
    /// fails.
    pub fn set_timeout(&self, seconds: f64) -> Result<()> {
        let condition = TimeoutCondition::new(seconds)?;
        self.inner
            .persistence
            .with_transaction(&self.inner.loop_id, |_state, txn| {
                txn.set("timeout_seconds", seconds);
                Ok(())
            })?;
        self.add_termination_condition(Arc::new(condition));
        Ok(())
    }

    /// Limit one resource's usage, persisting the limit and installing the
    /// matching condition.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameters are invalid or persistence fails.
    pub fn set_resource_limit(&self, resource: &str, limit: f64) -> Result<()> {
        let condition = ResourceLimitCondition::new(resource, limit)?;
        self.inner
            .persistence
            .with_transaction(&self.inner.loop_id, |current, txn| {
                let mut limits = current
                    .get("resource_limits")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                limits.insert(resource.to_string(), json!(limit));
                txn.set("resource_limits", Value::Object(limits));
                Ok(())
            })?;
        self.add_termination_condition(Arc::new(condition));
        Ok(())
    }

    /// Install a condition. Conditions are keyed by name: re-adding a name
    /// replaces the prior condition in place, keeping its registration
    /// slot. This is permitted reconfiguration, not an error.
    pub fn add_termination_condition(&self, condition: Arc<dyn TerminationCondition>) {
        let mut conditions = unpoison(self.inner.conditions.lock());
        if let Some(slot) = conditions
            .iter_mut()
            .find(|c| c.name() == condition.name())
        {
            debug!(
                "Loop '{}': replacing condition '{}'",
                self.inner.loop_id,
                condition.name()
            );
            *slot = condition;
        } else {
            conditions.push(condition);
        }
    }

    /// Install a named custom predicate.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty.
    pub fn add_custom_condition(
        &self,
        name: impl Into<String>,
        predicate: impl Fn(&StateMap) -> crate::conditions::ConditionCheck + Send + Sync + 'static,
    ) -> Result<()> {
        let condition = PredicateCondition::new(name, predicate)?;
        self.add_termination_condition(Arc::new(condition));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start the execution loop. Non-blocking: the iteration function runs
    /// on a spawned task and this call returns once the task is launched.
    ///
    /// Starting a loop that is already running is a logged no-op, not an
    /// error; callers that need to detect it can poll state.
    ///
    /// # Errors
    ///
    /// Returns an error if the start transaction cannot be committed.
    pub async fn start<F>(&self, loop_fn: F) -> Result<()>
    where
        F: Fn(&StateMap) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        // Hold the handle lock across the check so two concurrent starts
        // cannot both spawn.
        let mut handle = self.handle.lock().await;

        if self.is_running() {
            warn!(
                "Loop '{}' is already running; start ignored",
                self.inner.loop_id
            );
            return Ok(());
        }

        // Fresh token per run: a task from a previous run that is still
        // blocked inside its iteration function keeps its own cancelled
        // token and can never rejoin.
        let token = RunToken::new();
        *unpoison(self.inner.token.lock()) = Arc::clone(&token);

        self.inner
            .persistence
            .with_transaction(&self.inner.loop_id, |_state, txn| {
                txn.set(keys::STATE, LoopState::Running.as_str());
                txn.set(keys::START_TIME, state::epoch_now());
                txn.set(keys::ERROR_COUNT, 0);
                txn.delete(keys::END_TIME);
                txn.delete(keys::TERMINATION_REASON);
                txn.delete(keys::TERMINATION_DETAILS);
                txn.delete(keys::LAST_ERROR);
                txn.annotate("event", "start");
                Ok(())
            })?;

        let inner = Arc::clone(&self.inner);
        let iteration_fn: IterationFn = Arc::new(loop_fn);
        *handle = Some(tokio::spawn(inner.execution_loop(token, iteration_fn)));

        info!("Loop '{}' started", self.inner.loop_id);
        Ok(())
    }

    /// Request cooperative cancellation and record the abort.
    ///
    /// Waits up to the configured grace period for the execution task to
    /// observe the signal, then records `aborted`/`manual` with the given
    /// details regardless. This is best-effort cancellation: an iteration
    /// already inside the iteration function may finish after `stop`
    /// returns, but the recorded (state, reason) pair can no longer change
    /// once written. Never fails from the caller's perspective.
    pub async fn stop(&self, details: impl Into<String>) {
        let details = details.into();
        info!("Loop '{}': stop requested ({details})", self.inner.loop_id);

        let token = self.inner.current_token();
        token.cancel.store(true, Ordering::SeqCst);

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            match tokio::time::timeout(self.inner.config.stop_grace, handle).await {
                Ok(Ok(())) => debug!("Loop '{}': execution task exited", self.inner.loop_id),
                Ok(Err(e)) => warn!(
                    "Loop '{}': execution task failed during stop: {e}",
                    self.inner.loop_id
                ),
                Err(_) => warn!(
                    "Loop '{}': execution task did not acknowledge cancellation within {:?}; recording abort anyway",
                    self.inner.loop_id, self.inner.config.stop_grace
                ),
            }
        }

        self.inner.finalize(&token, TerminationReason::Manual, details);
    }
}

fn validate_loop_id(loop_id: &str) -> Result<()> {
    if loop_id.is_empty() {
        return Err(CadenceError::invalid_config("loop_id", "must not be empty"));
    }
    if loop_id == "." || loop_id == ".." || loop_id.contains('/') || loop_id.contains('\\') {
        return Err(CadenceError::invalid_config(
            "loop_id",
            "must be usable as a directory name",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::ConditionCheck;
    use crate::persistence::PersistenceConfig;
    use tempfile::TempDir;

    fn temp_setup() -> (TempDir, Arc<StatePersistenceManager>) {
        let dir = TempDir::new().expect("create temp dir");
        let persistence = Arc::new(
            StatePersistenceManager::new(PersistenceConfig::new(dir.path().join("storage")))
                .expect("create manager"),
        );
        (dir, persistence)
    }

    fn controller(persistence: &Arc<StatePersistenceManager>, loop_id: &str) -> LoopController {
        LoopController::new(loop_id, Arc::clone(persistence), ControllerConfig::default())
            .expect("create controller")
    }

    /// Poll until the loop leaves the running state, panicking after a
    /// wall-clock deadline so a hung loop fails the test instead of the CI.
    async fn wait_until_stopped(controller: &LoopController) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while controller.is_running() {
            assert!(Instant::now() < deadline, "loop did not terminate in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_new_seeds_initial_state() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Initialized));
        assert_eq!(state::get_u64(&state, keys::CURRENT_ITERATION), 0);
        assert_eq!(state::get_u64(&state, keys::ERROR_COUNT), 0);
        assert!(state.contains_key(keys::CREATED_AT));
    }

    #[test]
    fn test_new_resumes_existing_state() {
        let (_dir, persistence) = temp_setup();
        {
            let first = controller(&persistence, "loop-1");
            let mut updates = StateMap::new();
            updates.insert(keys::CURRENT_ITERATION.into(), json!(7));
            first.update_state(updates).expect("update");
        }

        let resumed = controller(&persistence, "loop-1");
        let state = resumed.get_state();
        assert_eq!(state::get_u64(&state, keys::CURRENT_ITERATION), 7);
    }

    #[test]
    fn test_new_rejects_bad_loop_ids() {
        let (_dir, persistence) = temp_setup();
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            let result = LoopController::new(
                bad,
                Arc::clone(&persistence),
                ControllerConfig::default(),
            );
            assert!(result.is_err(), "loop id {bad:?} should be rejected");
        }
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let (_dir, persistence) = temp_setup();
        let result = LoopController::new(
            "loop-1",
            Arc::clone(&persistence),
            ControllerConfig::new().with_error_threshold(0),
        );
        assert!(result.is_err());

        let result = LoopController::new(
            "loop-1",
            Arc::clone(&persistence),
            ControllerConfig::new().with_history_limit(0),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_update_state_and_null_delete() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        let mut updates = StateMap::new();
        updates.insert("custom".into(), json!("value"));
        controller.update_state(updates).expect("update");
        assert_eq!(controller.get_state().get("custom"), Some(&json!("value")));

        let mut updates = StateMap::new();
        updates.insert("custom".into(), Value::Null);
        controller.update_state(updates).expect("update");
        assert!(!controller.get_state().contains_key("custom"));
    }

    #[test]
    fn test_update_resource_usage() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller
            .update_resource_usage("memory_mb", 128.0)
            .expect("update");
        controller
            .update_resource_usage("cpu_percent", 55.5)
            .expect("update");

        let state = controller.get_state();
        let usage = state
            .get(keys::RESOURCE_USAGE)
            .and_then(Value::as_object)
            .expect("usage map");
        assert_eq!(usage.get("memory_mb"), Some(&json!(128.0)));
        assert_eq!(usage.get("cpu_percent"), Some(&json!(55.5)));
    }

    #[test]
    fn test_set_max_iterations_rejects_zero() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");
        assert!(controller.set_max_iterations(0).is_err());
        // Nothing was persisted for the rejected registration.
        assert!(!controller.get_state().contains_key(keys::MAX_ITERATIONS));
    }

    #[test]
    fn test_set_timeout_rejects_invalid() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");
        assert!(controller.set_timeout(-1.0).is_err());
        assert!(controller.set_timeout(f64::NAN).is_err());
    }

    #[test]
    fn test_condition_replacement_keeps_slot() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller
            .add_custom_condition("alpha", |_| ConditionCheck::not_met())
            .expect("add");
        controller
            .add_custom_condition("beta", |_| ConditionCheck::not_met())
            .expect("add");
        controller
            .add_custom_condition("alpha", |_| ConditionCheck::met("replaced"))
            .expect("re-add");

        let conditions = unpoison(controller.inner.conditions.lock());
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].name(), "alpha");
        assert_eq!(conditions[1].name(), "beta");
        assert!(conditions[0].check(&StateMap::new()).met);
    }

    #[tokio::test]
    async fn test_runs_until_max_iterations() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller.set_max_iterations(3).expect("set max");
        controller
            .start(|state| Ok(json!(state::get_u64(state, keys::CURRENT_ITERATION))))
            .await
            .expect("start");

        wait_until_stopped(&controller).await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Completed));
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_REASON),
            Some("max_iterations")
        );
        assert_eq!(state::get_u64(&state, keys::CURRENT_ITERATION), 3);
        assert!(state::get_opt_f64(&state, keys::END_TIME).is_some());

        let history = controller.get_execution_history();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|r| r.success));
        assert_eq!(history[0].iteration, 0);
        assert_eq!(history[2].iteration, 2);
    }

    #[tokio::test]
    async fn test_error_threshold_terminates_failed() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller
            .start(|_state| Err(anyhow::anyhow!("deliberate failure")))
            .await
            .expect("start");

        wait_until_stopped(&controller).await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Failed));
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_REASON),
            Some("error")
        );
        assert_eq!(state::get_u64(&state, keys::ERROR_COUNT), 3);
        assert_eq!(
            state::get_str(&state, keys::LAST_ERROR),
            Some("deliberate failure")
        );
        // Iteration counter never moves on failed iterations.
        assert_eq!(state::get_u64(&state, keys::CURRENT_ITERATION), 0);

        let history = controller.get_execution_history();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|r| !r.success));
    }

    #[tokio::test]
    async fn test_panic_counts_as_failed_iteration() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller
            .start(|_state| -> anyhow::Result<Value> { panic!("boom") })
            .await
            .expect("start");

        wait_until_stopped(&controller).await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Failed));
        // The panic payload's message must survive into last_error.
        let last_error = state::get_str(&state, keys::LAST_ERROR).expect("last error");
        assert!(last_error.contains("iteration panicked"));
        assert!(last_error.contains("boom"));
    }

    #[tokio::test]
    async fn test_panicking_condition_terminates_failed() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller
            .add_custom_condition("bad_predicate", |_state| panic!("predicate blew up"))
            .expect("add condition");

        controller
            .start(|_state| Ok(json!("unreached")))
            .await
            .expect("start");

        wait_until_stopped(&controller).await;

        // The loop must not be stranded in running: the panic terminates it.
        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Failed));
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_REASON),
            Some("error")
        );
        let details = state::get_str(&state, keys::TERMINATION_DETAILS).expect("details");
        assert!(details.contains("condition check panicked"));
        assert!(details.contains("predicate blew up"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_restart_does_not_revive_cancelled_run() {
        let (_dir, persistence) = temp_setup();
        let controller = LoopController::new(
            "loop-1",
            Arc::clone(&persistence),
            ControllerConfig::new().with_stop_grace(Duration::from_millis(20)),
        )
        .expect("create controller");

        // First run blocks well past the stop grace, so stop() returns while
        // the task is still inside the iteration function.
        controller
            .start(|_state| {
                std::thread::sleep(Duration::from_millis(400));
                Ok(json!("first"))
            })
            .await
            .expect("first start");
        tokio::time::sleep(Duration::from_millis(15)).await;
        controller.stop("grace will expire").await;
        assert_eq!(
            state::loop_state_of(&controller.get_state()),
            Some(LoopState::Aborted)
        );

        // Restart immediately, while the first task is still blocked. The
        // second run must own the loop alone.
        controller.set_max_iterations(40).expect("set max");
        controller
            .start(|_state| {
                std::thread::sleep(Duration::from_millis(25));
                Ok(json!("second"))
            })
            .await
            .expect("second start");

        wait_until_stopped(&controller).await;
        // Give the stale task time to wake from its blocking sleep so any
        // misbehavior lands in the history before the assertions.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Completed));
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_REASON),
            Some("max_iterations")
        );

        // At most the single in-flight iteration of the stopped run may have
        // committed; the stale task must never iterate again after restart.
        let history = controller.get_execution_history();
        let stale = history
            .iter()
            .filter(|r| r.result.as_deref() == Some("first"))
            .count();
        assert!(stale <= 1, "stale run committed {stale} iterations");
    }

    #[tokio::test]
    async fn test_custom_condition_terminates_condition_met() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller
            .add_custom_condition("two_done", |state| {
                if state::get_u64(state, keys::CURRENT_ITERATION) >= 2 {
                    ConditionCheck::met("two iterations recorded")
                } else {
                    ConditionCheck::not_met()
                }
            })
            .expect("add condition");

        controller
            .start(|_state| Ok(json!("ok")))
            .await
            .expect("start");

        wait_until_stopped(&controller).await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Completed));
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_REASON),
            Some("condition_met")
        );
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_DETAILS),
            Some("two iterations recorded")
        );
        assert_eq!(state::get_u64(&state, keys::CURRENT_ITERATION), 2);
    }

    #[tokio::test]
    async fn test_first_registered_condition_wins() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller
            .add_custom_condition("first", |_| ConditionCheck::met("first wins"))
            .expect("add");
        controller
            .add_custom_condition("second", |_| ConditionCheck::met("second loses"))
            .expect("add");

        controller
            .start(|_state| Ok(json!("unreached")))
            .await
            .expect("start");

        wait_until_stopped(&controller).await;

        let state = controller.get_state();
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_DETAILS),
            Some("first wins")
        );
        // The loop terminated before the first iteration ran.
        assert!(controller.get_execution_history().is_empty());
    }

    #[tokio::test]
    async fn test_stop_records_manual_abort() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller
            .start(|_state| {
                std::thread::sleep(Duration::from_millis(5));
                Ok(json!("tick"))
            })
            .await
            .expect("start");

        tokio::time::sleep(Duration::from_millis(30)).await;
        controller.stop("manual").await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Aborted));
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_REASON),
            Some("manual")
        );
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_DETAILS),
            Some("manual")
        );
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_stop_after_completion_does_not_overwrite() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller.set_max_iterations(1).expect("set max");
        controller
            .start(|_state| Ok(json!("done")))
            .await
            .expect("start");
        wait_until_stopped(&controller).await;

        controller.stop("too late").await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Completed));
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_REASON),
            Some("max_iterations")
        );
    }

    #[tokio::test]
    async fn test_start_while_running_is_noop() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller.set_max_iterations(50).expect("set max");
        controller
            .start(|_state| {
                std::thread::sleep(Duration::from_millis(2));
                Ok(json!("tick"))
            })
            .await
            .expect("first start");

        // Second start while running: no error, no second task, and the
        // run proceeds to its normal termination.
        controller
            .start(|_state| Ok(json!("should never run")))
            .await
            .expect("second start");

        wait_until_stopped(&controller).await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Completed));
        assert_eq!(state::get_u64(&state, keys::CURRENT_ITERATION), 50);
        let history = controller.get_execution_history();
        assert!(history.iter().all(|r| r.result.as_deref() == Some("tick")));
    }

    #[tokio::test]
    async fn test_history_is_fifo_bounded() {
        let (_dir, persistence) = temp_setup();
        let controller = LoopController::new(
            "loop-1",
            Arc::clone(&persistence),
            ControllerConfig::new().with_history_limit(5),
        )
        .expect("create controller");

        controller.set_max_iterations(12).expect("set max");
        controller
            .start(|state| Ok(json!(state::get_u64(state, keys::CURRENT_ITERATION))))
            .await
            .expect("start");

        wait_until_stopped(&controller).await;

        let history = controller.get_execution_history();
        assert_eq!(history.len(), 5);
        // Oldest evicted first: the surviving records are the last five.
        assert_eq!(history[0].iteration, 7);
        assert_eq!(history[4].iteration, 11);
    }

    #[tokio::test]
    async fn test_result_strings_are_truncated() {
        let (_dir, persistence) = temp_setup();
        let controller = LoopController::new(
            "loop-1",
            Arc::clone(&persistence),
            ControllerConfig::new().with_result_max_bytes(8),
        )
        .expect("create controller");

        controller.set_max_iterations(1).expect("set max");
        controller
            .start(|_state| Ok(json!("a very long result string")))
            .await
            .expect("start");

        wait_until_stopped(&controller).await;

        let history = controller.get_execution_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result.as_deref(), Some("a very l"));
    }

    #[tokio::test]
    async fn test_errors_below_threshold_are_tolerated() {
        use std::sync::atomic::AtomicU32;

        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");
        controller.set_max_iterations(3).expect("set max");

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_fn = Arc::clone(&calls);
        controller
            .start(move |_state| {
                let n = calls_in_fn.fetch_add(1, Ordering::SeqCst);
                // Fail the second call only; two isolated failures stay
                // below the threshold of three.
                if n == 1 {
                    Err(anyhow::anyhow!("transient"))
                } else {
                    Ok(json!("ok"))
                }
            })
            .await
            .expect("start");

        wait_until_stopped(&controller).await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Completed));
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_REASON),
            Some("max_iterations")
        );
        assert_eq!(state::get_u64(&state, keys::ERROR_COUNT), 1);

        let history = controller.get_execution_history();
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().filter(|r| !r.success).count(), 1);
    }

    #[tokio::test]
    async fn test_restart_after_completion_clears_verdict() {
        let (_dir, persistence) = temp_setup();
        let controller = controller(&persistence, "loop-1");

        controller.set_max_iterations(2).expect("set max");
        controller
            .start(|_state| Ok(json!("first run")))
            .await
            .expect("start");
        wait_until_stopped(&controller).await;

        // Raise the cap, run again; the stale verdict keys are cleared.
        controller.set_max_iterations(4).expect("raise max");
        controller
            .start(|_state| Ok(json!("second run")))
            .await
            .expect("restart");
        wait_until_stopped(&controller).await;

        let state = controller.get_state();
        assert_eq!(state::loop_state_of(&state), Some(LoopState::Completed));
        assert_eq!(state::get_u64(&state, keys::CURRENT_ITERATION), 4);
        assert_eq!(
            state::get_str(&state, keys::TERMINATION_REASON),
            Some("max_iterations")
        );
    }

    #[test]
    fn test_bound_history() {
        let record = |i| ExecutionRecord {
            iteration: i,
            timestamp: 0.0,
            success: true,
            duration_ms: 0,
            result: None,
            error: None,
        };
        let mut history: Vec<_> = (0..7).map(record).collect();
        bound_history(&mut history, 5);
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].iteration, 2);
    }

    #[test]
    fn test_stringify_result_forms() {
        assert_eq!(stringify_result(&json!("plain"), 100), "plain");
        assert_eq!(stringify_result(&json!(42), 100), "42");
        assert_eq!(stringify_result(&json!({"k": 1}), 100), "{\"k\":1}");
        assert_eq!(stringify_result(&json!("truncate me"), 8), "truncate");
    }
}
