//! Termination conditions for controlled loops.
//!
//! A condition is a named, pure predicate over a state snapshot. Conditions
//! never mutate state; the controller evaluates them in registration order
//! at the top of every iteration and the first one that reports met wins.
//!
//! Parameter validation happens in the constructors, so a misconfigured
//! condition fails at registration time rather than mid-run.
//!
//! # Example
//!
//! ```
//! use cadence::conditions::{MaxIterationsCondition, TerminationCondition};
//! use cadence::state::{keys, StateMap};
//!
//! let cond = MaxIterationsCondition::new(3).unwrap();
//! let mut state = StateMap::new();
//! state.insert(keys::CURRENT_ITERATION.into(), 3u64.into());
//!
//! let check = cond.check(&state);
//! assert!(check.met);
//! ```

use std::sync::Arc;

use crate::error::{CadenceError, Result};
use crate::state::{self, keys, StateMap};

/// Result of evaluating one condition against a state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionCheck {
    /// Whether the condition is met.
    pub met: bool,
    /// Human-readable reason, recorded as termination details when met.
    pub reason: Option<String>,
}

impl ConditionCheck {
    /// A condition that is not met.
    #[must_use]
    pub fn not_met() -> Self {
        Self {
            met: false,
            reason: None,
        }
    }

    /// A met condition with a reason string.
    #[must_use]
    pub fn met(reason: impl Into<String>) -> Self {
        Self {
            met: true,
            reason: Some(reason.into()),
        }
    }
}

/// A named, pure predicate over loop state.
///
/// Implementations must not mutate state and must be cheap: they run under
/// no lock but on every iteration.
pub trait TerminationCondition: Send + Sync {
    /// Name this condition is registered under. Re-registering a name
    /// replaces the prior condition.
    fn name(&self) -> &str;

    /// Evaluate against a state snapshot.
    fn check(&self, state: &StateMap) -> ConditionCheck;
}

// ----------------------------------------------------------------------------
// Max iterations
// ----------------------------------------------------------------------------

/// Met once `current_iteration` reaches the configured cap.
#[derive(Debug, Clone)]
pub struct MaxIterationsCondition {
    max_iterations: u64,
}

impl MaxIterationsCondition {
    /// # Errors
    ///
    /// Returns an error if `max_iterations` is zero.
    pub fn new(max_iterations: u64) -> Result<Self> {
        if max_iterations == 0 {
            return Err(CadenceError::invalid_condition(
                "max_iterations",
                "must be greater than zero",
            ));
        }
        Ok(Self { max_iterations })
    }
}

impl TerminationCondition for MaxIterationsCondition {
    fn name(&self) -> &str {
        "max_iterations"
    }

    fn check(&self, state: &StateMap) -> ConditionCheck {
        let current = state::get_u64(state, keys::CURRENT_ITERATION);
        if current >= self.max_iterations {
            ConditionCheck::met(format!(
                "reached {current} of {} iterations",
                self.max_iterations
            ))
        } else {
            ConditionCheck::not_met()
        }
    }
}

// ----------------------------------------------------------------------------
// Timeout
// ----------------------------------------------------------------------------

/// Met once wall-clock time since `start_time` exceeds the configured span.
///
/// Not met while the loop has no recorded `start_time`.
#[derive(Debug, Clone)]
pub struct TimeoutCondition {
    timeout_seconds: f64,
}

impl TimeoutCondition {
    /// # Errors
    ///
    /// Returns an error if `timeout_seconds` is not a positive finite number.
    pub fn new(timeout_seconds: f64) -> Result<Self> {
        if !timeout_seconds.is_finite() || timeout_seconds <= 0.0 {
            return Err(CadenceError::invalid_condition(
                "timeout",
                "seconds must be a positive finite number",
            ));
        }
        Ok(Self { timeout_seconds })
    }
}

impl TerminationCondition for TimeoutCondition {
    fn name(&self) -> &str {
        "timeout"
    }

    fn check(&self, state: &StateMap) -> ConditionCheck {
        let Some(start) = state::get_opt_f64(state, keys::START_TIME) else {
            return ConditionCheck::not_met();
        };
        let elapsed = state::epoch_now() - start;
        if elapsed >= self.timeout_seconds {
            ConditionCheck::met(format!(
                "elapsed {elapsed:.1}s exceeds timeout {:.1}s",
                self.timeout_seconds
            ))
        } else {
            ConditionCheck::not_met()
        }
    }
}

// ----------------------------------------------------------------------------
// Resource limit
// ----------------------------------------------------------------------------

/// Met once the tracked usage of one resource reaches the configured limit.
///
/// Usage is push-based: the caller reports it via
/// `LoopController::update_resource_usage`, and a resource with no reported
/// usage never trips the limit.
#[derive(Debug, Clone)]
pub struct ResourceLimitCondition {
    name: String,
    resource: String,
    limit: f64,
}

impl ResourceLimitCondition {
    /// # Errors
    ///
    /// Returns an error if the resource name is empty or the limit is not
    /// a finite number.
    pub fn new(resource: impl Into<String>, limit: f64) -> Result<Self> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(CadenceError::invalid_condition(
                "resource_limit",
                "resource name must not be empty",
            ));
        }
        if !limit.is_finite() {
            return Err(CadenceError::invalid_condition(
                "resource_limit",
                "limit must be a finite number",
            ));
        }
        Ok(Self {
            name: format!("resource_limit:{resource}"),
            resource,
            limit,
        })
    }

    /// The resource this condition watches.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl TerminationCondition for ResourceLimitCondition {
    /// Per-resource name, so limits on different resources coexist while
    /// re-registering the same resource replaces its prior limit.
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, state: &StateMap) -> ConditionCheck {
        let usage = state
            .get(keys::RESOURCE_USAGE)
            .and_then(|v| v.get(&self.resource))
            .and_then(serde_json::Value::as_f64);

        match usage {
            Some(used) if used >= self.limit => ConditionCheck::met(format!(
                "resource '{}' usage {used} reached limit {}",
                self.resource, self.limit
            )),
            _ => ConditionCheck::not_met(),
        }
    }
}

// ----------------------------------------------------------------------------
// Custom predicate
// ----------------------------------------------------------------------------

/// Closure type wrapped by [`PredicateCondition`].
pub type Predicate = dyn Fn(&StateMap) -> ConditionCheck + Send + Sync;

/// Wraps an arbitrary caller-supplied predicate under a caller-chosen name.
pub struct PredicateCondition {
    name: String,
    predicate: Arc<Predicate>,
}

impl PredicateCondition {
    /// # Errors
    ///
    /// Returns an error if the name is empty.
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&StateMap) -> ConditionCheck + Send + Sync + 'static,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CadenceError::invalid_condition(
                "predicate",
                "name must not be empty",
            ));
        }
        Ok(Self {
            name,
            predicate: Arc::new(predicate),
        })
    }
}

impl std::fmt::Debug for PredicateCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateCondition")
            .field("name", &self.name)
            .field("predicate", &"<closure>")
            .finish()
    }
}

impl TerminationCondition for PredicateCondition {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, state: &StateMap) -> ConditionCheck {
        (self.predicate)(state)
    }
}
