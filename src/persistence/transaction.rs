//! Transaction records for loop state changes.
//!
//! A [`StateTransaction`] is a set of key→value changes proposed against one
//! loop's state. Committed transactions are persisted one file per id and
//! form the durable audit trail: replaying them in creation order from an
//! empty map reconstructs the current state (see
//! [`StatePersistenceManager::recover_state`](super::StatePersistenceManager::recover_state)).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::StateMap;

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Open; changes are being collected.
    Pending,
    /// Applied to the persisted state as one atomic unit.
    Committed,
    /// Undone after being applied.
    RolledBack,
    /// Never applied; the scope or the commit itself errored.
    Failed,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled_back",
            TransactionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An atomic, all-or-nothing set of key changes against one loop's state.
///
/// A `null` change value deletes the key. `previous_values` captures each
/// changed key's prior value at commit time (`null` for keys that did not
/// exist), kept for audit and potential rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransaction {
    /// Generated transaction id, used as the record's file name.
    pub id: String,
    /// The loop this transaction targets.
    pub loop_id: String,
    /// Proposed key changes; `null` means delete.
    pub changes: StateMap,
    /// Prior values of changed keys, captured at commit.
    pub previous_values: StateMap,
    /// Current status.
    pub status: TransactionStatus,
    /// When the transaction was opened.
    pub created_at: DateTime<Utc>,
    /// When the transaction was committed, if it was.
    pub committed_at: Option<DateTime<Utc>>,
    /// When the transaction was rolled back, if it was.
    pub rolled_back_at: Option<DateTime<Utc>>,
    /// Free-form caller metadata.
    pub metadata: StateMap,
}

impl StateTransaction {
    /// Open a fresh pending transaction for a loop.
    #[must_use]
    pub fn new(loop_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            loop_id: loop_id.into(),
            changes: StateMap::new(),
            previous_values: StateMap::new(),
            status: TransactionStatus::Pending,
            created_at: Utc::now(),
            committed_at: None,
            rolled_back_at: None,
            metadata: StateMap::new(),
        }
    }

    /// Propose setting a key to a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.changes.insert(key.into(), value.into());
        self
    }

    /// Propose deleting a key.
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.changes.insert(key.into(), Value::Null);
        self
    }

    /// Attach a metadata entry.
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Record the prior value of a changed key (`None` becomes `null`).
    pub fn record_previous(&mut self, key: &str, previous: Option<&Value>) {
        self.previous_values
            .insert(key.to_string(), previous.cloned().unwrap_or(Value::Null));
    }

    /// Mark as committed, stamping `committed_at`.
    pub fn mark_committed(&mut self) {
        self.status = TransactionStatus::Committed;
        self.committed_at = Some(Utc::now());
    }

    /// Mark as failed. Failed transactions are persisted for audit but
    /// never replayed.
    pub fn mark_failed(&mut self) {
        self.status = TransactionStatus::Failed;
    }

    /// Mark as rolled back, stamping `rolled_back_at`.
    pub fn mark_rolled_back(&mut self) {
        self.status = TransactionStatus::RolledBack;
        self.rolled_back_at = Some(Utc::now());
    }

    /// Whether this transaction was committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.status == TransactionStatus::Committed
    }

    /// Whether this transaction has any proposed changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Apply a change set to a state map in place: `null` deletes, anything
/// else inserts. Callers must treat the whole set as one unit.
pub(crate) fn apply_changes(state: &mut StateMap, changes: &StateMap) {
    for (key, value) in changes {
        if value.is_null() {
            state.remove(key);
        } else {
            state.insert(key.clone(), value.clone());
        }
    }
}
