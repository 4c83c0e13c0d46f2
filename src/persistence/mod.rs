//! Crash-consistent, transactional state storage.
//!
//! Each loop gets a directory under the storage root holding a current
//! snapshot (`state.json`, replaced atomically), an advisory lock file,
//! and one JSON record per transaction under `transactions/`. The
//! transaction log is the source of truth: replaying the committed records
//! in creation order from an empty map must reproduce the snapshot, and
//! [`StatePersistenceManager::recover_state`] does exactly that when the
//! snapshot is suspect or lost.
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence::persistence::{PersistenceConfig, StatePersistenceManager};
//!
//! let manager = StatePersistenceManager::new(PersistenceConfig::new(".cadence"))?;
//!
//! let txn = manager.with_transaction("loop-1", |_state, txn| {
//!     txn.set("current_iteration", 1);
//!     Ok(())
//! })?;
//! assert!(txn.is_committed());
//! ```

pub mod transaction;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{Duration, Utc};
use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::{CadenceError, Result};
use crate::state::StateMap;
pub use transaction::{StateTransaction, TransactionStatus};

/// Snapshot file name within a loop's directory.
const STATE_FILE: &str = "state.json";

/// Temporary file suffix for atomic snapshot replacement.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file name for cross-process exclusion.
const LOCK_FILE: &str = "state.lock";

/// Directory holding one record file per transaction.
const TRANSACTIONS_DIR: &str = "transactions";

/// Configuration for the persistence layer.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Root directory under which each loop gets its own subdirectory.
    pub storage_root: PathBuf,
    /// Pretty-print persisted JSON. Costs bytes, helps inspection.
    pub pretty_json: bool,
}

impl PersistenceConfig {
    /// Create a configuration rooted at the given directory.
    #[must_use]
    pub fn new(storage_root: impl AsRef<Path>) -> Self {
        Self {
            storage_root: storage_root.as_ref().to_path_buf(),
            pretty_json: true,
        }
    }

    /// Enable or disable pretty-printed JSON.
    #[must_use]
    pub fn with_pretty_json(mut self, pretty: bool) -> Self {
        self.pretty_json = pretty;
        self
    }
}

/// Transactional key-value state storage, one namespace per `loop_id`.
///
/// All mutation of a loop's state flows through the loop's mutex: a
/// transaction holds it for its full load-apply-save span, so a reader
/// never observes a partially applied change set. Snapshots are replaced
/// via temp-write-then-rename, so a reader never observes a torn file
/// either.
pub struct StatePersistenceManager {
    config: PersistenceConfig,
    /// In-memory cache of the latest saved state per loop.
    cache: Mutex<HashMap<String, StateMap>>,
    /// Per-loop mutexes, created lazily and reused for the id's lifetime.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for StatePersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePersistenceManager")
            .field("storage_root", &self.config.storage_root)
            .finish_non_exhaustive()
    }
}

fn unpoison<'a, T>(
    result: std::result::Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    // A poisoned lock here means a panic mid-IO; the on-disk state is still
    // consistent thanks to atomic replace, so continue with the data we have.
    result.unwrap_or_else(PoisonError::into_inner)
}

impl StatePersistenceManager {
    /// Create a manager, creating the storage root if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be created.
    pub fn new(config: PersistenceConfig) -> Result<Self> {
        if !config.storage_root.exists() {
            fs::create_dir_all(&config.storage_root).map_err(|e| {
                warn!(
                    "Failed to create storage root {}: {e}",
                    config.storage_root.display()
                );
                CadenceError::Storage {
                    path: config.storage_root.clone(),
                }
            })?;
            debug!("Created storage root: {}", config.storage_root.display());
        }

        Ok(Self {
            config,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// The storage root this manager writes under.
    #[must_use]
    pub fn storage_root(&self) -> &Path {
        &self.config.storage_root
    }

    // ------------------------------------------------------------------------
    // State snapshots
    // ------------------------------------------------------------------------

    /// Load a loop's current state.
    ///
    /// Returns the cached state if present, else deserializes the snapshot
    /// from disk, else an empty map. Never errors on missing state: a fresh
    /// loop simply has none yet. A corrupt snapshot is logged and treated
    /// as absent (recoverable via [`Self::recover_state`]).
    #[must_use]
    pub fn load_state(&self, loop_id: &str) -> StateMap {
        let lock = self.lock_for(loop_id);
        let _guard = unpoison(lock.lock());
        self.load_state_unlocked(loop_id)
    }

    /// Save a loop's current state with atomic replace.
    ///
    /// Returns `true` on success. Failures are logged, not raised; the
    /// transaction path uses the erroring variant internally so commits
    /// never silently half-apply.
    pub fn save_state(&self, loop_id: &str, state: &StateMap) -> bool {
        let lock = self.lock_for(loop_id);
        let _guard = unpoison(lock.lock());
        match self.try_save_state_unlocked(loop_id, state) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to save state for loop '{loop_id}': {e}");
                false
            }
        }
    }

    /// Drop a loop's cached state so the next load re-reads the snapshot.
    pub fn evict_cached(&self, loop_id: &str) {
        unpoison(self.cache.lock()).remove(loop_id);
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Run a closure inside a transaction scope for one loop.
    ///
    /// The per-loop lock is held for the whole span. The closure receives
    /// the current state (read-only) and a fresh pending transaction to
    /// fill with changes. On `Ok`, the commit records each changed key's
    /// prior value, applies all changes as one unit (`null` deletes),
    /// saves the merged snapshot, marks the transaction committed, and
    /// persists its record. On `Err` from the closure or from the commit
    /// itself, the transaction is marked failed, its record is persisted
    /// for audit, the snapshot is left untouched, and the error propagates.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a transaction error if the commit
    /// could not be made durable.
    pub fn with_transaction<F>(&self, loop_id: &str, scope: F) -> Result<StateTransaction>
    where
        F: FnOnce(&StateMap, &mut StateTransaction) -> Result<()>,
    {
        let lock = self.lock_for(loop_id);
        let _guard = unpoison(lock.lock());

        let state = self.load_state_unlocked(loop_id);
        let mut txn = StateTransaction::new(loop_id);

        if let Err(e) = scope(&state, &mut txn) {
            txn.mark_failed();
            self.persist_record_best_effort(&txn);
            return Err(e);
        }

        for key in txn.changes.keys().cloned().collect::<Vec<_>>() {
            let previous = state.get(&key).cloned();
            txn.record_previous(&key, previous.as_ref());
        }

        let mut merged = state;
        transaction::apply_changes(&mut merged, &txn.changes);

        if let Err(e) = self.try_save_state_unlocked(loop_id, &merged) {
            txn.mark_failed();
            self.persist_record_best_effort(&txn);
            return Err(CadenceError::transaction(
                loop_id,
                txn.id.clone(),
                format!("commit failed: {e}"),
            ));
        }

        txn.mark_committed();
        if let Err(e) = self.try_save_transaction(&txn) {
            // The snapshot is already durable; surface the gap in the audit
            // log instead of pretending the commit failed.
            warn!(
                "Committed transaction {} for loop '{loop_id}' but failed to persist its record: {e}",
                txn.id
            );
        }

        debug!(
            "Committed transaction {} for loop '{loop_id}' ({} changes)",
            txn.id,
            txn.changes.len()
        );
        Ok(txn)
    }

    /// Persist a transaction's full record as its own file.
    ///
    /// This is the durable audit trail, independent of the latest-state
    /// snapshot. Returns `true` on success; failures are logged.
    pub fn save_transaction(&self, txn: &StateTransaction) -> bool {
        match self.try_save_transaction(txn) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Failed to save transaction {} for loop '{}': {e}",
                    txn.id, txn.loop_id
                );
                false
            }
        }
    }

    /// All transaction records for a loop, sorted by creation timestamp.
    ///
    /// Unreadable or corrupt record files are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the transactions directory exists but
    /// cannot be enumerated.
    pub fn get_transaction_history(&self, loop_id: &str) -> Result<Vec<StateTransaction>> {
        let dir = self.transactions_dir(loop_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                match Self::load_record(&path) {
                    Ok(txn) => records.push(txn),
                    Err(e) => warn!("Skipping unreadable transaction {}: {e}", path.display()),
                }
            }
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    /// Rebuild a loop's state by replaying only committed transactions in
    /// timestamp order, then persist the result as the new snapshot.
    ///
    /// This is the designed failure-recovery path when the snapshot is
    /// suspect or lost; it reconstructs the same logical state the
    /// incremental saves produced.
    ///
    /// # Errors
    ///
    /// Returns an error if the history cannot be read or the rebuilt
    /// snapshot cannot be saved.
    pub fn recover_state(&self, loop_id: &str) -> Result<StateMap> {
        let lock = self.lock_for(loop_id);
        let _guard = unpoison(lock.lock());

        let history = self.get_transaction_history(loop_id)?;
        let committed = history.iter().filter(|t| t.is_committed()).count();

        let mut state = StateMap::new();
        for txn in history.iter().filter(|t| t.is_committed()) {
            transaction::apply_changes(&mut state, &txn.changes);
        }

        self.try_save_state_unlocked(loop_id, &state)
            .map_err(|e| CadenceError::persistence(loop_id, format!("recovery save failed: {e}")))?;

        debug!("Recovered state for loop '{loop_id}' from {committed} committed transactions");
        Ok(state)
    }

    /// Delete transaction records older than the retention window.
    ///
    /// Does not affect the current snapshot. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the transactions directory cannot be enumerated.
    pub fn cleanup_old_transactions(&self, loop_id: &str, retention_days: u32) -> Result<usize> {
        let dir = self.transactions_dir(loop_id);
        if !dir.exists() {
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let mut deleted = 0;

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match Self::load_record(&path) {
                Ok(txn) if txn.created_at < cutoff => {
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("Failed to delete old transaction {}: {e}", path.display());
                    } else {
                        deleted += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable transaction {}: {e}", path.display()),
            }
        }

        if deleted > 0 {
            debug!("Deleted {deleted} transactions older than {retention_days} days for loop '{loop_id}'");
        }
        Ok(deleted)
    }

    // ------------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------------

    fn loop_dir(&self, loop_id: &str) -> PathBuf {
        self.config.storage_root.join(loop_id)
    }

    fn state_path(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join(STATE_FILE)
    }

    fn lock_path(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join(LOCK_FILE)
    }

    fn transactions_dir(&self, loop_id: &str) -> PathBuf {
        self.loop_dir(loop_id).join(TRANSACTIONS_DIR)
    }

    /// The mutex guarding one loop's state, created lazily.
    fn lock_for(&self, loop_id: &str) -> Arc<Mutex<()>> {
        let mut locks = unpoison(self.locks.lock());
        locks
            .entry(loop_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn load_state_unlocked(&self, loop_id: &str) -> StateMap {
        if let Some(cached) = unpoison(self.cache.lock()).get(loop_id) {
            return cached.clone();
        }

        let path = self.state_path(loop_id);
        if !path.exists() {
            return StateMap::new();
        }

        let state = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<StateMap>(&contents) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        "Corrupt state snapshot at {}: {e}. Treating as empty; run recovery to rebuild.",
                        path.display()
                    );
                    return StateMap::new();
                }
            },
            Err(e) => {
                warn!("Failed to read state snapshot {}: {e}", path.display());
                return StateMap::new();
            }
        };

        unpoison(self.cache.lock()).insert(loop_id.to_string(), state.clone());
        state
    }

    /// Durable atomic snapshot replace: write temp, fsync, rename.
    fn try_save_state_unlocked(&self, loop_id: &str, state: &StateMap) -> Result<()> {
        let dir = self.loop_dir(loop_id);
        fs::create_dir_all(&dir)?;

        let lock_file = File::create(self.lock_path(loop_id))?;
        FileExt::lock_exclusive(&lock_file).map_err(|e| {
            CadenceError::persistence(loop_id, format!("failed to acquire file lock: {e}"))
        })?;

        let json = self.to_json(state)?;
        let final_path = self.state_path(loop_id);
        let tmp_path = dir.join(format!("{STATE_FILE}{TMP_SUFFIX}"));

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;

        unpoison(self.cache.lock()).insert(loop_id.to_string(), state.clone());
        Ok(())
    }

    fn try_save_transaction(&self, txn: &StateTransaction) -> Result<()> {
        let dir = self.transactions_dir(&txn.loop_id);
        fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.json", txn.id));
        let json = if self.config.pretty_json {
            serde_json::to_string_pretty(txn)?
        } else {
            serde_json::to_string(txn)?
        };
        fs::write(&path, json)?;
        Ok(())
    }

    fn persist_record_best_effort(&self, txn: &StateTransaction) {
        if let Err(e) = self.try_save_transaction(txn) {
            warn!(
                "Failed to persist {} transaction record {}: {e}",
                txn.status, txn.id
            );
        }
    }

    fn load_record(path: &Path) -> Result<StateTransaction> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn to_json(&self, state: &StateMap) -> Result<String> {
        Ok(if self.config.pretty_json {
            serde_json::to_string_pretty(state)?
        } else {
            serde_json::to_string(state)?
        })
    }
}
