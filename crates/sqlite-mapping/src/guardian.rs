// crates/sqlite-mapping/src/guardian.rs
// ============================================================================
// Module: Connection Guardian
// Description: Single-owner SQLite connection served by a dedicated thread.
// Purpose: Serialize every unit of work against the one shared connection.
// Dependencies: rusqlite, tracing
// ============================================================================

//! ## Overview
//! [`ConnectionGuardian`] owns the only handle to the database. The handle
//! lives on a dedicated worker thread; callers submit units of work through a
//! bounded FIFO queue and block until their unit has run. Each unit runs
//! inside its own transaction, which commits when the unit returns `Ok` and
//! rolls back when it returns `Err` or panics.
//!
//! Units are served strictly in arrival order. There is no timeout or
//! cancellation; a unit that hangs blocks every later submitter.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::panic;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::thread::JoinHandle;
use std::thread::ThreadId;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use tracing::debug;
use tracing::warn;

use crate::config::MappingStoreConfig;
use crate::error::StoreError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
const MAX_TOTAL_PATH_LENGTH: usize = 4096;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Type-erased unit of work executed on the worker thread.
type QueuedUnit = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// Counters describing units served by a guardian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardianStats {
    /// Units that reached the worker.
    pub units_executed: u64,
    /// Units whose transaction committed.
    pub units_committed: u64,
    /// Units whose transaction rolled back.
    pub units_rolled_back: u64,
}

/// Exclusive owner of the `SQLite` connection.
///
/// # Invariants
/// - The connection is only touched on the worker thread.
/// - At most one unit of work runs at a time.
/// - Once closed, the guardian never reopens.
pub struct ConnectionGuardian {
    /// Queue sender; `None` once the guardian is closed.
    sender: Mutex<Option<SyncSender<QueuedUnit>>>,
    /// Worker join handle; taken by `close`.
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Identifier of the worker thread, used to reject re-entrant submits.
    worker_id: ThreadId,
    /// Unit counters updated by the worker.
    stats: Arc<Mutex<GuardianStats>>,
}

impl ConnectionGuardian {
    /// Opens the database described by `config` and starts the worker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::StorageUnavailable`] when the path is unusable,
    /// the file cannot be opened, or it is not a `SQLite` database, and
    /// [`StoreError::InvalidConfig`] when the config fails validation.
    pub fn open(config: &MappingStoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let connection = open_connection(config)?;
        let (sender, receiver) = mpsc::sync_channel(config.queue_capacity);
        let stats = Arc::new(Mutex::new(GuardianStats::default()));
        let worker = thread::Builder::new()
            .name("sqlite-mapping-guardian".to_string())
            .spawn(move || guardian_loop(connection, &receiver))
            .map_err(|err| {
                StoreError::StorageUnavailable(format!("failed to spawn guardian thread: {err}"))
            })?;
        debug!(path = %config.path.display(), "sqlite mapping store opened");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker_id: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
            stats,
        })
    }

    /// Runs `work` with exclusive access to the connection.
    ///
    /// The unit runs inside a transaction that commits on `Ok` and rolls back
    /// on `Err` or panic. The calling thread blocks until the unit finishes.
    ///
    /// # Errors
    ///
    /// Returns the unit's own error, [`StoreError::Engine`] when the
    /// transaction cannot begin or commit, [`StoreError::Closed`] after
    /// [`ConnectionGuardian::close`], and [`StoreError::Reentrant`] when
    /// called from inside another unit of work.
    pub fn run<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        if thread::current().id() == self.worker_id {
            return Err(StoreError::Reentrant);
        }
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| StoreError::Closed("connection guardian is closed".to_string()))?;
        let (response_tx, response_rx) = mpsc::sync_channel(1);
        let stats = Arc::clone(&self.stats);
        let unit: QueuedUnit = Box::new(move |connection: &mut Connection| {
            let outcome = execute_unit(connection, &stats, work);
            deliver(&response_tx, outcome);
        });
        sender
            .send(unit)
            .map_err(|_| StoreError::Closed("connection guardian worker stopped".to_string()))?;
        drop(sender);
        response_rx.recv().map_err(|_| {
            StoreError::Closed("connection guardian response channel closed".to_string())
        })?
    }

    /// Stops accepting work, drains queued units, and closes the connection.
    ///
    /// Closing is idempotent. Returns once the database file is released.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Reentrant`] when called from inside a unit of
    /// work, and [`StoreError::Engine`] when the worker thread panicked.
    pub fn close(&self) -> Result<(), StoreError> {
        if thread::current().id() == self.worker_id {
            return Err(StoreError::Reentrant);
        }
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            worker.join().map_err(|_| {
                StoreError::Engine("connection guardian worker panicked".to_string())
            })?;
        }
        Ok(())
    }

    /// Returns true once [`ConnectionGuardian::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Returns a snapshot of the unit counters.
    #[must_use]
    pub fn stats(&self) -> GuardianStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionGuardian {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "connection guardian did not shut down cleanly");
        }
    }
}

// ============================================================================
// SECTION: Worker
// ============================================================================

/// Serves queued units until every sender is gone, then closes the connection.
fn guardian_loop(mut connection: Connection, receiver: &Receiver<QueuedUnit>) {
    while let Ok(unit) = receiver.recv() {
        unit(&mut connection);
    }
    if let Err((_, err)) = connection.close() {
        warn!(error = %err, "sqlite connection close failed");
    } else {
        debug!("sqlite mapping store closed");
    }
}

/// Hands a unit's outcome back to its caller; returns false when the caller is gone.
fn deliver<T>(
    response_tx: &SyncSender<Result<T, StoreError>>,
    outcome: Result<T, StoreError>,
) -> bool {
    if response_tx.send(outcome).is_err() {
        debug!("unit of work finished after its caller stopped waiting");
        return false;
    }
    true
}

/// Runs one unit inside a transaction and records its outcome.
fn execute_unit<T, F>(
    connection: &mut Connection,
    stats: &Mutex<GuardianStats>,
    work: F,
) -> Result<T, StoreError>
where
    F: FnOnce(&Connection) -> Result<T, StoreError>,
{
    let outcome = run_in_transaction(connection, work);
    let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
    stats.units_executed = stats.units_executed.saturating_add(1);
    if outcome.is_ok() {
        stats.units_committed = stats.units_committed.saturating_add(1);
    } else {
        stats.units_rolled_back = stats.units_rolled_back.saturating_add(1);
    }
    drop(stats);
    outcome
}

/// Commits the unit's writes on success and rolls them back otherwise.
fn run_in_transaction<T, F>(connection: &mut Connection, work: F) -> Result<T, StoreError>
where
    F: FnOnce(&Connection) -> Result<T, StoreError>,
{
    let tx = connection.transaction()?;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&*tx)))
        .unwrap_or_else(|_| Err(StoreError::Engine("unit of work panicked".to_string())));
    match outcome {
        Ok(value) => {
            tx.commit()?;
            Ok(value)
        }
        Err(error) => {
            debug!(error = %error, "unit of work rolled back");
            if let Err(rollback) = tx.rollback() {
                warn!(error = %rollback, "sqlite rollback failed");
            }
            Err(error)
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Opens the configured database and verifies it is readable.
fn open_connection(config: &MappingStoreConfig) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection = if config.is_in_memory() {
        Connection::open_in_memory_with_flags(flags)
    } else {
        validate_store_path(&config.path)?;
        ensure_parent_dir(&config.path)?;
        Connection::open_with_flags(&config.path, flags)
    }
    .map_err(|err| StoreError::StorageUnavailable(err.to_string()))?;
    apply_pragmas(&connection, config)
        .map_err(|err| StoreError::StorageUnavailable(err.to_string()))?;
    connection
        .query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .map_err(|err| StoreError::StorageUnavailable(err.to_string()))?;
    Ok(connection)
}

/// Applies `SQLite` pragmas required for durability.
fn apply_pragmas(connection: &Connection, config: &MappingStoreConfig) -> rusqlite::Result<()> {
    connection
        .execute_batch(&format!("PRAGMA journal_mode = {};", config.journal_mode.pragma_value()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", config.sync_mode.pragma_value()))?;
    connection.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
}

/// Validates store paths for safety limits.
fn validate_store_path(path: &Path) -> Result<(), StoreError> {
    if path.as_os_str().is_empty() {
        return Err(StoreError::StorageUnavailable("store path must not be empty".to_string()));
    }
    if path.as_os_str().len() > MAX_TOTAL_PATH_LENGTH {
        return Err(StoreError::StorageUnavailable("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        if component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(StoreError::StorageUnavailable(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.is_dir() {
        return Err(StoreError::StorageUnavailable(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Ensures the parent directory for the store exists.
fn ensure_parent_dir(path: &Path) -> Result<(), StoreError> {
    let Some(parent) = path.parent() else {
        return Err(StoreError::StorageUnavailable(
            "store path missing parent directory".to_string(),
        ));
    };
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o750);
    }
    builder.create(parent).map_err(|err| StoreError::StorageUnavailable(err.to_string()))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
