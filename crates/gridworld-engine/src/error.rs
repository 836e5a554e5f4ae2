//! Error types for the engine binary.
//!
//! [`EngineError`] wraps every failure that can end startup or the
//! calendar run, so `main` can propagate with `?`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: gridworld_core::config::ConfigError,
    },

    /// The durable store could not be reached.
    #[error("durable store error: {source}")]
    Durable {
        /// The underlying database error.
        #[from]
        source: gridworld_db::DbError,
    },

    /// The cache could not be brought up.
    #[error("cache error: {source}")]
    Adapter {
        /// The underlying adapter error.
        #[from]
        source: gridworld_db::AdapterError,
    },

    /// Startup load or seeding failed.
    #[error("reconcile error: {source}")]
    Reconcile {
        /// The underlying reconciliation error.
        #[from]
        source: gridworld_db::ReconcileError,
    },

    /// The startup integrity audit failed.
    #[error("audit error: {source}")]
    Audit {
        /// The underlying audit error.
        #[from]
        source: gridworld_db::AuditError,
    },

    /// The calendar loop failed.
    #[error("runner error: {source}")]
    Runner {
        /// The underlying runner error.
        #[from]
        source: gridworld_core::runner::RunnerError,
    },

    /// Logging could not be initialized.
    #[error("logging error: {message}")]
    Logging {
        /// Description of the failure.
        message: String,
    },
}
