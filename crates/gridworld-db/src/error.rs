//! Error types for the data layer.
//!
//! [`AdapterError`] covers the operational cache (either backend) and
//! [`DbError`] covers the durable `PostgreSQL` store. Entity, reconciliation,
//! delivery, and audit errors live next to the code that raises them.

/// Errors raised by the storage adapter.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// No backend can serve the call (connecting, or remote down with no
    /// fallback).
    #[error("storage adapter unavailable: {0}")]
    Unavailable(String),

    /// A `Dragonfly`/Redis operation failed.
    #[error("Dragonfly error: {0}")]
    Dragonfly(#[from] fred::error::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by the durable store.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A row carried an id the durable store should never produce.
    #[error("invalid row id {id} in {table}")]
    InvalidRowId {
        /// Table the row came from.
        table: &'static str,
        /// The offending id.
        id: i64,
    },

    /// A column held a value outside the range the entity accepts.
    #[error("invalid {column} in {table} row {id}")]
    InvalidColumn {
        /// Table the row came from.
        table: &'static str,
        /// Offending column.
        column: &'static str,
        /// Row id.
        id: i64,
    },

    /// A write was attempted with a provisional id where a durable one is
    /// required.
    #[error("provisional id {0} cannot be written to the durable store")]
    UnexpectedProvisional(gridworld_types::EntityId),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
