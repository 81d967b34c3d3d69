//! Error taxonomy for allocation operations.

use chrono::NaiveDate;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{AllocationId, FacultyId, Slot};

pub type Result<T, E = Error> = std::result::Result<T, E>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("malformed stored row: {0}")]
    Malformed(String),

    /// The allocations of a date changed between snapshot and commit.
    #[error("allocations for {date} changed during the operation")]
    Stale { date: NaiveDate },

    /// A faculty member's counters changed after reconciliation read them.
    #[error("load counters of faculty {faculty_id} changed during the operation")]
    CountersMoved { faculty_id: FacultyId },

    /// Detected inside the commit transaction of a reassignment.
    #[error("faculty {faculty_id} already holds allocation {existing} in this slot")]
    SlotTaken {
        faculty_id: FacultyId,
        existing: AllocationId,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("faculty {faculty_id} already assigned on {date} ({slot}) via allocation {existing}")]
    Conflict {
        faculty_id: FacultyId,
        date: NaiveDate,
        slot: Slot,
        existing: AllocationId,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl Error {
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_failed",
            Error::NotFound { .. } => "not_found",
            Error::Conflict { .. } => "slot_conflict",
            Error::Storage(StoreError::Stale { .. } | StoreError::CountersMoved { .. }) => {
                "stale_snapshot"
            }
            Error::Storage(_) => "storage_failed",
        }
    }

    /// Only conflicts are worth retrying, and only with a different target.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}
