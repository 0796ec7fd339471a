mod alerts;
mod bubble;
mod contractor;
mod mgr;
mod task_group;


pub use alerts::{file_low_redundancy_alert_id, Alert, AlertRegistry, AlertSeverity};
pub use bubble::BubbleMgr;
pub use contractor::{
    ContractUtility, HostContract, HostContractor, UtilityMaps, WorkerPool, WorkerStatus,
    WorkerTask, WorkerTaskKind,
};
pub use mgr::{RenterMgr, WAL_FILE_NAME};
pub use task_group::TaskGroup;

use log::warn;
use renter_fs::FsError;
use thiserror::Error;

/// Number of tasks concurrently computing per-child metadata during a
/// bubble walk.
pub const NUM_BUBBLE_WORKERS: usize = 20;

/// Aggregate health at the root at or above which the repair loop is
/// signalled.
pub const REPAIR_THRESHOLD: f64 = 0.25;

/// A file whose worst health reaches this threshold (75% of its
/// redundancy missing) gets a low-redundancy alert.
pub const ALERT_LOW_REDUNDANCY_THRESHOLD: f64 = 0.75;

/// The error surface exposed to external API consumers. Everything that
/// is not the caller's fault collapses to `Internal` and is logged at the
/// boundary.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotExist(String),
    #[error("already exists: {0}")]
    Exists(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("internal error")]
    Internal,
}

impl From<FsError> for ApiError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotExist(s) => ApiError::NotExist(s),
            FsError::Exists(s) => ApiError::Exists(s),
            FsError::Invalid(s) => ApiError::Invalid(s),
            other => {
                warn!("internal error crossing the api boundary: {}", other);
                ApiError::Internal
            }
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
