use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use renter_fs::{FsPath, HostKey};

/// How useful a host's contract currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractUtility {
    pub good_for_upload: bool,
    pub good_for_renew: bool,
}

/// The slice of a host contract the metadata core cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostContract {
    pub host: HostKey,
    pub end_height: u64,
}

/// The host liveness view a bubble walk works against. Taken once at the
/// start of a walk and treated as immutable for its duration.
#[derive(Debug, Clone, Default)]
pub struct UtilityMaps {
    pub offline: HashMap<HostKey, bool>,
    pub good_for_renew: HashMap<HostKey, bool>,
    pub contracts: Vec<HostContract>,
    pub utilities: HashMap<HostKey, ContractUtility>,
}

impl UtilityMaps {
    /// Contract end heights by host, for expiration estimates.
    pub fn contract_ends(&self) -> HashMap<HostKey, u64> {
        self.contracts
            .iter()
            .map(|c| (c.host.clone(), c.end_height))
            .collect()
    }
}

/// The contract manager the core consumes. Refreshed snapshots, cheap to
/// call.
#[async_trait]
pub trait HostContractor: Send + Sync {
    async fn contract_and_utility_maps(&self) -> UtilityMaps;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerTaskKind {
    Upload,
    Download,
    HealthCheck,
}

/// A unit of work handed to the external worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTask {
    pub kind: WorkerTaskKind,
    pub fs_path: FsPath,
}

/// Status summary of one remote-host worker, surfaced through the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub host: HostKey,
    pub upload_queue_size: usize,
    pub download_queue_size: usize,
    pub on_cooldown: bool,
    #[serde(default)]
    pub cooldown_error: String,
}

/// The worker pool executing host RPCs; opaque to the metadata core.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn launch(&self, task: WorkerTask) -> Result<(), String>;
    async fn status(&self) -> Vec<WorkerStatus>;
}
