use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::types::{AggregatedState, PartitionId, TaskDetails};

// ── Per-request context ──────────────────────────────────────────────────────

/// Context shared by all request verbs. The timer starts when the request
/// enters the controller and stamps `exec_time_ms` on the result.
#[derive(Debug, Clone)]
pub struct CommonParams {
    pub partition_id: PartitionId,
    pub run_nr: u64,
    /// Per-request timeout override; falls back to the controller default.
    pub timeout: Option<Duration>,
    started: Instant,
}

impl CommonParams {
    pub fn new(partition_id: impl Into<String>, run_nr: u64) -> Self {
        CommonParams {
            partition_id: PartitionId::new(partition_id),
            run_nr,
            timeout: None,
            started: Instant::now(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Milliseconds since the request entered the controller.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

// ── Verb parameters ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct InitializeParams {
    /// Empty: create a fresh DDS session. Non-empty: attach to this one.
    pub session_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitParams {
    pub plugin: String,
    pub resources: String,
}

/// Exactly one of the three topology sources must be set.
#[derive(Debug, Clone, Default)]
pub struct ActivateParams {
    pub topo_file: String,
    pub topo_content: String,
    pub topo_script: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunParams {
    pub plugin: String,
    pub resources: String,
    pub topo_file: String,
    pub topo_content: String,
    pub topo_script: String,
}

pub type UpdateParams = ActivateParams;

#[derive(Debug, Clone, Default)]
pub struct DeviceParams {
    pub path: String,
    pub detailed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SetPropertiesParams {
    pub path: String,
    pub properties: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct StatusParams {
    /// When set, exclude partitions whose DDS session is not running.
    pub running_only: bool,
    started: Instant,
}

impl StatusParams {
    pub fn new(running_only: bool) -> Self {
        StatusParams { running_only, started: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

// ── Error accumulator ────────────────────────────────────────────────────────

/// Error slot threaded through a verb's helpers. Helpers short-circuit when a
/// code is already recorded; the verb reports `error` iff a code is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestError {
    pub code: Option<ErrorCode>,
    pub details: String,
}

impl RequestError {
    pub fn is_set(&self) -> bool {
        self.code.is_some()
    }

    pub fn set(&mut self, code: ErrorCode, details: impl Into<String>) {
        self.code = Some(code);
        self.details = details.into();
    }

    pub fn clear(&mut self) {
        self.code = None;
        self.details.clear();
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {}", code, self.details),
            None => write!(f, "no error"),
        }
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DdsSessionStatus {
    Running,
    Stopped,
}

/// Per-task entry of a detailed state report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedTaskStatus {
    pub state: crate::types::DeviceState,
    pub task: TaskDetails,
}

pub type DetailedState = Vec<DetailedTaskStatus>;

/// Uniform reply of every verb except Status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub status: RequestStatus,
    pub msg: String,
    pub exec_time_ms: u64,
    pub error: RequestError,
    pub partition_id: PartitionId,
    pub run_nr: u64,
    /// Nil uuid when the partition holds no DDS session.
    pub session_id: String,
    pub aggregated_state: AggregatedState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed_state: Option<DetailedState>,
}

impl RequestResult {
    pub fn is_ok(&self) -> bool {
        self.status == RequestStatus::Ok
    }
}

/// Formats an optional DDS session id the way results carry it.
pub fn session_id_string(id: Option<Uuid>) -> String {
    id.unwrap_or_else(Uuid::nil).to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionStatus {
    pub partition_id: PartitionId,
    pub session_id: String,
    pub session_status: DdsSessionStatus,
    pub aggregated_state: AggregatedState,
}

/// Reply of the Status verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRequestResult {
    pub status: RequestStatus,
    pub msg: String,
    pub exec_time_ms: u64,
    pub partitions: Vec<PartitionStatus>,
}
