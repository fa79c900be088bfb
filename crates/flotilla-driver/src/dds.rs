use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DdsFailure;
use crate::request::RequestSink;

// ── Request payloads ─────────────────────────────────────────────────────────

/// One agent submission, derived from a
/// [`SubmissionDescriptor`](flotilla_domain::SubmissionDescriptor).
#[derive(Debug, Clone, Default)]
pub struct AgentSubmitRequest {
    pub submission_tag: String,
    pub rms: String,
    pub instances: i32,
    pub min_instances: u32,
    pub slots: u32,
    pub config_file: String,
    pub env_file: String,
    pub group_name: String,
    /// Disables the RMS' own per-slot cpu pinning when cores are scheduled
    /// explicitly.
    pub enable_overbooking: bool,
    /// Extra RMS configuration injected verbatim (e.g. an `#SBATCH` line).
    pub inline_config: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Activate,
    Update,
}

#[derive(Debug, Clone)]
pub struct TopologyActivateRequest {
    pub topology_file: PathBuf,
    pub update_type: UpdateType,
}

// ── Responses and events ─────────────────────────────────────────────────────

/// Per-task activation response. `collection_id` is 0 for standalone tasks.
#[derive(Debug, Clone)]
pub struct ActivationEvent {
    pub activated: bool,
    pub agent_id: u64,
    pub slot_id: u64,
    pub task_id: u64,
    pub collection_id: u64,
    pub path: String,
    pub host: String,
    pub wrk_dir: String,
}

#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub agent_id: u64,
    pub group_name: String,
    pub slots: u32,
    pub idle_slots: u32,
    pub executing_slots: u32,
    pub host: String,
    pub dds_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct CommanderInfo {
    pub pid: u32,
    pub active_topology_name: String,
    /// Empty when no topology is active in the session.
    pub active_topology_path: String,
}

#[derive(Debug, Clone)]
pub struct TaskDoneEvent {
    pub task_id: u64,
    pub task_path: String,
    pub exit_code: i32,
    pub signal: i32,
    pub host: String,
    pub wrk_dir: String,
}

pub type TaskDoneCallback = Arc<dyn Fn(TaskDoneEvent) + Send + Sync>;

// ── Client contract ──────────────────────────────────────────────────────────

/// Contract of the cluster session manager, one instance per partition.
///
/// Submission and activation follow the callback discipline: the caller hands
/// in a [`RequestSink`] and waits on its done signal with a deadline. The
/// query operations are plain async requests; their deadline is applied by
/// the caller.
#[async_trait]
pub trait DdsClient: Send + Sync + 'static {
    // ── Session lifecycle ─────────────────────────────────────────────────────

    /// Create a fresh session and make it current.
    fn create(&self) -> Result<Uuid, DdsFailure>;

    /// Attach to an existing session.
    fn attach(&self, id: Uuid) -> Result<(), DdsFailure>;

    /// Stop the current session. After a successful shutdown `session_id`
    /// reports `None`.
    fn shutdown(&self) -> Result<(), DdsFailure>;

    fn session_id(&self) -> Option<Uuid>;

    fn is_running(&self) -> bool;

    // ── Callback requests ─────────────────────────────────────────────────────

    fn submit_agents(&self, req: &AgentSubmitRequest, sink: Arc<RequestSink<()>>);

    fn activate_topology(
        &self,
        req: &TopologyActivateRequest,
        sink: Arc<RequestSink<ActivationEvent>>,
    );

    /// Subscribe to task-done events; returns a subscription handle to pass
    /// to `unsubscribe_task_done` before session shutdown.
    fn subscribe_task_done(&self, callback: TaskDoneCallback) -> Result<u64, DdsFailure>;

    fn unsubscribe_task_done(&self, subscription: u64);

    // ── Query requests ────────────────────────────────────────────────────────

    /// Resolve once the session holds `n` active slots. Open-ended; callers
    /// race it against their request deadline.
    async fn wait_active_slots(&self, n: u64) -> Result<(), DdsFailure>;

    async fn agent_info(&self) -> Result<Vec<AgentInfo>, DdsFailure>;

    async fn active_slot_count(&self) -> Result<u64, DdsFailure>;

    async fn commander_info(&self) -> Result<CommanderInfo, DdsFailure>;

    async fn shutdown_agent(&self, agent_id: u64) -> Result<(), DdsFailure>;
}
