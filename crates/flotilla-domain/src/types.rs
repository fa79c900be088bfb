use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub String);

impl PartitionId {
    pub fn new(s: impl Into<String>) -> Self {
        PartitionId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Device and aggregated states ─────────────────────────────────────────────

/// State of a single device as reported by the device topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceState {
    Undefined,
    Idle,
    InitializingDevice,
    Initialized,
    Binding,
    Bound,
    Connecting,
    DeviceReady,
    Ready,
    Running,
    ResettingTask,
    ResettingDevice,
    Exiting,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Device state aggregated over a set of tasks. Extends [`DeviceState`] with
/// the `Mixed`, `Ok` and `Error` labels that only make sense for a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggregatedState {
    Undefined,
    Mixed,
    Ok,
    Error,
    Idle,
    InitializingDevice,
    Initialized,
    Binding,
    Bound,
    Connecting,
    DeviceReady,
    Ready,
    Running,
    ResettingTask,
    ResettingDevice,
    Exiting,
}

impl std::fmt::Display for AggregatedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<DeviceState> for AggregatedState {
    fn from(state: DeviceState) -> Self {
        match state {
            DeviceState::Undefined => AggregatedState::Undefined,
            DeviceState::Idle => AggregatedState::Idle,
            DeviceState::InitializingDevice => AggregatedState::InitializingDevice,
            DeviceState::Initialized => AggregatedState::Initialized,
            DeviceState::Binding => AggregatedState::Binding,
            DeviceState::Bound => AggregatedState::Bound,
            DeviceState::Connecting => AggregatedState::Connecting,
            DeviceState::DeviceReady => AggregatedState::DeviceReady,
            DeviceState::Ready => AggregatedState::Ready,
            DeviceState::Running => AggregatedState::Running,
            DeviceState::ResettingTask => AggregatedState::ResettingTask,
            DeviceState::ResettingDevice => AggregatedState::ResettingDevice,
            DeviceState::Exiting => AggregatedState::Exiting,
        }
    }
}

impl AggregatedState {
    /// Aggregate a set of device states: all equal yields that state, a
    /// non-uniform set yields `Mixed`, an empty set yields `Undefined`.
    pub fn aggregate<I>(states: I) -> AggregatedState
    where
        I: IntoIterator<Item = DeviceState>,
    {
        let mut iter = states.into_iter();
        let first = match iter.next() {
            Some(s) => s,
            None => return AggregatedState::Undefined,
        };
        if iter.all(|s| s == first) {
            AggregatedState::from(first)
        } else {
            AggregatedState::Mixed
        }
    }
}

// ── Transitions ──────────────────────────────────────────────────────────────

/// Device state-machine transitions, in the order the composite verbs use
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TopoTransition {
    InitDevice,
    CompleteInit,
    Bind,
    Connect,
    InitTask,
    ResetTask,
    ResetDevice,
    Run,
    Stop,
    End,
}

impl TopoTransition {
    /// The terminal device state a successful transition settles in.
    pub fn expected_state(&self) -> DeviceState {
        match self {
            TopoTransition::InitDevice => DeviceState::InitializingDevice,
            TopoTransition::CompleteInit => DeviceState::Initialized,
            TopoTransition::Bind => DeviceState::Bound,
            TopoTransition::Connect => DeviceState::DeviceReady,
            TopoTransition::InitTask => DeviceState::Ready,
            TopoTransition::Run => DeviceState::Running,
            TopoTransition::Stop => DeviceState::Ready,
            TopoTransition::ResetTask => DeviceState::DeviceReady,
            TopoTransition::ResetDevice => DeviceState::Idle,
            TopoTransition::End => DeviceState::Exiting,
        }
    }
}

impl std::fmt::Display for TopoTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ── Topology runtime state ───────────────────────────────────────────────────

/// Per-task runtime status snapshot reported by the device topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub task_id: u64,
    pub state: DeviceState,
    pub last_state: DeviceState,
    pub subscribed: bool,
    /// Excluded from aggregation and further transitions (expendable or
    /// recovered-away tasks).
    pub ignored: bool,
}

pub type TopoState = Vec<TaskStatus>;

// ── Task and collection details ──────────────────────────────────────────────

/// Placement record for one activated task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDetails {
    pub task_id: u64,
    pub collection_id: u64,
    pub agent_id: u64,
    pub slot_id: u64,
    pub path: String,
    pub host: String,
    pub wrk_dir: String,
}

impl std::fmt::Display for TaskDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "task {} (collection {}), agent {}, slot {}, path {:?}, host {}, wrkDir {:?}",
            self.task_id, self.collection_id, self.agent_id, self.slot_id, self.path, self.host, self.wrk_dir
        )
    }
}

/// Placement record for one activated collection. The path is the parent path
/// of its tasks (task path truncated at the last `/`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDetails {
    pub collection_id: u64,
    pub agent_id: u64,
    pub slot_id: u64,
    pub path: String,
    pub host: String,
    pub wrk_dir: String,
}

impl std::fmt::Display for CollectionDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "collection {}, agent {}, slot {}, path {:?}, host {}, wrkDir {:?}",
            self.collection_id, self.agent_id, self.slot_id, self.path, self.host, self.wrk_dir
        )
    }
}

// ── nMin and zone records ────────────────────────────────────────────────────

/// Replica bookkeeping for a collection governed by an `odc_nmin_*`
/// requirement. `n_min <= n_current <= n_original` holds throughout a
/// session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionNInfo {
    pub n_original: i32,
    pub n_current: i32,
    pub n_min: i32,
    pub agent_group: String,
}

/// One agent group inside a zone, as declared by the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneGroup {
    pub n: i32,
    pub ncores: i32,
    pub agent_group: String,
}

// ── Submission descriptors ───────────────────────────────────────────────────

/// One row of resource-plugin output, optionally enriched with
/// topology-derived zone/core/group information. Only descriptors with
/// `num_agents != -1` are submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionDescriptor {
    pub rms_plugin: String,
    pub zone: String,
    pub agent_group: String,
    pub config_file: String,
    pub env_file: String,
    pub num_agents: i32,
    pub min_agents: u32,
    pub num_slots: u32,
    pub num_cores: u32,
}

impl Default for SubmissionDescriptor {
    fn default() -> Self {
        SubmissionDescriptor {
            rms_plugin: String::new(),
            zone: String::new(),
            agent_group: String::new(),
            config_file: String::new(),
            env_file: String::new(),
            num_agents: -1,
            min_agents: 0,
            num_slots: 0,
            num_cores: 0,
        }
    }
}

impl std::fmt::Display for SubmissionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rms: {}, zone: {}, agentGroup: {}, agents: {}, minAgents: {}, slots: {}, cores: {}, configFile: {:?}, envFile: {:?}",
            self.rms_plugin,
            self.zone,
            self.agent_group,
            self.num_agents,
            self.min_agents,
            self.num_slots,
            self.num_cores,
            self.config_file,
            self.env_file
        )
    }
}
