use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flotilla_domain::{DeviceState, TaskStatus, TopoState, TopoTransition};
use flotilla_topology::Topology;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dds::{
    ActivationEvent, AgentInfo, AgentSubmitRequest, CommanderInfo, DdsClient, TaskDoneCallback,
    TaskDoneEvent, TopologyActivateRequest,
};
use crate::device::{ClusterBackend, DeviceControl, DeviceTask};
use crate::error::{DdsFailure, DeviceError, SetPropertiesFailure};
use crate::request::{RequestSink, Severity};

// ── Cluster-wide simulated state ─────────────────────────────────────────────

#[derive(Debug, Clone)]
struct AgentRecord {
    id: u64,
    group: String,
    slots: u32,
    host: String,
    wrk_dir: String,
}

#[derive(Default)]
struct SessionRecord {
    agents: BTreeMap<u64, AgentRecord>,
    next_agent_id: u64,
    active_topology: Option<PathBuf>,
    subscriptions: HashMap<u64, TaskDoneCallback>,
    next_subscription_id: u64,
}

#[derive(Default)]
struct ClusterState {
    sessions: HashMap<Uuid, SessionRecord>,
    submit_shortfall: HashMap<String, i32>,
    failing_paths: Vec<String>,
}

/// In-process simulation of the cluster session manager and device topology.
///
/// Carries the state shared by every partition's client: sessions by uuid (so
/// attach works across client instances), their agents and slots, and the
/// fault-injection knobs the test suite uses.
#[derive(Clone, Default)]
pub struct LocalCluster {
    inner: Arc<Mutex<ClusterState>>,
}

impl LocalCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make submissions for `group` spawn `missing` agents fewer than
    /// requested.
    pub fn set_submit_shortfall(&self, group: &str, missing: i32) {
        self.inner.lock().unwrap().submit_shortfall.insert(group.to_string(), missing);
    }

    /// Devices whose runtime path contains `fragment` fail transitions and
    /// property updates.
    pub fn add_device_failure(&self, fragment: &str) {
        self.inner.lock().unwrap().failing_paths.push(fragment.to_string());
    }

    pub fn clear_device_failures(&self) {
        self.inner.lock().unwrap().failing_paths.clear();
    }

    /// Deliver a task-done event to every subscriber of `session`.
    pub fn emit_task_done(&self, session: Uuid, event: TaskDoneEvent) {
        let callbacks: Vec<TaskDoneCallback> = {
            let state = self.inner.lock().unwrap();
            match state.sessions.get(&session) {
                Some(s) => s.subscriptions.values().cloned().collect(),
                None => Vec::new(),
            }
        };
        for cb in callbacks {
            cb(event.clone());
        }
    }

    fn failing_paths(&self) -> Vec<String> {
        self.inner.lock().unwrap().failing_paths.clone()
    }
}

// ── DdsClient ────────────────────────────────────────────────────────────────

/// Per-partition client over a shared [`LocalCluster`].
pub struct LocalDds {
    cluster: LocalCluster,
    current: Mutex<Option<Uuid>>,
}

impl LocalDds {
    pub fn new(cluster: LocalCluster) -> Self {
        LocalDds { cluster, current: Mutex::new(None) }
    }

    fn current(&self) -> Option<Uuid> {
        *self.current.lock().unwrap()
    }

    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut SessionRecord) -> T,
    ) -> Result<T, DdsFailure> {
        let id = self.current().ok_or(DdsFailure::NotRunning)?;
        let mut state = self.cluster.inner.lock().unwrap();
        let session = state.sessions.get_mut(&id).ok_or(DdsFailure::UnknownSession(id))?;
        Ok(f(session))
    }
}

#[async_trait]
impl DdsClient for LocalDds {
    fn create(&self) -> Result<Uuid, DdsFailure> {
        let id = Uuid::new_v4();
        self.cluster.inner.lock().unwrap().sessions.insert(id, SessionRecord::default());
        *self.current.lock().unwrap() = Some(id);
        Ok(id)
    }

    fn attach(&self, id: Uuid) -> Result<(), DdsFailure> {
        if !self.cluster.inner.lock().unwrap().sessions.contains_key(&id) {
            return Err(DdsFailure::UnknownSession(id));
        }
        *self.current.lock().unwrap() = Some(id);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DdsFailure> {
        let mut current = self.current.lock().unwrap();
        if let Some(id) = current.take() {
            self.cluster.inner.lock().unwrap().sessions.remove(&id);
        }
        Ok(())
    }

    fn session_id(&self) -> Option<Uuid> {
        self.current()
    }

    fn is_running(&self) -> bool {
        match self.current() {
            Some(id) => self.cluster.inner.lock().unwrap().sessions.contains_key(&id),
            None => false,
        }
    }

    fn submit_agents(&self, req: &AgentSubmitRequest, sink: Arc<RequestSink<()>>) {
        let id = match self.current() {
            Some(id) => id,
            None => {
                sink.on_message(Severity::Error, "Submit error: no running DDS session");
                sink.done();
                return;
            }
        };
        let mut state = self.cluster.inner.lock().unwrap();
        let shortfall = state.submit_shortfall.get(&req.group_name).copied().unwrap_or(0);
        let session = match state.sessions.get_mut(&id) {
            Some(s) => s,
            None => {
                sink.on_message(Severity::Error, "Submit error: session is gone");
                sink.done();
                return;
            }
        };

        let to_spawn = (req.instances - shortfall).max(0);
        for i in 0..to_spawn {
            session.next_agent_id += 1;
            let agent_id = session.next_agent_id;
            session.agents.insert(
                agent_id,
                AgentRecord {
                    id: agent_id,
                    group: req.group_name.clone(),
                    slots: req.slots,
                    host: format!("node{:03}", agent_id),
                    wrk_dir: format!("/tmp/wrk/{}/{}", req.submission_tag, agent_id),
                },
            );
            debug!(agent = agent_id, group = %req.group_name, slot_count = req.slots, index = i, "agent online");
        }
        if shortfall > 0 {
            warn!(group = %req.group_name, shortfall, "submission spawned fewer agents than requested");
        }
        sink.on_message(Severity::Info, &format!("submitted {} agents", to_spawn));
        sink.done();
    }

    fn activate_topology(
        &self,
        req: &TopologyActivateRequest,
        sink: Arc<RequestSink<ActivationEvent>>,
    ) {
        let topo = match Topology::load(&req.topology_file) {
            Ok(t) => t,
            Err(e) => {
                sink.on_message(Severity::Error, &format!("Activate error: {}", e));
                sink.done();
                return;
            }
        };

        let id = match self.current() {
            Some(id) => id,
            None => {
                sink.on_message(Severity::Error, "Activate error: no running DDS session");
                sink.done();
                return;
            }
        };

        let mut state = self.cluster.inner.lock().unwrap();
        let session = match state.sessions.get_mut(&id) {
            Some(s) => s,
            None => {
                sink.on_message(Severity::Error, "Activate error: session is gone");
                sink.done();
                return;
            }
        };

        // One agent per collection instance; standalone tasks fill remaining
        // slots in agent order.
        let agents: Vec<AgentRecord> = session.agents.values().cloned().collect();
        let mut collection_agent: HashMap<u64, (u64, String, String)> = HashMap::new();
        let mut next_agent = 0usize;
        for collection in topo.runtime_collections() {
            if next_agent >= agents.len() {
                sink.on_message(
                    Severity::Error,
                    &format!(
                        "Activate error: not enough agents for {} collections",
                        topo.runtime_collections().len()
                    ),
                );
                sink.done();
                return;
            }
            let agent = &agents[next_agent];
            collection_agent
                .insert(collection.id, (agent.id, agent.host.clone(), agent.wrk_dir.clone()));
            next_agent += 1;
        }

        let mut slot_cursor: HashMap<u64, u64> = HashMap::new();
        let spare_agent = agents.first().cloned();
        for task in topo.runtime_tasks() {
            let (agent_id, host, wrk_dir) = if task.collection_id != 0 {
                collection_agent[&task.collection_id].clone()
            } else {
                match &spare_agent {
                    Some(a) => (a.id, a.host.clone(), a.wrk_dir.clone()),
                    None => {
                        sink.on_message(Severity::Error, "Activate error: no agents for standalone tasks");
                        sink.done();
                        return;
                    }
                }
            };
            let slot = slot_cursor.entry(agent_id).or_insert(0);
            *slot += 1;
            sink.on_response(ActivationEvent {
                activated: true,
                agent_id,
                slot_id: *slot,
                task_id: task.id,
                collection_id: task.collection_id,
                path: task.path.clone(),
                host,
                wrk_dir,
            });
        }

        session.active_topology = Some(req.topology_file.clone());
        sink.done();
    }

    fn subscribe_task_done(&self, callback: TaskDoneCallback) -> Result<u64, DdsFailure> {
        self.with_session(|session| {
            session.next_subscription_id += 1;
            session.subscriptions.insert(session.next_subscription_id, callback);
            session.next_subscription_id
        })
    }

    fn unsubscribe_task_done(&self, subscription: u64) {
        let _ = self.with_session(|session| {
            session.subscriptions.remove(&subscription);
        });
    }

    async fn wait_active_slots(&self, n: u64) -> Result<(), DdsFailure> {
        loop {
            let count = self.active_slot_count().await?;
            if count >= n {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn agent_info(&self) -> Result<Vec<AgentInfo>, DdsFailure> {
        self.with_session(|session| {
            session
                .agents
                .values()
                .map(|a| AgentInfo {
                    agent_id: a.id,
                    group_name: a.group.clone(),
                    slots: a.slots,
                    idle_slots: a.slots,
                    executing_slots: 0,
                    host: a.host.clone(),
                    dds_path: format!("/dds/agents/{}", a.id),
                })
                .collect()
        })
    }

    async fn active_slot_count(&self) -> Result<u64, DdsFailure> {
        self.with_session(|session| {
            session.agents.values().map(|a| a.slots as u64).sum()
        })
    }

    async fn commander_info(&self) -> Result<CommanderInfo, DdsFailure> {
        self.with_session(|session| CommanderInfo {
            pid: std::process::id(),
            active_topology_name: String::new(),
            active_topology_path: session
                .active_topology
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        })
    }

    async fn shutdown_agent(&self, agent_id: u64) -> Result<(), DdsFailure> {
        self.with_session(|session| {
            session
                .agents
                .remove(&agent_id)
                .map(|_| ())
                .ok_or(DdsFailure::UnknownAgent(agent_id))
        })?
    }
}

// ── DeviceControl ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct DeviceRecord {
    task_id: u64,
    collection_id: u64,
    path: String,
    state: DeviceState,
    last_state: DeviceState,
    ignored: bool,
    failing: bool,
}

/// Device topology over the activated task set. Devices come up `Idle`;
/// transitions move non-failing tasks straight to the transition's terminal
/// state.
pub struct LocalDeviceControl {
    devices: Mutex<Vec<DeviceRecord>>,
}

impl LocalDeviceControl {
    pub fn new(tasks: &[DeviceTask], failing_paths: &[String]) -> Self {
        let devices = tasks
            .iter()
            .map(|t| DeviceRecord {
                task_id: t.task_id,
                collection_id: t.collection_id,
                path: t.path.clone(),
                state: DeviceState::Idle,
                last_state: DeviceState::Undefined,
                ignored: false,
                failing: failing_paths.iter().any(|f| t.path.contains(f)),
            })
            .collect();
        LocalDeviceControl { devices: Mutex::new(devices) }
    }

    fn snapshot(&self) -> TopoState {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .map(|d| TaskStatus {
                task_id: d.task_id,
                state: d.state,
                last_state: d.last_state,
                subscribed: true,
                ignored: d.ignored,
            })
            .collect()
    }

    fn path_matches(device_path: &str, path: &str) -> bool {
        path.is_empty()
            || device_path == path
            || (device_path.starts_with(path)
                && device_path.as_bytes().get(path.len()) == Some(&b'/'))
    }

    /// Device states a transition may legally start from.
    fn valid_sources(transition: TopoTransition) -> &'static [DeviceState] {
        match transition {
            TopoTransition::InitDevice => &[DeviceState::Idle],
            TopoTransition::CompleteInit => &[DeviceState::InitializingDevice],
            TopoTransition::Bind => &[DeviceState::Initialized],
            TopoTransition::Connect => &[DeviceState::Bound],
            TopoTransition::InitTask => &[DeviceState::DeviceReady],
            TopoTransition::Run => &[DeviceState::Ready],
            TopoTransition::Stop => &[DeviceState::Running],
            TopoTransition::ResetTask => &[DeviceState::Ready],
            TopoTransition::ResetDevice => &[DeviceState::DeviceReady],
            TopoTransition::End => &[DeviceState::Idle],
        }
    }
}

#[async_trait]
impl DeviceControl for LocalDeviceControl {
    async fn change_state(
        &self,
        transition: TopoTransition,
        path: &str,
        _timeout: Duration,
    ) -> Result<TopoState, DeviceError> {
        let expected = transition.expected_state();
        let sources = Self::valid_sources(transition);
        let mut failed = 0usize;
        {
            let mut devices = self.devices.lock().unwrap();
            let selected: Vec<usize> = devices
                .iter()
                .enumerate()
                .filter(|(_, d)| !d.ignored && Self::path_matches(&d.path, path))
                .map(|(i, _)| i)
                .collect();

            if !selected.is_empty()
                && selected.iter().all(|&i| !sources.contains(&devices[i].state))
            {
                return Err(DeviceError::InvalidTransition { transition });
            }

            for &i in &selected {
                let device = &mut devices[i];
                if device.failing || !sources.contains(&device.state) {
                    failed += 1;
                    continue;
                }
                device.last_state = device.state;
                device.state = expected;
            }
        }

        if failed > 0 {
            return Err(DeviceError::FailedDevices { failed, expected });
        }
        Ok(self.snapshot())
    }

    async fn wait_for_state(
        &self,
        expected: DeviceState,
        path: &str,
        timeout: Duration,
    ) -> Result<(), DeviceError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let all_reached = {
                let devices = self.devices.lock().unwrap();
                devices
                    .iter()
                    .filter(|d| !d.ignored && Self::path_matches(&d.path, path))
                    .all(|d| d.state == expected)
            };
            if all_reached {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DeviceError::OperationTimeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn set_properties(
        &self,
        _properties: &[(String, String)],
        path: &str,
        _timeout: Duration,
    ) -> Result<(), SetPropertiesFailure> {
        let failed: Vec<u64> = {
            let devices = self.devices.lock().unwrap();
            devices
                .iter()
                .filter(|d| !d.ignored && Self::path_matches(&d.path, path) && d.failing)
                .map(|d| d.task_id)
                .collect()
        };
        if failed.is_empty() {
            Ok(())
        } else {
            Err(SetPropertiesFailure {
                error: DeviceError::FailedDevices {
                    failed: failed.len(),
                    expected: DeviceState::Undefined,
                },
                failed_devices: failed,
            })
        }
    }

    fn current_state(&self) -> TopoState {
        self.snapshot()
    }

    fn ignore_failed_task(&self, task_id: u64) {
        let mut devices = self.devices.lock().unwrap();
        if let Some(device) = devices.iter_mut().find(|d| d.task_id == task_id) {
            device.ignored = true;
        }
    }

    fn ignore_failed_collections(&self, collection_ids: &[u64]) {
        let mut devices = self.devices.lock().unwrap();
        for device in devices.iter_mut() {
            if collection_ids.contains(&device.collection_id) {
                device.ignored = true;
            }
        }
    }
}

// ── Backend ──────────────────────────────────────────────────────────────────

/// [`ClusterBackend`] over a shared [`LocalCluster`].
#[derive(Clone, Default)]
pub struct LocalBackend {
    cluster: LocalCluster,
}

impl LocalBackend {
    pub fn new(cluster: LocalCluster) -> Self {
        LocalBackend { cluster }
    }

    pub fn cluster(&self) -> &LocalCluster {
        &self.cluster
    }
}

impl ClusterBackend for LocalBackend {
    fn create_client(&self) -> Arc<dyn DdsClient> {
        Arc::new(LocalDds::new(self.cluster.clone()))
    }

    fn create_device_control(
        &self,
        tasks: &[DeviceTask],
    ) -> Result<Arc<dyn DeviceControl>, DeviceError> {
        Ok(Arc::new(LocalDeviceControl::new(tasks, &self.cluster.failing_paths())))
    }
}
