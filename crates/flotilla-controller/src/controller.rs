use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use flotilla_domain::{
    request::session_id_string, ActivateParams, AggregatedState, CommonParams, DdsSessionStatus,
    DetailedState, DeviceParams, DeviceState, ErrorCode, InitializeParams, PartitionStatus,
    RequestError, RequestResult, RequestStatus, RunParams, SetPropertiesParams, StatusParams,
    StatusRequestResult, SubmitParams, TopoTransition, UpdateParams,
};
use flotilla_driver::{ClusterBackend, UpdateType};
use flotilla_plugin::PluginRegistry;
use flotilla_topology::TopologyError;
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::history;
use crate::restore::{smart_path, RestoreData, RestoreFile, RestorePartition};
use crate::session::{Session, SessionStore};

/// Request names a trigger may be registered for.
pub const TRIGGER_WHITELIST: [&str; 14] = [
    "Initialize", "Submit", "Activate", "Run", "Update", "Configure", "SetProperties", "GetState",
    "Start", "Stop", "Reset", "Terminate", "Shutdown", "Status",
];

/// The facade composing sessions, plugins, the DDS adapter and the state
/// engine into the user-visible request verbs. One instance serves every
/// partition; requests for independent partitions may run concurrently.
pub struct Controller {
    backend: Arc<dyn ClusterBackend>,
    sessions: SessionStore,
    resource_plugins: PluginRegistry,
    triggers: PluginRegistry,
    timeout: Duration,
    restore_id: Option<String>,
    restore_dir: PathBuf,
    history_dir: Option<PathBuf>,
}

impl Controller {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Controller {
            backend,
            sessions: SessionStore::new(),
            resource_plugins: PluginRegistry::with_default_resource_plugin(),
            triggers: PluginRegistry::new(),
            timeout: Duration::from_secs(30),
            restore_id: None,
            restore_dir: smart_path("$HOME/.ODC/restore/"),
            history_dir: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_history_dir(&mut self, dir: impl Into<PathBuf>) {
        self.history_dir = Some(dir.into());
    }

    pub fn register_resource_plugins(
        &mut self,
        plugins: impl IntoIterator<Item = (String, String)>,
    ) {
        for (name, cmd) in plugins {
            self.resource_plugins.register(name, cmd);
        }
    }

    pub fn register_request_triggers(
        &mut self,
        triggers: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ControllerError> {
        for (name, cmd) in triggers {
            if !TRIGGER_WHITELIST.contains(&name.as_str()) {
                return Err(ControllerError::InvalidTrigger {
                    name,
                    valid: TRIGGER_WHITELIST.join(", "),
                });
            }
            self.triggers.register(name, cmd);
        }
        Ok(())
    }

    pub(crate) fn backend(&self) -> &dyn ClusterBackend {
        self.backend.as_ref()
    }

    pub(crate) fn resource_plugins(&self) -> &PluginRegistry {
        &self.resource_plugins
    }

    pub(crate) fn request_timeout(&self, common: &CommonParams) -> Duration {
        common.timeout.unwrap_or(self.timeout)
    }

    // ── Request verbs ─────────────────────────────────────────────────────────

    /// Initialize: with an empty session id, replace any existing DDS session
    /// with a fresh one; with a session id, attach and pick up the active
    /// topology if the commander reports one.
    pub async fn exec_initialize(
        &self,
        common: CommonParams,
        params: InitializeParams,
    ) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);

        if params.session_id.is_empty() {
            let _ = self.shutdown_dds_session(&common, &session, &mut error)
                && self.create_dds_session(&common, &session, &mut error)
                && self.subscribe_to_dds_session(&common, &session, &mut error);
        } else {
            let success = self
                .attach_to_dds_session(&common, &session, &mut error, &params.session_id)
                && self.subscribe_to_dds_session(&common, &session, &mut error);
            if success {
                // pick up an already-active topology from the commander
                if let Some(info) = self.request_commander_info(&common, &session, &mut error).await
                {
                    if !info.active_topology_path.is_empty() {
                        let path = PathBuf::from(&info.active_topology_path);
                        let _ = self.create_dds_topology(&common, &session, &mut error, &path)
                            && self.create_device_topology(&common, &session, &mut error);
                    }
                }
            }
        }

        self.exec_request_trigger("Initialize", &common).await;
        self.update_restore();
        self.create_request_result(&common, error, "Initialize done", AggregatedState::Undefined, None)
    }

    pub async fn exec_submit(&self, common: CommonParams, params: SubmitParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);

        self.submit(&common, &session, &mut error, &params.plugin, &params.resources).await;

        self.exec_request_trigger("Submit", &common).await;
        self.create_request_result(&common, error, "Submit done", AggregatedState::Undefined, None)
    }

    pub async fn exec_activate(&self, common: CommonParams, params: ActivateParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);

        if !session.dds.is_running() {
            self.fill_and_log_error(
                &common,
                &mut error,
                ErrorCode::DDSActivateTopologyFailed,
                "DDS session is not running. Use Init or Run to start the session.",
            );
        }

        if let Err(e) = self
            .resolve_topology(&common, &session, &params.topo_file, &params.topo_content, &params.topo_script)
            .await
        {
            self.fill_and_log_fatal_error(&common, &mut error, ErrorCode::TopologyFailed, e.to_string());
        }

        if !error.is_set() {
            self.activate(&common, &session, &mut error).await;
        }

        let state = if error.is_set() { AggregatedState::Undefined } else { AggregatedState::Idle };
        self.exec_request_trigger("Activate", &common).await;
        self.create_request_result(&common, error, "Activate done", state, None)
    }

    /// Run: one-shot per session; Initialize with a fresh session, Submit,
    /// then Activate.
    pub async fn exec_run(&self, common: CommonParams, params: RunParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);

        if !session.mark_run_attempted() {
            let _ = self.shutdown_dds_session(&common, &session, &mut error)
                && self.create_dds_session(&common, &session, &mut error)
                && self.subscribe_to_dds_session(&common, &session, &mut error);

            self.exec_request_trigger("Initialize", &common).await;
            self.update_restore();

            if !error.is_set() {
                if let Err(e) = self
                    .resolve_topology(
                        &common,
                        &session,
                        &params.topo_file,
                        &params.topo_content,
                        &params.topo_script,
                    )
                    .await
                {
                    self.fill_and_log_fatal_error(
                        &common,
                        &mut error,
                        ErrorCode::TopologyFailed,
                        format!("Incorrect topology provided: {}", e),
                    );
                }

                if !error.is_set() {
                    if !session.dds.is_running() {
                        self.fill_and_log_error(
                            &common,
                            &mut error,
                            ErrorCode::DDSSubmitAgentsFailed,
                            "DDS session is not running. Use Init or Run to start the session.",
                        );
                    }

                    self.submit(&common, &session, &mut error, &params.plugin, &params.resources)
                        .await;

                    if !session.dds.is_running() {
                        self.fill_and_log_error(
                            &common,
                            &mut error,
                            ErrorCode::DDSActivateTopologyFailed,
                            "DDS session is not running. Use Init or Run to start the session.",
                        );
                    }

                    if !error.is_set() {
                        self.activate(&common, &session, &mut error).await;
                    }
                }
            }
        } else {
            error.set(
                ErrorCode::RequestNotSupported,
                "Repeated Run request is not supported. Shutdown this partition to retry.",
            );
            error!(
                partition = %common.partition_id, run = common.run_nr,
                "repeated Run request is not supported"
            );
        }

        let state = if error.is_set() { AggregatedState::Undefined } else { AggregatedState::Idle };
        self.exec_request_trigger("Run", &common).await;
        self.create_request_result(&common, error, "Run done", state, None)
    }

    /// Update: Reset, re-activate the new topology with UPDATE semantics,
    /// then Configure.
    pub async fn exec_update(&self, common: CommonParams, params: UpdateParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);
        let mut state = AggregatedState::Undefined;
        let mut detailed = None;

        if let Err(e) = self
            .resolve_topology(&common, &session, &params.topo_file, &params.topo_content, &params.topo_script)
            .await
        {
            self.fill_and_log_fatal_error(
                &common,
                &mut error,
                ErrorCode::TopologyFailed,
                format!("Incorrect topology provided: {}", e),
            );
        }

        if !error.is_set() {
            let _ = self
                .change_state_reset(&common, &session, &mut error, "", &mut state, &mut detailed)
                .await
                && {
                    session.reset_device();
                    true
                }
                && self.activate_dds_topology(&common, &session, &mut error, UpdateType::Update).await
                && self.create_dds_topology_from_session(&common, &session, &mut error)
                && self.create_device_topology(&common, &session, &mut error)
                && self.wait_for_state(&common, &session, &mut error, DeviceState::Idle, "").await
                && self
                    .change_state_configure(&common, &session, &mut error, "", &mut state, &mut detailed)
                    .await;
        }

        self.exec_request_trigger("Update", &common).await;
        self.create_request_result(&common, error, "Update done", state, None)
    }

    pub async fn exec_configure(&self, common: CommonParams, params: DeviceParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);
        let mut state = AggregatedState::Undefined;
        let mut detailed = params.detailed.then(Vec::new);

        self.change_state_configure(&common, &session, &mut error, &params.path, &mut state, &mut detailed)
            .await;

        self.exec_request_trigger("Configure", &common).await;
        self.create_request_result(&common, error, "Configure done", state, detailed)
    }

    pub async fn exec_start(&self, common: CommonParams, params: DeviceParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);
        // the run number is valid for the duration of the running state
        session.last_run_nr.store(common.run_nr, Ordering::SeqCst);

        let mut state = AggregatedState::Undefined;
        let mut detailed = params.detailed.then(Vec::new);
        self.change_state(&common, &session, &mut error, TopoTransition::Run, &params.path, &mut state, &mut detailed)
            .await;

        self.exec_request_trigger("Start", &common).await;
        self.create_request_result(&common, error, "Start done", state, detailed)
    }

    pub async fn exec_stop(&self, common: CommonParams, params: DeviceParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);

        let mut state = AggregatedState::Undefined;
        let mut detailed = params.detailed.then(Vec::new);
        self.change_state(&common, &session, &mut error, TopoTransition::Stop, &params.path, &mut state, &mut detailed)
            .await;

        session.last_run_nr.store(0, Ordering::SeqCst);

        self.exec_request_trigger("Stop", &common).await;
        self.create_request_result(&common, error, "Stop done", state, detailed)
    }

    pub async fn exec_reset(&self, common: CommonParams, params: DeviceParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);
        let mut state = AggregatedState::Undefined;
        let mut detailed = params.detailed.then(Vec::new);

        self.change_state_reset(&common, &session, &mut error, &params.path, &mut state, &mut detailed)
            .await;

        self.exec_request_trigger("Reset", &common).await;
        self.create_request_result(&common, error, "Reset done", state, detailed)
    }

    pub async fn exec_terminate(&self, common: CommonParams, params: DeviceParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);
        let mut state = AggregatedState::Undefined;
        let mut detailed = params.detailed.then(Vec::new);

        self.change_state(&common, &session, &mut error, TopoTransition::End, &params.path, &mut state, &mut detailed)
            .await;

        self.exec_request_trigger("Terminate", &common).await;
        self.create_request_result(&common, error, "Terminate done", state, detailed)
    }

    pub async fn exec_get_state(&self, common: CommonParams, params: DeviceParams) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);
        let mut state = AggregatedState::Undefined;
        let mut detailed = params.detailed.then(Vec::new);

        self.get_state(&common, &session, &mut error, &params.path, &mut state, &mut detailed);

        self.exec_request_trigger("GetState", &common).await;
        self.create_request_result(&common, error, "GetState done", state, detailed)
    }

    pub async fn exec_set_properties(
        &self,
        common: CommonParams,
        params: SetPropertiesParams,
    ) -> RequestResult {
        let mut error = RequestError::default();
        let session = self.get_or_create_session(&common);
        let mut state = AggregatedState::Undefined;

        self.set_properties(&common, &session, &mut error, &params, &mut state).await;

        self.exec_request_trigger("SetProperties", &common).await;
        self.create_request_result(&common, error, "SetProperties done", state, None)
    }

    /// Shutdown: stop the DDS session and forget the partition. Idempotent;
    /// a partition without a session shuts down to `ok`.
    pub async fn exec_shutdown(&self, common: CommonParams) -> RequestResult {
        let mut error = RequestError::default();

        // grab the session id before shutting down, to return it in the reply
        let session = self.get_or_create_session(&common);
        let session_id = session_id_string(session.dds.session_id());

        self.shutdown_dds_session(&common, &session, &mut error);
        self.remove_session(&common);
        self.update_restore();
        self.exec_request_trigger("Shutdown", &common).await;

        let status = if error.is_set() { RequestStatus::Error } else { RequestStatus::Ok };
        RequestResult {
            status,
            msg: "Shutdown done".to_string(),
            exec_time_ms: common.elapsed_ms(),
            error,
            partition_id: common.partition_id.clone(),
            run_nr: common.run_nr,
            session_id,
            aggregated_state: AggregatedState::Undefined,
            detailed_state: None,
        }
    }

    /// Status: snapshot every partition under the sessions mutex.
    pub async fn exec_status(&self, params: StatusParams) -> StatusRequestResult {
        let partitions = self.sessions.with_sessions(|iter| {
            let mut partitions = Vec::new();
            for session in iter {
                let session_status = if session.dds.is_running() {
                    DdsSessionStatus::Running
                } else {
                    DdsSessionStatus::Stopped
                };
                if params.running_only && session_status != DdsSessionStatus::Running {
                    continue;
                }
                let aggregated_state = match (session.device(), session.topo()) {
                    (Some(device), Some(topo)) => flotilla_topology::aggregate_state_for_path(
                        Some(&topo),
                        &device.current_state(),
                        "",
                    )
                    .unwrap_or_else(|e| {
                        warn!(
                            partition = %session.partition_id, error = %e,
                            "failed to get an aggregated state"
                        );
                        AggregatedState::Undefined
                    }),
                    _ => AggregatedState::Undefined,
                };
                partitions.push(PartitionStatus {
                    partition_id: session.partition_id.clone(),
                    session_id: session_id_string(session.dds.session_id()),
                    session_status,
                    aggregated_state,
                });
            }
            partitions
        });

        self.exec_request_trigger("Status", &CommonParams::new("", 0)).await;
        StatusRequestResult {
            status: RequestStatus::Ok,
            msg: "Status done".to_string(),
            exec_time_ms: params.elapsed_ms(),
            partitions,
        }
    }

    // ── Startup restore ───────────────────────────────────────────────────────

    /// Reattach every partition recorded under the restore id. A partition
    /// that fails to attach gets its `Shutdown` trigger fired instead.
    pub async fn restore(&mut self, id: &str, dir: Option<PathBuf>) {
        self.restore_id = Some(id.to_string());
        if let Some(dir) = dir {
            self.restore_dir = dir;
        }

        info!(restore = id, "restoring sessions");
        let data = match RestoreFile::new(id, &self.restore_dir).read() {
            Ok(data) => data,
            Err(e) => {
                error!(restore = id, error = %e, "failed to read restore file");
                return;
            }
        };

        for partition in data.partitions {
            info!(
                partition = %partition.partition_id, session = %partition.dds_session_id,
                "restoring partition"
            );
            let common = CommonParams::new(partition.partition_id.clone(), 0);
            let result = self
                .exec_initialize(
                    common.clone(),
                    InitializeParams { session_id: partition.dds_session_id.clone() },
                )
                .await;
            if result.is_ok() {
                info!(
                    partition = %partition.partition_id, session = %partition.dds_session_id,
                    "successfully attached to the session"
                );
            } else {
                info!(
                    partition = %partition.partition_id, session = %partition.dds_session_id,
                    "failed to attach to the session, executing Shutdown trigger"
                );
                self.exec_request_trigger("Shutdown", &common).await;
            }
        }
    }

    // ── Shared verb plumbing ──────────────────────────────────────────────────

    pub(crate) fn get_or_create_session(&self, common: &CommonParams) -> Arc<Session> {
        let backend = &self.backend;
        self.sessions.get_or_create(&common.partition_id, || backend.create_client())
    }

    pub(crate) fn remove_session(&self, common: &CommonParams) {
        if self.sessions.remove(&common.partition_id) {
            debug!(partition = %common.partition_id, "removed session");
        } else {
            debug!(partition = %common.partition_id, "found no session to remove");
        }
    }

    /// Resolve the topology source onto disk and extract its requirements
    /// into the session.
    pub(crate) async fn resolve_topology(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        topo_file: &str,
        topo_content: &str,
        topo_script: &str,
    ) -> Result<(), TopologyError> {
        let path = flotilla_topology::resolve_topology_file(
            topo_file,
            topo_content,
            topo_script,
            self.request_timeout(common),
        )
        .await?;
        session.fields_mut().topo_file_path = Some(path.clone());

        info!(partition = %common.partition_id, run = common.run_nr, "extracting requirements");
        let topo = flotilla_topology::Topology::load(&path)?;
        let extracted = flotilla_topology::extract(&topo)?;
        let mut fields = session.fields_mut();
        for (name, info) in extracted.n_info {
            fields.n_info.entry(name).or_insert(info);
        }
        for (zone, groups) in extracted.zone_infos {
            fields.zone_infos.entry(zone).or_default().extend(groups);
        }
        fields.expendable.extend(extracted.expendable_tasks);
        Ok(())
    }

    /// Activate sequence shared by Activate and Run.
    pub(crate) async fn activate(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
    ) {
        let _ = self.activate_dds_topology(common, session, error, UpdateType::Activate).await
            && self.create_dds_topology_from_session(common, session, error)
            && self.create_device_topology(common, session, error)
            && self.wait_for_state(common, session, error, DeviceState::Idle, "").await;
    }

    pub(crate) fn create_dds_topology_from_session(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
    ) -> bool {
        let topo_file = match session.fields().topo_file_path.clone() {
            Some(path) => path,
            None => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSCreateTopologyFailed,
                    "Failed to initialize DDS topology: no topology file set",
                );
                return false;
            }
        };
        self.create_dds_topology(common, session, error, &topo_file)
    }

    pub(crate) async fn exec_request_trigger(&self, trigger: &str, common: &CommonParams) {
        if !self.triggers.is_registered(trigger) {
            return;
        }
        debug!(partition = %common.partition_id, run = common.run_nr, trigger, "executing request trigger");
        match self
            .triggers
            .exec(trigger, "", common.partition_id.as_str(), common.run_nr, self.request_timeout(common))
            .await
        {
            Ok(out) => debug!(
                partition = %common.partition_id, run = common.run_nr,
                trigger, out = %out, "request trigger done"
            ),
            Err(e) => error!(
                partition = %common.partition_id, run = common.run_nr,
                trigger, error = %e, "request trigger failed"
            ),
        }
    }

    /// Rewrite the restore manifest from the currently running sessions.
    /// Writing happens under the sessions mutex to serialize disk writes.
    pub(crate) fn update_restore(&self) {
        let Some(id) = &self.restore_id else { return };
        let file = RestoreFile::new(id, &self.restore_dir);
        self.sessions.with_sessions(|iter| {
            let mut data = RestoreData::default();
            for session in iter {
                if session.dds.is_running() {
                    data.partitions.push(RestorePartition {
                        partition_id: session.partition_id.to_string(),
                        dds_session_id: session_id_string(session.dds.session_id()),
                    });
                }
            }
            if let Err(e) = file.write(&data) {
                error!(error = %e, "failed to write restore file");
            }
        });
    }

    /// Append one history line per created session; serialized by the
    /// sessions mutex like the restore writes.
    pub(crate) fn update_history(&self, common: &CommonParams, session_id: &str) {
        let Some(dir) = self.history_dir.clone() else { return };
        self.sessions.with_sessions(|_| {
            info!(
                partition = %common.partition_id, run = common.run_nr,
                dir = %dir.display(), "updating history file"
            );
            if let Err(e) = history::append_history(&dir, common.partition_id.as_str(), session_id) {
                error!(
                    dir = %dir.display(), error = %e,
                    "failed to write history file"
                );
            }
        });
    }

    pub(crate) fn create_request_result(
        &self,
        common: &CommonParams,
        error: RequestError,
        msg: &str,
        aggregated_state: AggregatedState,
        detailed_state: Option<DetailedState>,
    ) -> RequestResult {
        let session = self.get_or_create_session(common);
        let session_id = session_id_string(session.dds.session_id());
        let status = if error.is_set() { RequestStatus::Error } else { RequestStatus::Ok };
        RequestResult {
            status,
            msg: msg.to_string(),
            exec_time_ms: common.elapsed_ms(),
            error,
            partition_id: common.partition_id.clone(),
            run_nr: common.run_nr,
            session_id,
            aggregated_state,
            detailed_state,
        }
    }

    pub(crate) fn fill_and_log_error(
        &self,
        common: &CommonParams,
        error: &mut RequestError,
        code: ErrorCode,
        msg: impl Into<String>,
    ) {
        let msg = msg.into();
        error!(partition = %common.partition_id, run = common.run_nr, code = %code, "{}", msg);
        error.set(code, msg);
    }

    pub(crate) fn fill_and_log_fatal_error(
        &self,
        common: &CommonParams,
        error: &mut RequestError,
        code: ErrorCode,
        msg: impl Into<String>,
    ) {
        let msg = msg.into();
        error!(
            partition = %common.partition_id, run = common.run_nr,
            code = %code, fatal = true, "{}", msg
        );
        error.set(code, msg);
    }
}
