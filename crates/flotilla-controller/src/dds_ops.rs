use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use flotilla_domain::{
    CollectionDetails, CommonParams, ErrorCode, RequestError, SubmissionDescriptor, TaskDetails,
};
use flotilla_driver::{
    AgentInfo, AgentSubmitRequest, CommanderInfo, DdsFailure, DeviceTask, RequestSink,
    TaskDoneCallback, TaskDoneEvent, TopologyActivateRequest, UpdateType,
};
use flotilla_topology::Topology;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::controller::Controller;
use crate::session::Session;

/// DDS request helpers. Each follows the shared discipline: build the
/// request, hand a sink to the client, wait for the done signal up to the
/// request timeout, then harvest the accumulated error and responses. A
/// timed-out request discards its partial result.
impl Controller {
    pub(crate) fn create_dds_session(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
    ) -> bool {
        match session.dds.create() {
            Ok(id) => {
                info!(partition = %common.partition_id, run = common.run_nr, session = %id, "DDS session created");
                self.update_history(common, &id.to_string());
                true
            }
            Err(e) => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSCreateSessionFailed,
                    format!("Failed to create a DDS session: {}", e),
                );
                false
            }
        }
    }

    pub(crate) fn attach_to_dds_session(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        session_id: &str,
    ) -> bool {
        let parsed = Uuid::parse_str(session_id)
            .map_err(|e| DdsFailure::Other(e.to_string()))
            .and_then(|id| session.dds.attach(id));
        match parsed {
            Ok(()) => {
                info!(partition = %common.partition_id, run = common.run_nr, session = %session_id, "attached to DDS session");
                true
            }
            Err(e) => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSAttachToSessionFailed,
                    format!("Failed to attach to a DDS session: {}", e),
                );
                false
            }
        }
    }

    pub(crate) fn subscribe_to_dds_session(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
    ) -> bool {
        if !session.dds.is_running() {
            self.fill_and_log_error(
                common,
                error,
                ErrorCode::DDSSubscribeToSessionFailed,
                "Failed to subscribe to task done events: session is not running",
            );
            return false;
        }

        let partition = common.partition_id.clone();
        let run_nr = session.last_run_nr.clone();
        let callback: TaskDoneCallback = Arc::new(move |task: TaskDoneEvent| {
            let run = run_nr.load(Ordering::Relaxed);
            if task.exit_code != 0 || task.signal != 0 {
                error!(
                    partition = %partition, run,
                    task = task.task_id, path = %task.task_path,
                    exit_code = task.exit_code, signal = task.signal,
                    host = %task.host, wrk_dir = %task.wrk_dir,
                    "task exited abnormally"
                );
            } else {
                debug!(
                    partition = %partition, run,
                    task = task.task_id, path = %task.task_path,
                    host = %task.host, wrk_dir = %task.wrk_dir,
                    "task done"
                );
            }
        });

        match session.dds.subscribe_task_done(callback) {
            Ok(subscription) => {
                session.store_subscription(subscription);
                info!(partition = %common.partition_id, run = common.run_nr, "subscribed to task done events");
                true
            }
            Err(e) => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSSubscribeToSessionFailed,
                    format!("Failed to subscribe to task done events: {}", e),
                );
                false
            }
        }
    }

    /// Cancel the subscription, drop the topology handles, clear the
    /// per-session collections and shut the DDS session down. A session whose
    /// id is already nil is left alone.
    pub(crate) fn shutdown_dds_session(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
    ) -> bool {
        session.reset_device();
        session.reset_topo();
        {
            let mut fields = session.fields_mut();
            fields.topo_file_path = None;
            fields.n_info.clear();
            fields.zone_infos.clear();
            fields.tasks.clear();
            fields.collections.clear();
            fields.expendable.clear();
            fields.agent_slots.clear();
            fields.total_slots = 0;
        }

        if session.dds.session_id().is_some() {
            if let Some(subscription) = session.take_subscription() {
                session.dds.unsubscribe_task_done(subscription);
            }
            if let Err(e) = session.dds.shutdown() {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSShutdownSessionFailed,
                    format!("Shutdown failed: {}", e),
                );
                return false;
            }
            if session.dds.session_id().is_some() {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSShutdownSessionFailed,
                    "Failed to shut down DDS session",
                );
                return false;
            }
            info!(partition = %common.partition_id, run = common.run_nr, "DDS session has been shut down");
        } else {
            info!(
                partition = %common.partition_id, run = common.run_nr,
                "the session ID for the current DDS session is already nil, not calling shutdown"
            );
        }
        true
    }

    pub(crate) async fn submit_dds_agents(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        descriptor: &SubmissionDescriptor,
    ) -> bool {
        let mut request = AgentSubmitRequest {
            submission_tag: common.partition_id.to_string(),
            rms: descriptor.rms_plugin.clone(),
            instances: descriptor.num_agents,
            min_instances: descriptor.min_agents,
            slots: descriptor.num_slots,
            config_file: descriptor.config_file.clone(),
            env_file: descriptor.env_file.clone(),
            group_name: descriptor.agent_group.clone(),
            enable_overbooking: false,
            inline_config: String::new(),
        };

        // DDS has no ncores parameter; for Slurm it goes through an inline
        // config line, with overbooking enabled so the RMS' own per-slot cpu
        // setting does not interfere.
        if descriptor.rms_plugin == "slurm" && descriptor.num_cores > 0 {
            request.enable_overbooking = true;
            request.inline_config = format!("#SBATCH --cpus-per-task={}", descriptor.num_cores);
        }

        let sink = RequestSink::new();
        session.dds.submit_agents(&request, sink.clone());

        if !sink.wait(self.request_timeout(common)).await {
            self.fill_and_log_error(
                common,
                error,
                ErrorCode::RequestTimeout,
                "Timed out waiting for agent submission",
            );
            return false;
        }
        if let Some(msg) = sink.error() {
            self.fill_and_log_error(common, error, ErrorCode::DDSSubmitAgentsFailed, msg);
            return false;
        }
        true
    }

    pub(crate) async fn wait_for_num_active_slots(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        num_slots: u64,
    ) -> bool {
        match tokio::time::timeout(self.request_timeout(common), session.dds.wait_active_slots(num_slots)).await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::RequestTimeout,
                    format!("Timeout waiting for DDS slots: {}", e),
                );
                false
            }
            Err(_) => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::RequestTimeout,
                    "Timeout waiting for DDS slots",
                );
                false
            }
        }
    }

    /// Activate or update the topology and record the task and collection
    /// details reported back for every activated task.
    pub(crate) async fn activate_dds_topology(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        update_type: UpdateType,
    ) -> bool {
        let topo_file = match session.fields().topo_file_path.clone() {
            Some(path) => path,
            None => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSActivateTopologyFailed,
                    "No topology file set for this partition",
                );
                return false;
            }
        };

        let sink = RequestSink::new();
        session.dds.activate_topology(
            &TopologyActivateRequest { topology_file: topo_file.clone(), update_type },
            sink.clone(),
        );

        let mut success = true;
        if !sink.wait(self.request_timeout(common)).await {
            self.fill_and_log_error(
                common,
                error,
                ErrorCode::RequestTimeout,
                "Timed out waiting for topology activation",
            );
            success = false;
        } else if let Some(msg) = sink.error() {
            self.fill_and_log_error(common, error, ErrorCode::DDSActivateTopologyFailed, msg);
            success = false;
        } else {
            let events = sink.take_responses();
            let mut fields = session.fields_mut();
            for event in events {
                // stopped tasks are not interesting
                if !event.activated {
                    continue;
                }
                fields.tasks.insert(
                    event.task_id,
                    TaskDetails {
                        task_id: event.task_id,
                        collection_id: event.collection_id,
                        agent_id: event.agent_id,
                        slot_id: event.slot_id,
                        path: event.path.clone(),
                        host: event.host.clone(),
                        wrk_dir: event.wrk_dir.clone(),
                    },
                );
                if event.collection_id > 0 {
                    // the collection path is the task path's parent
                    let mut path = event.path;
                    if let Some(pos) = path.rfind('/') {
                        path.truncate(pos);
                    }
                    fields.collections.insert(
                        event.collection_id,
                        CollectionDetails {
                            collection_id: event.collection_id,
                            agent_id: event.agent_id,
                            slot_id: event.slot_id,
                            path,
                            host: event.host,
                            wrk_dir: event.wrk_dir,
                        },
                    );
                }
            }
        }

        info!(
            partition = %common.partition_id, run = common.run_nr,
            topology = %topo_file.display(), success,
            "topology activation finished"
        );
        success
    }

    pub(crate) fn create_dds_topology(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        topo_file: &Path,
    ) -> bool {
        match Topology::load(topo_file) {
            Ok(topo) => {
                session.set_topo(Arc::new(topo));
                info!(
                    partition = %common.partition_id, run = common.run_nr,
                    topology = %topo_file.display(),
                    "DDS topology created successfully"
                );
                true
            }
            Err(e) => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSCreateTopologyFailed,
                    format!("Failed to initialize DDS topology: {}", e),
                );
                false
            }
        }
    }

    /// Build the device topology over the current reader's runtime tasks.
    pub(crate) fn create_device_topology(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
    ) -> bool {
        let topo = match session.topo() {
            Some(topo) => topo,
            None => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::FairMQCreateTopologyFailed,
                    "Failed to initialize FairMQ topology: DDS topology is not initialized",
                );
                return false;
            }
        };
        let tasks: Vec<DeviceTask> = topo
            .runtime_tasks()
            .iter()
            .map(|t| DeviceTask { task_id: t.id, collection_id: t.collection_id, path: t.path.clone() })
            .collect();
        match self.backend().create_device_control(&tasks) {
            Ok(device) => {
                session.set_device(device);
                true
            }
            Err(e) => {
                session.reset_device();
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::FairMQCreateTopologyFailed,
                    format!("Failed to initialize FairMQ topology: {}", e),
                );
                false
            }
        }
    }

    pub(crate) async fn request_commander_info(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
    ) -> Option<CommanderInfo> {
        match tokio::time::timeout(self.request_timeout(common), session.dds.commander_info()).await {
            Ok(Ok(info)) => {
                debug!(
                    partition = %common.partition_id, run = common.run_nr,
                    topology = %info.active_topology_path,
                    "commander info"
                );
                Some(info)
            }
            Ok(Err(e)) => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSCommanderInfoFailed,
                    format!("Error getting DDS commander info: {}", e),
                );
                None
            }
            Err(_) => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSCommanderInfoFailed,
                    "Timed out getting DDS commander info",
                );
                None
            }
        }
    }

    pub(crate) async fn get_agent_info(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
    ) -> Result<Vec<AgentInfo>, DdsFailure> {
        tokio::time::timeout(self.request_timeout(common), session.dds.agent_info())
            .await
            .map_err(|_| DdsFailure::Other("agent info request timed out".into()))?
    }

    pub(crate) async fn get_num_slots(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
    ) -> Result<u64, DdsFailure> {
        tokio::time::timeout(self.request_timeout(common), session.dds.active_slot_count())
            .await
            .map_err(|_| DdsFailure::Other("slot count request timed out".into()))?
    }
}
