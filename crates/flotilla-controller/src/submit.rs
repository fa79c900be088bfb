use std::collections::BTreeMap;
use std::sync::Arc;

use flotilla_domain::{CommonParams, ErrorCode, RequestError, SubmissionDescriptor};
use flotilla_topology::TopologyError;
use tracing::{error, info};

use crate::controller::Controller;
use crate::session::Session;

impl Controller {
    /// The submission pipeline: plan descriptors via the resource plugin,
    /// submit each one, wait for the full slot count, tally the launched
    /// agents per group and, on any mismatch, run the post-hoc recovery.
    pub(crate) async fn submit(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        plugin: &str,
        resources: &str,
    ) {
        if !session.dds.is_running() {
            self.fill_and_log_error(
                common,
                error,
                ErrorCode::DDSSubmitAgentsFailed,
                "DDS session is not running. Use Init or Run to start the session.",
            );
            return;
        }

        let mut descriptors: Vec<SubmissionDescriptor> = Vec::new();
        if !error.is_set() {
            let zone_infos = session.fields().zone_infos.clone();
            match flotilla_plugin::make_params(
                self.resource_plugins(),
                plugin,
                resources,
                common.partition_id.as_str(),
                common.run_nr,
                &zone_infos,
                self.request_timeout(common),
            )
            .await
            {
                Ok(params) => descriptors = params,
                Err(e) => self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::ResourcePluginFailed,
                    format!("Resource plugin failed: {}", e),
                ),
            }
        }

        if !error.is_set() {
            info!(
                partition = %common.partition_id, run = common.run_nr,
                count = descriptors.len(), "preparing to submit configurations"
            );
            for (i, descriptor) in descriptors.iter().enumerate() {
                info!(
                    partition = %common.partition_id, run = common.run_nr,
                    "  [{}/{}]: {}", i + 1, descriptors.len(), descriptor
                );
            }

            for i in 0..descriptors.len() {
                // collections with an nMin floor pass it through as the
                // submission's minimum agent count
                let n_min = session
                    .fields()
                    .n_info
                    .values()
                    .find(|info| info.agent_group == descriptors[i].agent_group)
                    .map(|info| info.n_min);
                if let Some(n_min) = n_min {
                    descriptors[i].min_agents = n_min.max(0) as u32;
                }
                info!(
                    partition = %common.partition_id, run = common.run_nr,
                    "submitting [{}/{}]: {}", i + 1, descriptors.len(), descriptors[i]
                );

                if self.submit_dds_agents(common, session, error, &descriptors[i]).await {
                    let added = (descriptors[i].num_agents.max(0) as u64)
                        * descriptors[i].num_slots as u64;
                    session.fields_mut().total_slots += added;
                } else {
                    error!(partition = %common.partition_id, run = common.run_nr, "submission failed");
                    break;
                }
            }

            if !error.is_set() {
                let total_slots = session.fields().total_slots;
                info!(
                    partition = %common.partition_id, run = common.run_nr,
                    slots = total_slots, "waiting for active slots"
                );
                if self.wait_for_num_active_slots(common, session, error, total_slots).await {
                    info!(
                        partition = %common.partition_id, run = common.run_nr,
                        slots = total_slots, "done waiting for slots"
                    );
                }
            }
        }

        if session.dds.is_running() {
            // agent tally per group, seeded with every submitted group
            let mut agent_counts: BTreeMap<String, u32> =
                descriptors.iter().map(|d| (d.agent_group.clone(), 0)).collect();

            match self.get_agent_info(common, session).await {
                Ok(agents) => {
                    info!(
                        partition = %common.partition_id, run = common.run_nr,
                        count = agents.len(), "launched DDS agents"
                    );
                    let mut fields = session.fields_mut();
                    for agent in &agents {
                        *agent_counts.entry(agent.group_name.clone()).or_default() += 1;
                        fields.agent_slots.insert(agent.agent_id, agent.slots as u64);
                        info!(
                            partition = %common.partition_id, run = common.run_nr,
                            agent = agent.agent_id, host = %agent.host,
                            path = %agent.dds_path, group = %agent.group_name,
                            slots = agent.slots, idle = agent.idle_slots,
                            executing = agent.executing_slots,
                            "agent info"
                        );
                    }
                    drop(fields);
                    info!(
                        partition = %common.partition_id, run = common.run_nr,
                        groups = agent_counts.len(), "launched DDS agent groups"
                    );
                    for (group, count) in &agent_counts {
                        info!(
                            partition = %common.partition_id, run = common.run_nr,
                            group = %group, agents = count, "agent group"
                        );
                    }
                }
                Err(e) => self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSCommanderInfoFailed,
                    format!("Failed getting agent info: {}", e),
                ),
            }

            if error.is_set() {
                self.attempt_submit_recovery(common, session, error, &descriptors, &agent_counts)
                    .await;
            }
        }
    }

    /// Compare requested and actual agent counts per descriptor. Exact
    /// matches pass; shortfalls pass only when nMin allows them, in which
    /// case the bookkeeping and the topology file are rewritten to the
    /// reduced counts.
    ///
    /// The accumulator is cleared on entry: when the post-hoc check passes,
    /// the original submit-phase error is considered resolved.
    pub(crate) async fn attempt_submit_recovery(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        descriptors: &[SubmissionDescriptor],
        agent_counts: &BTreeMap<String, u32>,
    ) {
        error.clear();

        for descriptor in descriptors {
            let actual = agent_counts.get(&descriptor.agent_group).copied().unwrap_or(0);
            let requested = descriptor.num_agents.max(0) as u32;
            let min = descriptor.min_agents;

            if requested != actual {
                if min == 0 {
                    self.fill_and_log_error(
                        common,
                        error,
                        ErrorCode::DDSSubmitAgentsFailed,
                        format!(
                            "Number of agents ({}) for group {} is less than requested ({}), and no nMin is defined",
                            actual, descriptor.agent_group, requested
                        ),
                    );
                    return;
                }
                if actual < min {
                    self.fill_and_log_error(
                        common,
                        error,
                        ErrorCode::DDSSubmitAgentsFailed,
                        format!(
                            "Number of agents ({}) for group {} is less than requested ({}), and nMin ({}) is not satisfied",
                            actual, descriptor.agent_group, requested, min
                        ),
                    );
                    return;
                }
                info!(
                    partition = %common.partition_id, run = common.run_nr,
                    actual, requested, n_min = min, group = %descriptor.agent_group,
                    "number of agents is less than requested, but nMin is satisfied"
                );
            }
        }

        if !error.is_set() {
            match self.get_num_slots(common, session).await {
                Ok(total) => {
                    {
                        let mut fields = session.fields_mut();
                        fields.total_slots = total;
                        for info in fields.n_info.values_mut() {
                            if let Some(count) = agent_counts.get(&info.agent_group) {
                                info.n_current = *count as i32;
                            }
                        }
                    }
                    if let Err(e) = self.update_topology(common, session) {
                        self.fill_and_log_error(
                            common,
                            error,
                            ErrorCode::DDSCreateTopologyFailed,
                            format!("Failed updating topology: {}", e),
                        );
                    }
                }
                Err(e) => self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::DDSCreateTopologyFailed,
                    format!("Failed updating topology: {}", e),
                ),
            }
        }
    }

    /// Rewrite the current topology file for the reduced group counts; the
    /// session switches to the fresh file, the original is never modified.
    pub(crate) fn update_topology(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
    ) -> Result<(), TopologyError> {
        let (topo_file, n_info) = {
            let fields = session.fields();
            (fields.topo_file_path.clone(), fields.n_info.clone())
        };
        let topo_file = topo_file.ok_or(TopologyError::NotInitialized)?;
        info!(
            partition = %common.partition_id, run = common.run_nr,
            topology = %topo_file.display(),
            "updating topology file to reflect the reduced number of groups"
        );
        let reduced =
            flotilla_topology::reduce_groups(&topo_file, common.partition_id.as_str(), &n_info)?;
        session.fields_mut().topo_file_path = Some(reduced);
        Ok(())
    }
}
