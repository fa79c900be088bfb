use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use flotilla_domain::{
    AggregatedState, CollectionDetails, CommonParams, DetailedState, DeviceState, ErrorCode,
    RequestError, SetPropertiesParams, TaskDetails, TopoState, TopoTransition,
};
use flotilla_driver::{DeviceControl, DeviceError};
use tracing::{debug, error, info, warn};

use crate::controller::Controller;
use crate::session::Session;

/// Non-expendable tasks that missed the expected state, with their
/// deduplicated collections. `recoverable` drops to false as soon as a failed
/// task has no collection to retire.
#[derive(Debug, Default)]
pub(crate) struct FailedTasksCollections {
    pub tasks: Vec<TaskDetails>,
    pub collections: Vec<CollectionDetails>,
    pub unrecoverable: bool,
}

impl FailedTasksCollections {
    pub fn recoverable(&self) -> bool {
        !self.unrecoverable
    }
}

impl Controller {
    /// Drive one transition and resolve failures in place where the
    /// expendable set or the nMin policy allows it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn change_state(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        transition: TopoTransition,
        path: &str,
        aggregated: &mut AggregatedState,
        detailed: &mut Option<DetailedState>,
    ) -> bool {
        let device = match session.device() {
            Some(device) => device,
            None => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::FairMQChangeStateFailed,
                    "FairMQ topology is not initialized",
                );
                return false;
            }
        };

        let expected = transition.expected_state();
        let mut success = true;

        let topo_state = match device
            .change_state(transition, path, self.request_timeout(common))
            .await
        {
            Ok(state) => state,
            Err(device_err) => {
                let failed = self.state_summary_on_failure(
                    common,
                    session,
                    device.as_ref(),
                    &device.current_state(),
                    expected,
                );
                if matches!(device_err, DeviceError::InvalidTransition { .. }) {
                    debug!(
                        partition = %common.partition_id, run = common.run_nr,
                        "invalid transition, skipping nMin check"
                    );
                    success = false;
                } else if failed.tasks.is_empty() {
                    success = true;
                } else if failed.recoverable() {
                    success = self.attempt_state_recovery(common, session, &failed).await;
                } else {
                    success = false;
                }
                if !success {
                    match device_err {
                        DeviceError::OperationTimeout => self.fill_and_log_fatal_error(
                            common,
                            error,
                            ErrorCode::RequestTimeout,
                            format!("Timed out waiting for {} transition", transition),
                        ),
                        DeviceError::InvalidTransition { .. } => self.fill_and_log_fatal_error(
                            common,
                            error,
                            ErrorCode::DeviceChangeStateInvalidTransition,
                            format!("Change state failed: {}", device_err),
                        ),
                        other => self.fill_and_log_fatal_error(
                            common,
                            error,
                            ErrorCode::FairMQChangeStateFailed,
                            format!("Change state failed: {}", other),
                        ),
                    }
                }
                device.current_state()
            }
        };

        if let Some(out) = detailed {
            *out = session.detailed_state(&topo_state);
        }
        *aggregated = aggregate_visible(&topo_state);
        if success {
            info!(
                partition = %common.partition_id, run = common.run_nr,
                state = %aggregated, transition = %transition,
                "state changed"
            );
        }
        self.print_state_stats(common, session, &topo_state);
        success
    }

    /// Same failure/recovery envelope as [`Controller::change_state`], over a
    /// wait rather than a transition.
    pub(crate) async fn wait_for_state(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        expected: DeviceState,
        path: &str,
    ) -> bool {
        let device = match session.device() {
            Some(device) => device,
            None => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::FairMQWaitForStateFailed,
                    "FairMQ topology is not initialized",
                );
                return false;
            }
        };

        info!(
            partition = %common.partition_id, run = common.run_nr,
            state = %expected, "waiting for the topology to reach state"
        );

        let mut success = true;
        if let Err(device_err) = device
            .wait_for_state(expected, path, self.request_timeout(common))
            .await
        {
            let failed = self.state_summary_on_failure(
                common,
                session,
                device.as_ref(),
                &device.current_state(),
                expected,
            );
            if failed.tasks.is_empty() {
                success = true;
            } else if failed.recoverable() {
                success = self.attempt_state_recovery(common, session, &failed).await;
            } else {
                success = false;
            }
            if !success {
                match device_err {
                    DeviceError::OperationTimeout => self.fill_and_log_error(
                        common,
                        error,
                        ErrorCode::RequestTimeout,
                        format!("Timed out waiting for {} state", expected),
                    ),
                    other => self.fill_and_log_error(
                        common,
                        error,
                        ErrorCode::FairMQWaitForStateFailed,
                        format!("Failed waiting for {} state: {}", expected, other),
                    ),
                }
            }
        }

        if success {
            info!(
                partition = %common.partition_id, run = common.run_nr,
                state = %expected, "topology reached state"
            );
        }
        success
    }

    // ── Composite transitions ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn change_state_configure(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        path: &str,
        aggregated: &mut AggregatedState,
        detailed: &mut Option<DetailedState>,
    ) -> bool {
        self.change_state(common, session, error, TopoTransition::InitDevice, path, aggregated, detailed).await
            && self.change_state(common, session, error, TopoTransition::CompleteInit, path, aggregated, detailed).await
            && self.change_state(common, session, error, TopoTransition::Bind, path, aggregated, detailed).await
            && self.change_state(common, session, error, TopoTransition::Connect, path, aggregated, detailed).await
            && self.change_state(common, session, error, TopoTransition::InitTask, path, aggregated, detailed).await
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn change_state_reset(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        path: &str,
        aggregated: &mut AggregatedState,
        detailed: &mut Option<DetailedState>,
    ) -> bool {
        self.change_state(common, session, error, TopoTransition::ResetTask, path, aggregated, detailed).await
            && self.change_state(common, session, error, TopoTransition::ResetDevice, path, aggregated, detailed).await
    }

    // ── Failure classification ────────────────────────────────────────────────

    /// Scan the current topology state for tasks off the expected state,
    /// ignore the expendable ones, and classify the rest into the failure
    /// report that drives recovery.
    pub(crate) fn state_summary_on_failure(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        device: &dyn DeviceControl,
        topo_state: &TopoState,
        expected: DeviceState,
    ) -> FailedTasksCollections {
        let mut failed = FailedTasksCollections::default();
        let mut num_failed_tasks = 0usize;

        for status in topo_state {
            if status.state == expected || status.ignored {
                continue;
            }
            num_failed_tasks += 1;
            if num_failed_tasks == 1 {
                error!(
                    partition = %common.partition_id, run = common.run_nr,
                    state = %expected, "following devices failed to transition"
                );
            }

            let details = match session.task_details(status.task_id) {
                Some(details) => details,
                None => {
                    error!(
                        partition = %common.partition_id, run = common.run_nr,
                        task = status.task_id, "no details stored for failed task"
                    );
                    failed.unrecoverable = true;
                    continue;
                }
            };
            error!(
                partition = %common.partition_id, run = common.run_nr,
                index = num_failed_tasks, task = %details,
                state = %status.state, previous_state = %status.last_state,
                subscribed = status.subscribed, ignored = status.ignored,
                "failed device"
            );

            if session.is_task_expendable(status.task_id) {
                device.ignore_failed_task(status.task_id);
                info!(
                    partition = %common.partition_id, run = common.run_nr,
                    task = status.task_id,
                    "task failed, but it is marked as expendable, ignoring its failure"
                );
                continue;
            }

            if details.collection_id == 0 {
                failed.unrecoverable = true;
                failed.tasks.push(details);
                continue;
            }
            let collection_id = details.collection_id;
            failed.tasks.push(details);
            if !failed.collections.iter().any(|c| c.collection_id == collection_id) {
                match session.collection_details(collection_id) {
                    Some(collection) => failed.collections.push(collection),
                    None => {
                        error!(
                            partition = %common.partition_id, run = common.run_nr,
                            collection = collection_id,
                            "no details stored for failed collection"
                        );
                        failed.unrecoverable = true;
                    }
                }
            }
        }

        for (i, collection) in failed.collections.iter().enumerate() {
            error!(
                partition = %common.partition_id, run = common.run_nr,
                index = i + 1, collection = %collection, state = %expected,
                "failed collection"
            );
        }

        let num_tasks = session.num_tasks();
        let num_collections = session.num_collections();
        error!(
            partition = %common.partition_id, run = common.run_nr,
            state = %expected,
            tasks_total = num_tasks,
            tasks_failed = num_failed_tasks,
            tasks_ok = num_tasks.saturating_sub(num_failed_tasks),
            collections_total = num_collections,
            collections_failed = failed.collections.len(),
            collections_ok = num_collections.saturating_sub(failed.collections.len()),
            "summary after transition failure"
        );

        failed
    }

    // ── nMin recovery ─────────────────────────────────────────────────────────

    /// Retire the failed collections when every one of them stays above its
    /// nMin floor: mark them ignored, shut down their agents and wait for the
    /// slot count to settle.
    pub(crate) async fn attempt_state_recovery(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        failed: &FailedTasksCollections,
    ) -> bool {
        if failed.collections.is_empty() || session.fields().n_info.is_empty() {
            return false;
        }

        info!(
            partition = %common.partition_id, run = common.run_nr,
            "checking if execution can continue according to the minimum number of nodes requirement"
        );

        let topo = match session.topo() {
            Some(topo) => topo,
            None => {
                error!(
                    partition = %common.partition_id, run = common.run_nr,
                    "DDS topology is not initialized, cannot resolve failed collections"
                );
                return false;
            }
        };

        // Tally failures per collection name; refuse when any failed
        // collection has no nMin entry.
        let mut failed_counts: BTreeMap<String, i32> = BTreeMap::new();
        for collection in &failed.collections {
            let name = match topo.runtime_collection_by_id(collection.collection_id) {
                Some(runtime) => runtime.name.clone(),
                None => {
                    error!(
                        partition = %common.partition_id, run = common.run_nr,
                        collection = collection.collection_id, path = %collection.path,
                        "failed collection not found in the topology"
                    );
                    return false;
                }
            };
            info!(
                partition = %common.partition_id, run = common.run_nr,
                path = %collection.path, agent = collection.agent_id, name = %name,
                "checking failed collection"
            );
            if session.fields().n_info.contains_key(&name) {
                *failed_counts.entry(name).or_insert(0) += 1;
            } else {
                error!(
                    partition = %common.partition_id, run = common.run_nr,
                    path = %collection.path,
                    "failed collection is not in a group that has the nmin parameter specified"
                );
                return false;
            }
        }

        // Proceed only while every collection keeps at least nMin replicas.
        {
            let mut fields = session.fields_mut();
            for (name, info) in fields.n_info.iter_mut() {
                let failed_count = failed_counts.get(name).copied().unwrap_or(0);
                let remaining = info.n_current - failed_count;
                info!(
                    partition = %common.partition_id, run = common.run_nr,
                    collection = %name,
                    n_original = info.n_original, n_current = info.n_current,
                    n_min = info.n_min, failed = failed_count,
                    "nMin check"
                );
                if remaining < info.n_min {
                    error!(
                        partition = %common.partition_id, run = common.run_nr,
                        collection = %name, remaining, n_min = info.n_min,
                        "number of remaining collections is below nmin"
                    );
                    return false;
                }
                info.n_current = remaining;
            }
        }

        let device = match session.device() {
            Some(device) => device,
            None => return false,
        };
        let collection_ids: Vec<u64> = failed.collections.iter().map(|c| c.collection_id).collect();
        device.ignore_failed_collections(&collection_ids);

        // Shut down the agents that hosted the failed collections and wait
        // for the slot count to drop accordingly.
        let (total_slots, slots_to_remove) = {
            let fields = session.fields();
            let mut to_remove = 0u64;
            for collection in &failed.collections {
                match fields.agent_slots.get(&collection.agent_id) {
                    Some(slots) => to_remove += slots,
                    None => {
                        error!(
                            partition = %common.partition_id, run = common.run_nr,
                            agent = collection.agent_id,
                            "no slot count recorded for agent of failed collection"
                        );
                        return false;
                    }
                }
            }
            (fields.total_slots, to_remove)
        };
        let expected_slots = total_slots.saturating_sub(slots_to_remove);
        info!(
            partition = %common.partition_id, run = common.run_nr,
            current = total_slots, expected = expected_slots,
            "reducing the number of slots"
        );

        for collection in &failed.collections {
            info!(
                partition = %common.partition_id, run = common.run_nr,
                agent = collection.agent_id, path = %collection.path,
                "sending shutdown signal to agent"
            );
            let shutdown = tokio::time::timeout(
                self.request_timeout(common),
                session.dds.shutdown_agent(collection.agent_id),
            )
            .await;
            match shutdown {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    partition = %common.partition_id, run = common.run_nr,
                    agent = collection.agent_id, error = %e, "agent shutdown failed"
                ),
                Err(_) => warn!(
                    partition = %common.partition_id, run = common.run_nr,
                    agent = collection.agent_id, "agent shutdown timed out"
                ),
            }
        }

        let deadline = tokio::time::Instant::now() + self.request_timeout(common);
        let mut current_slots = match self.get_num_slots(common, session).await {
            Ok(n) => n,
            Err(e) => {
                error!(
                    partition = %common.partition_id, run = common.run_nr,
                    error = %e, "failed updating number of slots"
                );
                return false;
            }
        };
        while current_slots != expected_slots && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            current_slots = match self.get_num_slots(common, session).await {
                Ok(n) => n,
                Err(e) => {
                    error!(
                        partition = %common.partition_id, run = common.run_nr,
                        error = %e, "failed updating number of slots"
                    );
                    return false;
                }
            };
        }
        if current_slots != expected_slots {
            warn!(
                partition = %common.partition_id, run = common.run_nr,
                expected = expected_slots, current = current_slots,
                "could not reduce the number of slots"
            );
        } else {
            info!(
                partition = %common.partition_id, run = common.run_nr,
                slots = current_slots, "successfully reduced number of slots"
            );
        }
        session.fields_mut().total_slots = current_slots;

        true
    }

    // ── Get state / set properties ────────────────────────────────────────────

    pub(crate) fn get_state(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        path: &str,
        aggregated: &mut AggregatedState,
        detailed: &mut Option<DetailedState>,
    ) -> bool {
        let device = match session.device() {
            Some(device) => device,
            None => {
                error.set(ErrorCode::FairMQGetStateFailed, "FairMQ topology is not initialized");
                return false;
            }
        };

        let topo_state = device.current_state();
        let mut success = true;
        match flotilla_topology::aggregate_state_for_path(
            session.topo().as_deref(),
            &topo_state,
            path,
        ) {
            Ok(state) => *aggregated = state,
            Err(e) => {
                success = false;
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::FairMQGetStateFailed,
                    format!("Get state failed: {}", e),
                );
            }
        }
        if let Some(out) = detailed {
            *out = session.detailed_state(&topo_state);
        }
        self.print_state_stats(common, session, &topo_state);
        success
    }

    pub(crate) async fn set_properties(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        error: &mut RequestError,
        params: &SetPropertiesParams,
        aggregated: &mut AggregatedState,
    ) -> bool {
        let device = match session.device() {
            Some(device) => device,
            None => {
                self.fill_and_log_error(
                    common,
                    error,
                    ErrorCode::FairMQSetPropertiesFailed,
                    "FairMQ topology is not initialized",
                );
                return false;
            }
        };

        let mut success = true;
        match device
            .set_properties(&params.properties, &params.path, self.request_timeout(common))
            .await
        {
            Ok(()) => {
                info!(
                    partition = %common.partition_id, run = common.run_nr,
                    "set property finished successfully"
                );
            }
            Err(failure) => {
                let mut failed = FailedTasksCollections::default();
                error!(
                    partition = %common.partition_id, run = common.run_nr,
                    count = failure.failed_devices.len(),
                    "following devices failed to set properties"
                );
                for (i, task_id) in failure.failed_devices.iter().enumerate() {
                    let details = match session.task_details(*task_id) {
                        Some(details) => details,
                        None => {
                            error!(
                                partition = %common.partition_id, run = common.run_nr,
                                task = task_id, "no details stored for failed task"
                            );
                            failed.unrecoverable = true;
                            continue;
                        }
                    };
                    error!(
                        partition = %common.partition_id, run = common.run_nr,
                        index = i + 1, task = %details, "failed device"
                    );
                    if session.is_task_expendable(*task_id) {
                        device.ignore_failed_task(*task_id);
                        info!(
                            partition = %common.partition_id, run = common.run_nr,
                            task = task_id,
                            "task failed, but it is marked as expendable, ignoring its failure"
                        );
                        continue;
                    }
                    if details.collection_id == 0 {
                        failed.unrecoverable = true;
                        failed.tasks.push(details);
                        continue;
                    }
                    let collection_id = details.collection_id;
                    failed.tasks.push(details);
                    if !failed.collections.iter().any(|c| c.collection_id == collection_id) {
                        match session.collection_details(collection_id) {
                            Some(collection) => failed.collections.push(collection),
                            None => failed.unrecoverable = true,
                        }
                    }
                }

                if failed.tasks.is_empty() {
                    success = true;
                } else if failed.recoverable() {
                    success = self.attempt_state_recovery(common, session, &failed).await;
                } else {
                    success = false;
                }
                if !success {
                    match failure.error {
                        DeviceError::OperationTimeout => self.fill_and_log_error(
                            common,
                            error,
                            ErrorCode::RequestTimeout,
                            "Timed out waiting for set property",
                        ),
                        other => self.fill_and_log_error(
                            common,
                            error,
                            ErrorCode::FairMQSetPropertiesFailed,
                            format!("Set property error: {}", other),
                        ),
                    }
                }
            }
        }

        *aggregated = aggregate_visible(&device.current_state());
        success
    }

    // ── State statistics ──────────────────────────────────────────────────────

    /// Log per-state task counts and per-aggregated-state collection counts.
    pub(crate) fn print_state_stats(
        &self,
        common: &CommonParams,
        session: &Arc<Session>,
        topo_state: &TopoState,
    ) {
        let mut task_counts: BTreeMap<DeviceState, u64> = BTreeMap::new();
        for status in topo_state {
            *task_counts.entry(status.state).or_default() += 1;
        }
        let task_stats: Vec<String> = task_counts
            .iter()
            .map(|(state, count)| format!("{} ({}/{})", state, count, topo_state.len()))
            .collect();
        info!(
            partition = %common.partition_id, run = common.run_nr,
            "task states: {}", task_stats.join(" ")
        );

        let mut by_collection: BTreeMap<u64, Vec<DeviceState>> = BTreeMap::new();
        {
            let fields = session.fields();
            for status in topo_state {
                if let Some(details) = fields.tasks.get(&status.task_id) {
                    if details.collection_id != 0 {
                        by_collection.entry(details.collection_id).or_default().push(status.state);
                    }
                }
            }
        }
        let num_collections = by_collection.len();
        let mut collection_counts: BTreeMap<AggregatedState, u64> = BTreeMap::new();
        for states in by_collection.into_values() {
            *collection_counts.entry(AggregatedState::aggregate(states)).or_default() += 1;
        }
        let collection_stats: Vec<String> = collection_counts
            .iter()
            .map(|(state, count)| format!("{} ({}/{})", state, count, num_collections))
            .collect();
        info!(
            partition = %common.partition_id, run = common.run_nr,
            "collection states: {}", collection_stats.join(" ")
        );
    }
}

/// Aggregate over the non-ignored tasks of a snapshot.
pub(crate) fn aggregate_visible(topo_state: &TopoState) -> AggregatedState {
    AggregatedState::aggregate(topo_state.iter().filter(|s| !s.ignored).map(|s| s.state))
}
