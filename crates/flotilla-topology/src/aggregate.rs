use flotilla_domain::{AggregatedState, TopoState};

use crate::error::TopologyError;
use crate::model::Topology;

/// Aggregate the runtime state over a topology path.
///
/// An empty path aggregates every non-ignored task. A path resolving to a
/// single task returns that task's state. Otherwise all tasks under the path
/// must share one state, which is returned; a non-uniform set is `Mixed`.
pub fn aggregate_state_for_path(
    topo: Option<&Topology>,
    state: &TopoState,
    path: &str,
) -> Result<AggregatedState, TopologyError> {
    if path.is_empty() {
        return Ok(AggregatedState::aggregate(
            state.iter().filter(|s| !s.ignored).map(|s| s.state),
        ));
    }

    let topo = topo.ok_or(TopologyError::NotInitialized)?;

    if let Some(task) = topo.runtime_task_by_path(path) {
        if let Some(status) = state.iter().find(|s| s.task_id == task.id) {
            return Ok(AggregatedState::from(status.state));
        }
    }

    let matched = topo.runtime_tasks_matching(path);
    if matched.is_empty() {
        return Err(TopologyError::NoTasksMatching(path.to_string()));
    }

    let ids: std::collections::HashSet<u64> = matched.iter().map(|t| t.id).collect();
    let mut states = state
        .iter()
        .filter(|s| ids.contains(&s.task_id) && !s.ignored)
        .map(|s| s.state);

    let first = states.next().ok_or_else(|| TopologyError::NoStates(path.to_string()))?;
    if states.all(|s| s == first) {
        Ok(AggregatedState::from(first))
    } else {
        Ok(AggregatedState::Mixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topology;
    use flotilla_domain::{DeviceState, TaskStatus};

    const TOPO: &str = r#"
<topology name="t">
    <decltask name="w"><exe>/bin/w</exe></decltask>
    <declcollection name="C"><tasks><name>w</name></tasks></declcollection>
    <main name="main">
        <task name="w"/>
        <group name="g" n="2"><collection name="C"/></group>
    </main>
</topology>
"#;

    fn status(id: u64, state: DeviceState) -> TaskStatus {
        TaskStatus { task_id: id, state, last_state: DeviceState::Undefined, subscribed: true, ignored: false }
    }

    fn uniform_state(topo: &Topology, state: DeviceState) -> TopoState {
        topo.runtime_tasks().iter().map(|t| status(t.id, state)).collect()
    }

    #[test]
    fn empty_path_over_uniform_states() {
        let topo = Topology::from_str(TOPO).unwrap();
        let state = uniform_state(&topo, DeviceState::Idle);
        let agg = aggregate_state_for_path(Some(&topo), &state, "").unwrap();
        assert_eq!(agg, AggregatedState::Idle);
    }

    #[test]
    fn empty_path_over_mixed_states() {
        let topo = Topology::from_str(TOPO).unwrap();
        let mut state = uniform_state(&topo, DeviceState::Idle);
        state[0].state = DeviceState::Ready;
        let agg = aggregate_state_for_path(Some(&topo), &state, "").unwrap();
        assert_eq!(agg, AggregatedState::Mixed);
    }

    #[test]
    fn ignored_tasks_are_hidden_from_aggregation() {
        let topo = Topology::from_str(TOPO).unwrap();
        let mut state = uniform_state(&topo, DeviceState::Ready);
        state[0].state = DeviceState::Idle;
        state[0].ignored = true;
        let agg = aggregate_state_for_path(Some(&topo), &state, "").unwrap();
        assert_eq!(agg, AggregatedState::Ready);
    }

    #[test]
    fn single_task_path_returns_its_state() {
        let topo = Topology::from_str(TOPO).unwrap();
        let mut state = uniform_state(&topo, DeviceState::Idle);
        let sampler = topo.runtime_task_by_path("main/w").unwrap();
        state.iter_mut().find(|s| s.task_id == sampler.id).unwrap().state = DeviceState::Running;
        let agg = aggregate_state_for_path(Some(&topo), &state, "main/w").unwrap();
        assert_eq!(agg, AggregatedState::Running);
    }

    #[test]
    fn subtree_path_aggregates_matched_tasks() {
        let topo = Topology::from_str(TOPO).unwrap();
        let state = uniform_state(&topo, DeviceState::DeviceReady);
        let agg = aggregate_state_for_path(Some(&topo), &state, "main/g_0").unwrap();
        assert_eq!(agg, AggregatedState::DeviceReady);
    }

    #[test]
    fn unmatched_path_is_an_error() {
        let topo = Topology::from_str(TOPO).unwrap();
        let state = uniform_state(&topo, DeviceState::Idle);
        assert!(matches!(
            aggregate_state_for_path(Some(&topo), &state, "main/nosuch"),
            Err(TopologyError::NoTasksMatching(_))
        ));
    }

    #[test]
    fn missing_reader_is_an_error_for_nonempty_paths() {
        assert!(matches!(
            aggregate_state_for_path(None, &Vec::new(), "main/w"),
            Err(TopologyError::NotInitialized)
        ));
    }
}
