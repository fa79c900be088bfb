#[cfg(test)]
mod tests {
    use crate::request::*;
    use crate::types::*;

    #[test]
    fn expected_states_cover_every_transition() {
        assert_eq!(TopoTransition::InitDevice.expected_state(), DeviceState::InitializingDevice);
        assert_eq!(TopoTransition::CompleteInit.expected_state(), DeviceState::Initialized);
        assert_eq!(TopoTransition::Bind.expected_state(), DeviceState::Bound);
        assert_eq!(TopoTransition::Connect.expected_state(), DeviceState::DeviceReady);
        assert_eq!(TopoTransition::InitTask.expected_state(), DeviceState::Ready);
        assert_eq!(TopoTransition::Run.expected_state(), DeviceState::Running);
        assert_eq!(TopoTransition::Stop.expected_state(), DeviceState::Ready);
        assert_eq!(TopoTransition::ResetTask.expected_state(), DeviceState::DeviceReady);
        assert_eq!(TopoTransition::ResetDevice.expected_state(), DeviceState::Idle);
        assert_eq!(TopoTransition::End.expected_state(), DeviceState::Exiting);
    }

    #[test]
    fn aggregate_uniform_states() {
        let states = vec![DeviceState::Ready, DeviceState::Ready, DeviceState::Ready];
        assert_eq!(AggregatedState::aggregate(states), AggregatedState::Ready);
    }

    #[test]
    fn aggregate_mixed_states() {
        let states = vec![DeviceState::Ready, DeviceState::Running];
        assert_eq!(AggregatedState::aggregate(states), AggregatedState::Mixed);
    }

    #[test]
    fn aggregate_empty_is_undefined() {
        assert_eq!(AggregatedState::aggregate(Vec::new()), AggregatedState::Undefined);
    }

    #[test]
    fn error_accumulator_set_and_clear() {
        let mut err = RequestError::default();
        assert!(!err.is_set());
        err.set(crate::ErrorCode::RequestTimeout, "timed out");
        assert!(err.is_set());
        assert_eq!(err.to_string(), "RequestTimeout: timed out");
        err.clear();
        assert!(!err.is_set());
    }

    #[test]
    fn descriptor_defaults_mark_agents_unset() {
        let d = SubmissionDescriptor::default();
        assert_eq!(d.num_agents, -1);
        assert_eq!(d.num_slots, 0);
        assert_eq!(d.min_agents, 0);
    }

    #[test]
    fn session_id_string_renders_nil_for_absent_session() {
        assert_eq!(session_id_string(None), "00000000-0000-0000-0000-000000000000");
        let id = uuid::Uuid::new_v4();
        assert_eq!(session_id_string(Some(id)), id.to_string());
    }

    #[test]
    fn error_code_serializes_verbatim() {
        let json = serde_json::to_string(&crate::ErrorCode::DDSSubmitAgentsFailed).unwrap();
        assert_eq!(json, "\"DDSSubmitAgentsFailed\"");
    }
}
