use serde::{Deserialize, Serialize};

/// Stable error codes carried by [`RequestError`](crate::request::RequestError).
///
/// The names are part of the request contract; variant names serialize
/// verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Request lifecycle
    RequestNotSupported,
    RequestTimeout,

    // DDS
    DDSCreateSessionFailed,
    DDSAttachToSessionFailed,
    DDSCommanderInfoFailed,
    DDSSubmitAgentsFailed,
    DDSActivateTopologyFailed,
    DDSCreateTopologyFailed,
    DDSSubscribeToSessionFailed,
    DDSShutdownSessionFailed,

    // Device topology
    FairMQCreateTopologyFailed,
    FairMQChangeStateFailed,
    FairMQWaitForStateFailed,
    FairMQGetStateFailed,
    FairMQSetPropertiesFailed,
    DeviceChangeStateInvalidTransition,

    // Orchestration
    TopologyFailed,
    ResourcePluginFailed,
    OperationTimeout,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
