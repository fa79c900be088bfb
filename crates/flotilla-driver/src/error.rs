use flotilla_domain::{DeviceState, TopoTransition};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DdsFailure {
    #[error("DDS session is not running")]
    NotRunning,

    #[error("no such DDS session: {0}")]
    UnknownSession(Uuid),

    #[error("agent {0} not found")]
    UnknownAgent(u64),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("operation timed out")]
    OperationTimeout,

    #[error("invalid transition {transition} from the current state")]
    InvalidTransition { transition: TopoTransition },

    #[error("{failed} device(s) failed to reach {expected} state")]
    FailedDevices { failed: usize, expected: DeviceState },

    #[error("failed to build device topology: {0}")]
    CreateFailed(String),
}

/// Partial-failure report of a property update: the device error plus the
/// task ids that did not apply the properties.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SetPropertiesFailure {
    pub error: DeviceError,
    pub failed_devices: Vec<u64>,
}
