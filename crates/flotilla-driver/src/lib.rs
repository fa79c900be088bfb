pub mod dds;
pub mod device;
pub mod error;
pub mod local;
pub mod request;

pub use dds::{
    ActivationEvent, AgentInfo, AgentSubmitRequest, CommanderInfo, DdsClient, TaskDoneCallback,
    TaskDoneEvent, TopologyActivateRequest, UpdateType,
};
pub use device::{ClusterBackend, DeviceControl, DeviceTask};
pub use error::{DdsFailure, DeviceError, SetPropertiesFailure};
pub use local::{LocalBackend, LocalCluster, LocalDds, LocalDeviceControl};
pub use request::{RequestSink, Severity};
