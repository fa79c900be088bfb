pub mod error;
pub mod request;
pub mod types;

mod tests;

pub use error::ErrorCode;
pub use request::{
    ActivateParams, CommonParams, DdsSessionStatus, DetailedState, DetailedTaskStatus,
    DeviceParams, InitializeParams, PartitionStatus, RequestError, RequestResult, RequestStatus,
    RunParams, SetPropertiesParams, StatusParams, StatusRequestResult, SubmitParams, UpdateParams,
};
pub use types::{
    AggregatedState, CollectionDetails, CollectionNInfo, DeviceState, PartitionId,
    SubmissionDescriptor, TaskDetails, TaskStatus, TopoState, TopoTransition, ZoneGroup,
};
