use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flotilla_domain::{DeviceState, TopoState, TopoTransition};

use crate::error::{DeviceError, SetPropertiesFailure};

/// One task handed to the device topology at construction time.
#[derive(Debug, Clone)]
pub struct DeviceTask {
    pub task_id: u64,
    /// 0 for tasks outside any collection.
    pub collection_id: u64,
    pub path: String,
}

/// Contract of the device topology layer: ordered state transitions over the
/// running tasks of one partition, plus the ignore list that hides expendable
/// and recovered-away tasks from aggregation and further transitions.
#[async_trait]
pub trait DeviceControl: Send + Sync + 'static {
    /// Issue one transition to every non-ignored task under `path` (empty
    /// path: all tasks). Returns the post-transition state snapshot on
    /// success.
    async fn change_state(
        &self,
        transition: TopoTransition,
        path: &str,
        timeout: Duration,
    ) -> Result<TopoState, DeviceError>;

    /// Wait until every non-ignored task under `path` reports `expected`.
    async fn wait_for_state(
        &self,
        expected: DeviceState,
        path: &str,
        timeout: Duration,
    ) -> Result<(), DeviceError>;

    async fn set_properties(
        &self,
        properties: &[(String, String)],
        path: &str,
        timeout: Duration,
    ) -> Result<(), SetPropertiesFailure>;

    fn current_state(&self) -> TopoState;

    fn ignore_failed_task(&self, task_id: u64);

    fn ignore_failed_collections(&self, collection_ids: &[u64]);
}

/// Factory over the two external collaborators. Implementations wire a
/// concrete cluster (or the local simulation) into the controller.
pub trait ClusterBackend: Send + Sync + 'static {
    fn create_client(&self) -> Arc<dyn crate::dds::DdsClient>;

    fn create_device_control(
        &self,
        tasks: &[DeviceTask],
    ) -> Result<Arc<dyn DeviceControl>, DeviceError>;
}
