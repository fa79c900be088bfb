use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use flotilla_domain::{
    CollectionDetails, CollectionNInfo, DetailedState, DetailedTaskStatus, PartitionId,
    TaskDetails, TopoState, ZoneGroup,
};
use flotilla_driver::{DdsClient, DeviceControl};
use flotilla_topology::Topology;

/// Mutable per-partition bookkeeping. Only the request handler that currently
/// owns the partition mutates these; acquisitions stay brief and never span a
/// suspension point.
#[derive(Default)]
pub struct SessionFields {
    pub topo_file_path: Option<PathBuf>,
    pub n_info: BTreeMap<String, CollectionNInfo>,
    pub zone_infos: BTreeMap<String, Vec<ZoneGroup>>,
    pub tasks: HashMap<u64, TaskDetails>,
    pub collections: HashMap<u64, CollectionDetails>,
    pub expendable: HashSet<u64>,
    pub agent_slots: HashMap<u64, u64>,
    pub total_slots: u64,
}

/// The per-partition aggregate: DDS client, topology reader, device topology
/// and the submission/recovery bookkeeping.
pub struct Session {
    pub partition_id: PartitionId,
    pub dds: Arc<dyn DdsClient>,
    device: RwLock<Option<Arc<dyn DeviceControl>>>,
    topo: RwLock<Option<Arc<Topology>>>,
    fields: RwLock<SessionFields>,
    /// Last observed run number; set by Start, cleared by Stop. Shared with
    /// the task-done subscription for log context.
    pub last_run_nr: Arc<AtomicU64>,
    run_attempted: AtomicBool,
    task_done_subscription: Mutex<Option<u64>>,
}

impl Session {
    pub fn new(partition_id: PartitionId, dds: Arc<dyn DdsClient>) -> Self {
        Session {
            partition_id,
            dds,
            device: RwLock::new(None),
            topo: RwLock::new(None),
            fields: RwLock::new(SessionFields::default()),
            last_run_nr: Arc::new(AtomicU64::new(0)),
            run_attempted: AtomicBool::new(false),
            task_done_subscription: Mutex::new(None),
        }
    }

    // ── Handles ───────────────────────────────────────────────────────────────

    pub fn device(&self) -> Option<Arc<dyn DeviceControl>> {
        self.device.read().unwrap().clone()
    }

    pub fn set_device(&self, device: Arc<dyn DeviceControl>) {
        *self.device.write().unwrap() = Some(device);
    }

    pub fn reset_device(&self) {
        *self.device.write().unwrap() = None;
    }

    pub fn topo(&self) -> Option<Arc<Topology>> {
        self.topo.read().unwrap().clone()
    }

    pub fn set_topo(&self, topo: Arc<Topology>) {
        *self.topo.write().unwrap() = Some(topo);
    }

    pub fn reset_topo(&self) {
        *self.topo.write().unwrap() = None;
    }

    // ── Fields ────────────────────────────────────────────────────────────────

    pub fn fields(&self) -> RwLockReadGuard<'_, SessionFields> {
        self.fields.read().unwrap()
    }

    pub fn fields_mut(&self) -> RwLockWriteGuard<'_, SessionFields> {
        self.fields.write().unwrap()
    }

    pub fn task_details(&self, task_id: u64) -> Option<TaskDetails> {
        self.fields().tasks.get(&task_id).cloned()
    }

    pub fn collection_details(&self, collection_id: u64) -> Option<CollectionDetails> {
        self.fields().collections.get(&collection_id).cloned()
    }

    pub fn is_task_expendable(&self, task_id: u64) -> bool {
        self.fields().expendable.contains(&task_id)
    }

    pub fn num_tasks(&self) -> usize {
        self.fields().tasks.len()
    }

    pub fn num_collections(&self) -> usize {
        self.fields().collections.len()
    }

    // ── One-shot run flag ─────────────────────────────────────────────────────

    /// Returns `true` when a Run was already attempted on this session.
    pub fn mark_run_attempted(&self) -> bool {
        self.run_attempted.swap(true, Ordering::SeqCst)
    }

    // ── Task-done subscription ────────────────────────────────────────────────

    pub fn store_subscription(&self, subscription: u64) {
        *self.task_done_subscription.lock().unwrap() = Some(subscription);
    }

    pub fn take_subscription(&self) -> Option<u64> {
        self.task_done_subscription.lock().unwrap().take()
    }

    // ── Detailed state ────────────────────────────────────────────────────────

    /// Join a state snapshot with the stored task details.
    pub fn detailed_state(&self, topo_state: &TopoState) -> DetailedState {
        let fields = self.fields();
        topo_state
            .iter()
            .filter_map(|status| {
                fields.tasks.get(&status.task_id).map(|task| DetailedTaskStatus {
                    state: status.state,
                    task: task.clone(),
                })
            })
            .collect()
    }
}

/// Process-wide `partition id → Session` map behind one mutex. Verbs acquire
/// it briefly to fetch the `Arc<Session>`; Status and restore-manifest writes
/// iterate under it.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<PartitionId, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        partition_id: &PartitionId,
        make_client: impl FnOnce() -> Arc<dyn DdsClient>,
    ) -> Arc<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(partition_id.clone())
            .or_insert_with(|| Arc::new(Session::new(partition_id.clone(), make_client())))
            .clone()
    }

    pub fn remove(&self, partition_id: &PartitionId) -> bool {
        self.sessions.lock().unwrap().remove(partition_id).is_some()
    }

    /// Run `f` for every session while holding the store mutex.
    pub fn with_sessions<T>(&self, f: impl FnOnce(&mut dyn Iterator<Item = &Arc<Session>>) -> T) -> T {
        let sessions = self.sessions.lock().unwrap();
        let mut iter = sessions.values();
        f(&mut iter)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_driver::{LocalCluster, LocalDds};

    fn new_session(store: &SessionStore, id: &str, cluster: &LocalCluster) -> Arc<Session> {
        let cluster = cluster.clone();
        store.get_or_create(&PartitionId::new(id), move || Arc::new(LocalDds::new(cluster)))
    }

    #[test]
    fn get_or_create_returns_the_same_session() {
        let store = SessionStore::new();
        let cluster = LocalCluster::new();
        let a = new_session(&store, "pt", &cluster);
        let b = new_session(&store, "pt", &cluster);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let store = SessionStore::new();
        let cluster = LocalCluster::new();
        new_session(&store, "pt", &cluster);
        assert!(store.remove(&PartitionId::new("pt")));
        assert!(!store.remove(&PartitionId::new("pt")));
        assert!(store.is_empty());
    }

    #[test]
    fn run_flag_fires_once() {
        let store = SessionStore::new();
        let cluster = LocalCluster::new();
        let session = new_session(&store, "pt", &cluster);
        assert!(!session.mark_run_attempted());
        assert!(session.mark_run_attempted());
    }

    #[test]
    fn subscription_is_taken_once() {
        let store = SessionStore::new();
        let cluster = LocalCluster::new();
        let session = new_session(&store, "pt", &cluster);
        session.store_subscription(7);
        assert_eq!(session.take_subscription(), Some(7));
        assert_eq!(session.take_subscription(), None);
    }
}
