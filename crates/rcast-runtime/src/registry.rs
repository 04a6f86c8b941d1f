use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use rcast_model::{Confirm, Event, NodeId, SetId};

use crate::queue::MessageQueue;

/// Lifecycle of the worker task attached to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// No worker task exists for this node.
    None,
    Running,
    /// The worker has exited; the node handle survives for inspection.
    Done,
}

#[derive(Debug)]
struct NodeState {
    active: bool,
    comment: String,
    /// Connection string of the path leading to this node, if one is stored.
    pa_conninfo: Option<String>,
    /// Seconds to wait before re-dialling after a failed connect.
    pa_connretry: u64,
    worker: WorkerStatus,
}

/// One known replication node plus the message queue its worker consumes.
pub struct NodeHandle {
    pub no_id: NodeId,
    pub queue: MessageQueue,
    state: Mutex<NodeState>,
}

impl NodeHandle {
    fn new(no_id: NodeId, comment: &str) -> Self {
        Self {
            no_id,
            queue: MessageQueue::new(),
            state: Mutex::new(NodeState {
                active: false,
                comment: comment.to_string(),
                pa_conninfo: None,
                pa_connretry: 10,
                worker: WorkerStatus::None,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().expect("node state poisoned").active
    }

    pub fn pa_conninfo(&self) -> Option<String> {
        self.state.lock().expect("node state poisoned").pa_conninfo.clone()
    }

    pub fn pa_connretry(&self) -> u64 {
        self.state.lock().expect("node state poisoned").pa_connretry
    }

    pub fn worker_status(&self) -> WorkerStatus {
        self.state.lock().expect("node state poisoned").worker
    }

    pub fn set_worker_status(&self, status: WorkerStatus) {
        self.state.lock().expect("node state poisoned").worker = status;
    }

    fn set_active(&self, active: bool) {
        self.state.lock().expect("node state poisoned").active = active;
    }

    fn set_path(&self, conninfo: &str, connretry: u64) {
        let mut st = self.state.lock().expect("node state poisoned");
        st.pa_conninfo = Some(conninfo.to_string());
        st.pa_connretry = connretry;
    }
}

/// One replication set together with this node's subscription to it, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRow {
    pub set_id: SetId,
    pub origin: NodeId,
    pub comment: String,
    pub sub_provider: Option<NodeId>,
    pub sub_forward: bool,
    pub sub_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenRow {
    li_origin: NodeId,
    li_provider: NodeId,
}

#[derive(Default)]
struct Inner {
    generation: u64,
    nodes: HashMap<NodeId, Arc<NodeHandle>>,
    sets: Vec<SetRow>,
    listens: Vec<ListenRow>,
}

/// The in-process view of the cluster configuration.
///
/// Workers replay configuration events into it; listeners use the
/// `enqueue_*` methods to hand messages to workers. Every mutation bumps
/// the generation counter, which workers compare against their own copy to
/// decide when to reconcile providers.
pub struct Registry {
    node_id: NodeId,
    cluster_name: String,
    namespace: String,
    conninfo: String,
    inner: Mutex<Inner>,
}

impl Registry {
    /// `conninfo` is the connection string of this node's own database.
    pub fn new(node_id: NodeId, cluster_name: &str, conninfo: &str) -> Self {
        Self {
            node_id,
            cluster_name: cluster_name.to_string(),
            namespace: format!("\"_{}\"", cluster_name),
            conninfo: conninfo.to_string(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Schema qualifier of the replication catalog, already quoted for
    /// splicing into SQL (`"_<cluster>"`).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn local_conninfo(&self) -> &str {
        &self.conninfo
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().expect("registry poisoned").generation
    }

    pub fn find_node(&self, no_id: NodeId) -> Option<Arc<NodeHandle>> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .nodes
            .get(&no_id)
            .cloned()
    }

    /// Snapshot of every set row. Workers filter this for their reconcile.
    pub fn replicated_sets(&self) -> Vec<SetRow> {
        self.inner.lock().expect("registry poisoned").sets.clone()
    }

    // ------------------------------------------------------------------
    // Configuration mutations (the worker replays these from events)
    // ------------------------------------------------------------------

    pub fn store_node(&self, no_id: NodeId, comment: &str) -> Arc<NodeHandle> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.generation += 1;
        inner
            .nodes
            .entry(no_id)
            .or_insert_with(|| Arc::new(NodeHandle::new(no_id, comment)))
            .clone()
    }

    pub fn enable_node(&self, no_id: NodeId) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.generation += 1;
        match inner.nodes.get(&no_id) {
            Some(node) => node.set_active(true),
            None => warn!(no_id, "enable_node: unknown node"),
        }
    }

    /// Store the connection path from this node to `server`.
    pub fn store_path(&self, server: NodeId, conninfo: &str, connretry: u64) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.generation += 1;
        match inner.nodes.get(&server) {
            Some(node) => node.set_path(conninfo, connretry),
            None => warn!(server, "store_path: unknown server node"),
        }
    }

    pub fn store_listen(&self, li_origin: NodeId, li_provider: NodeId) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.generation += 1;
        let row = ListenRow { li_origin, li_provider };
        if !inner.listens.contains(&row) {
            inner.listens.push(row);
        }
    }

    pub fn store_set(&self, set_id: SetId, origin: NodeId, comment: &str) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.generation += 1;
        if inner.sets.iter().any(|s| s.set_id == set_id) {
            return;
        }
        inner.sets.push(SetRow {
            set_id,
            origin,
            comment: comment.to_string(),
            sub_provider: None,
            sub_forward: false,
            sub_active: false,
        });
    }

    /// Record a subscription of this node to `set_id` via `provider`. The
    /// subscription stays inactive until the provider-side enable event
    /// arrives and the initial copy succeeds.
    pub fn store_subscribe(&self, set_id: SetId, provider: NodeId, forward: bool) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.generation += 1;
        match inner.sets.iter_mut().find(|s| s.set_id == set_id) {
            Some(set) => {
                set.sub_provider = Some(provider);
                set.sub_forward = forward;
                set.sub_active = false;
            }
            None => warn!(set_id, "store_subscribe: unknown set"),
        }
    }

    pub fn enable_subscription(&self, set_id: SetId, provider: NodeId, forward: bool) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.generation += 1;
        match inner.sets.iter_mut().find(|s| s.set_id == set_id) {
            Some(set) => {
                set.sub_provider = Some(provider);
                set.sub_forward = forward;
                set.sub_active = true;
            }
            None => warn!(set_id, "enable_subscription: unknown set"),
        }
    }

    // ------------------------------------------------------------------
    // Listener-facing enqueue API
    // ------------------------------------------------------------------

    /// Hand an event to the worker for its origin. Silently drops events
    /// from unknown or inactive origins and duplicates.
    pub fn enqueue_event(&self, event: Event) {
        let Some(node) = self.find_node(event.origin) else {
            warn!(
                origin = event.origin,
                seqno = event.seqno,
                "event ignored - unknown origin"
            );
            return;
        };
        if !node.is_active() {
            warn!(
                origin = event.origin,
                seqno = event.seqno,
                "event ignored - origin inactive"
            );
            return;
        }
        node.queue.push_event(event);
    }

    /// Wake the worker for `no_id` so it re-reads the configuration.
    /// A node never wakes itself; there is no remote worker for it.
    pub fn enqueue_wakeup(&self, no_id: NodeId) {
        if no_id == self.node_id {
            return;
        }
        let Some(node) = self.find_node(no_id) else {
            debug!(no_id, "wakeup ignored - unknown node");
            return;
        };
        if node.worker_status() == WorkerStatus::None {
            warn!(no_id, "wakeup ignored - no worker task");
            return;
        }
        node.queue.push_wakeup();
    }

    /// Hand a confirmation to the worker for `no_id` to forward.
    pub fn enqueue_confirm(&self, no_id: NodeId, confirm: Confirm) {
        let Some(node) = self.find_node(no_id) else {
            warn!(no_id, "confirm ignored - unknown node");
            return;
        };
        if node.worker_status() == WorkerStatus::None {
            warn!(no_id, "confirm ignored - no worker task");
            return;
        }
        node.queue.push_confirm(confirm);
    }
}
