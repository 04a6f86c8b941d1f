//! Per-provider runtime state and the worker/helper handshake.

use std::sync::Arc;

use sqlx::postgres::PgConnection;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;

use rcast_model::{NodeId, SetId};

/// Helper lifecycle. `Exit` is honored only from `Idle`; the worker owns
/// every other transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperStatus {
    /// Waiting to be dispatched for a SYNC.
    Idle,
    /// Dispatched: reading the provider's log cursor.
    Busy,
    /// Finished this SYNC (cleanly or not); waiting to be reset to idle.
    Done,
    /// Terminate the task.
    Exit,
}

/// State a helper and its worker exchange under the helper lock. The
/// provider connection lives here so that the worker can dial it while the
/// helper is idle, and the helper owns it exclusively while busy.
pub struct HelperState {
    pub status: HelperStatus,
    /// WHERE clause for the next log cursor, set by the worker at dispatch.
    pub qualification: String,
    pub conn: Option<PgConnection>,
}

/// Cloneable handle to one helper's lock and condition.
#[derive(Clone)]
pub struct HelperHandle {
    state: Arc<Mutex<HelperState>>,
    cond: Arc<Notify>,
}

impl HelperHandle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HelperState {
                status: HelperStatus::Idle,
                qualification: String::new(),
                conn: None,
            })),
            cond: Arc::new(Notify::new()),
        }
    }

    /// Acquire the helper lock. Reconcile holds the returned guard across
    /// its whole provider transition so the helper never observes a
    /// half-rebuilt workgroup.
    pub async fn lock_owned(&self) -> OwnedMutexGuard<HelperState> {
        self.state.clone().lock_owned().await
    }

    pub fn signal(&self) {
        self.cond.notify_one();
    }

    /// Wait until `leave` no longer matches the status, then return the
    /// observed status. The lock is not held while waiting.
    pub async fn wait_while(&self, leave: HelperStatus) -> HelperStatus {
        loop {
            let notified = self.cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let st = self.state.lock().await;
                if st.status != leave {
                    return st.status;
                }
            }
            notified.await;
        }
    }

    /// Set the status and wake the helper (or the worker) waiting on it.
    pub async fn set_status(&self, status: HelperStatus) {
        self.state.lock().await.status = status;
        self.signal();
    }
}

impl Default for HelperHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One replicated set served by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSet {
    pub set_id: SetId,
    pub sub_forward: bool,
}

/// Runtime state for one data provider feeding this worker: its dial
/// information, the sets it currently serves, and its helper task. Exists
/// only while at least one active subscription names the provider.
pub struct ProviderContext {
    pub no_id: NodeId,
    pub pa_conninfo: Option<String>,
    /// Seconds to wait before re-dialling after a failed connect.
    pub pa_connretry: u64,
    pub sets: Vec<ProviderSet>,
    pub handle: HelperHandle,
    pub task: JoinHandle<()>,
}
