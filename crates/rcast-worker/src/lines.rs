//! The rendezvous surface between a worker and its helpers: the free line
//! pool, the filled `repldata` queue, the workgroup status and the per-SYNC
//! table-name cache, all guarded by one lock.
//!
//! A [`Line`] is always in exactly one place: the pool, `repldata`, or held
//! by the task that took it. Movement between the lists is a move of the
//! owned value under the [`WorkData`] lock.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, Notify};

use rcast_model::{NodeId, TableId};

/// What a filled line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineCode {
    /// `data` is one SQL statement to apply locally.
    Action,
    /// The producing helper finished its cursor cleanly.
    Done,
    /// The producing helper failed; the SYNC must abort.
    Error,
}

/// Reusable carrier for one apply statement or a control marker. The `data`
/// buffer keeps its allocation across round trips through the pool.
#[derive(Debug)]
pub struct Line {
    pub code: LineCode,
    pub provider: NodeId,
    pub data: String,
}

impl Line {
    fn blank() -> Self {
        Self {
            code: LineCode::Done,
            provider: 0,
            data: String::new(),
        }
    }
}

/// State of the workgroup (worker plus helpers) for the current SYNC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkGroupStatus {
    Idle,
    Busy,
    /// An error was seen; helpers must stop producing and report.
    Abort,
}

struct WorkDataState {
    status: WorkGroupStatus,
    linepool: VecDeque<Line>,
    repldata: VecDeque<Line>,
    tab_fqname: HashMap<TableId, String>,
}

/// Shared coordination state of one workgroup.
pub struct WorkData {
    state: Mutex<WorkDataState>,
    repldata_ready: Notify,
    pool_ready: Notify,
}

impl Default for WorkData {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkData {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WorkDataState {
                status: WorkGroupStatus::Idle,
                linepool: VecDeque::new(),
                repldata: VecDeque::new(),
                tab_fqname: HashMap::new(),
            }),
            repldata_ready: Notify::new(),
            pool_ready: Notify::new(),
        }
    }

    pub async fn status(&self) -> WorkGroupStatus {
        self.state.lock().await.status
    }

    /// Change the workgroup status. Leaving `Busy` wakes every helper
    /// blocked on the pool so it can observe the transition.
    pub async fn set_status(&self, status: WorkGroupStatus) {
        let mut st = self.state.lock().await;
        st.status = status;
        drop(st);
        if status != WorkGroupStatus::Busy {
            self.pool_ready.notify_waiters();
        }
    }

    /// Grow the pool by `n` fresh lines (done when a provider joins the
    /// workgroup).
    pub async fn contribute_lines(&self, n: usize) {
        let mut st = self.state.lock().await;
        for _ in 0..n {
            st.linepool.push_back(Line::blank());
        }
        drop(st);
        self.pool_ready.notify_waiters();
    }

    /// Take up to `max` free lines for filling. Blocks while the pool is
    /// empty; returns `None` once the workgroup status leaves `Busy`, which
    /// is how helpers observe an abort.
    pub async fn acquire_lines(&self, max: usize) -> Option<Vec<Line>> {
        debug_assert!(max > 0);
        loop {
            let notified = self.pool_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().await;
                if st.status != WorkGroupStatus::Busy {
                    return None;
                }
                if !st.linepool.is_empty() {
                    let n = max.min(st.linepool.len());
                    return Some(st.linepool.drain(..n).collect());
                }
            }
            notified.await;
        }
    }

    /// Take one free line for a DONE/ERROR marker. Unlike
    /// [`acquire_lines`](Self::acquire_lines) this ignores the workgroup
    /// status: a failed helper still owes the worker its control line.
    pub async fn acquire_control_line(&self) -> Line {
        loop {
            let notified = self.pool_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().await;
                if let Some(line) = st.linepool.pop_front() {
                    return line;
                }
            }
            notified.await;
        }
    }

    /// Hand filled lines to the worker and return unused ones to the pool
    /// in one locked step.
    pub async fn publish(&self, filled: Vec<Line>, unused: Vec<Line>) {
        let any_filled = !filled.is_empty();
        let any_unused = !unused.is_empty();
        let mut st = self.state.lock().await;
        for line in filled {
            st.repldata.push_back(line);
        }
        for line in unused {
            st.linepool.push_front(line);
        }
        drop(st);
        if any_filled {
            self.repldata_ready.notify_one();
        }
        if any_unused {
            self.pool_ready.notify_waiters();
        }
    }

    /// Detach the whole `repldata` queue, waiting until it is non-empty.
    pub async fn take_repldata(&self) -> VecDeque<Line> {
        loop {
            let notified = self.repldata_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().await;
                if !st.repldata.is_empty() {
                    return std::mem::take(&mut st.repldata);
                }
            }
            notified.await;
        }
    }

    /// Return consumed lines to the pool. `mark_abort` flips the workgroup
    /// to `Abort` in the same locked step so helpers that wake up on the
    /// pool broadcast observe the failure.
    pub async fn return_lines(&self, lines: impl IntoIterator<Item = Line>, mark_abort: bool) {
        let mut st = self.state.lock().await;
        for mut line in lines {
            line.data.clear();
            st.linepool.push_front(line);
        }
        if mark_abort && st.status == WorkGroupStatus::Busy {
            st.status = WorkGroupStatus::Abort;
        }
        drop(st);
        self.pool_ready.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Per-SYNC table name cache
    // ------------------------------------------------------------------

    pub async fn set_tab_fqname(&self, tab_id: TableId, fqname: &str) {
        self.state
            .lock()
            .await
            .tab_fqname
            .insert(tab_id, fqname.to_string());
    }

    /// Snapshot of the cache. Helpers take one per SYNC cycle; the worker
    /// only mutates the cache while no helper is dispatched.
    pub async fn tab_fqnames(&self) -> HashMap<TableId, String> {
        self.state.lock().await.tab_fqname.clone()
    }

    pub async fn clear_tab_fqnames(&self) {
        self.state.lock().await.tab_fqname.clear();
    }

    /// Pool size, for tests and introspection.
    pub async fn pool_len(&self) -> usize {
        self.state.lock().await.linepool.len()
    }
}
