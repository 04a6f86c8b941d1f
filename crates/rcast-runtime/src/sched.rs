use std::time::Duration;

use tokio::sync::watch;

/// Run state published by the embedding process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    Ok,
    /// Stop accepting work and let workers finish their current SQL call.
    Shutdown,
    /// Hard stop requested by the operator.
    Terminate,
}

impl SchedStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, SchedStatus::Ok)
    }
}

/// Cancellable clock shared by all workers. Workers poll [`status`] between
/// messages and sleep through [`msleep`] during retry backoffs; a status
/// change interrupts any sleeper immediately.
///
/// [`status`]: Scheduler::status
/// [`msleep`]: Scheduler::msleep
#[derive(Debug)]
pub struct Scheduler {
    tx: watch::Sender<SchedStatus>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SchedStatus::Ok);
        Self { tx }
    }

    pub fn status(&self) -> SchedStatus {
        *self.tx.borrow()
    }

    pub fn set_status(&self, status: SchedStatus) {
        // send_replace never fails; we keep a receiver alive implicitly via
        // subscribe() in msleep.
        self.tx.send_replace(status);
    }

    pub fn shutdown(&self) {
        self.set_status(SchedStatus::Shutdown);
    }

    /// Sleep for `ms` milliseconds or until the status leaves `Ok`,
    /// whichever comes first. Returns the status observed on wakeup.
    pub async fn msleep(&self, ms: u64) -> SchedStatus {
        let mut rx = self.tx.subscribe();
        let sleep = tokio::time::sleep(Duration::from_millis(ms));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return *rx.borrow(),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return SchedStatus::Shutdown;
                    }
                    let status = *rx.borrow();
                    if !status.is_ok() {
                        return status;
                    }
                }
            }
        }
    }
}
