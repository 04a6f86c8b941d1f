use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::debug;

use rcast_model::{Confirm, Event, EventSeq};

/// A message delivered to a remote worker.
#[derive(Debug, Clone)]
pub enum WorkMsg {
    /// A remote event to process, in per-origin seqno order.
    Event(Event),
    /// A confirmation to forward. At most one is pending per
    /// (origin, received) pair, always carrying the highest seqno seen.
    Confirm(Confirm),
    /// Re-read the runtime configuration before the next message.
    Wakeup,
}

struct QueueState {
    messages: VecDeque<WorkMsg>,
    /// Highest event seqno ever accepted for this node. Lives inside the
    /// queue lock so the acceptance decision and the append are atomic:
    /// two listeners racing on the same origin cannot interleave.
    last_event: EventSeq,
}

/// Per-node FIFO between listener tasks (producers) and the node's worker
/// (sole consumer).
pub struct MessageQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                last_event: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an event unless it is a duplicate or arrives out of order.
    /// Returns `false` for dropped events.
    pub fn push_event(&self, event: Event) -> bool {
        let mut st = self.state.lock().expect("message queue poisoned");
        if event.seqno <= st.last_event {
            debug!(
                origin = event.origin,
                seqno = event.seqno,
                last_event = st.last_event,
                "event ignored - duplicate"
            );
            return false;
        }
        st.last_event = event.seqno;
        st.messages.push_back(WorkMsg::Event(event));
        drop(st);
        self.notify.notify_one();
        true
    }

    /// Append a confirmation, merging with a pending one for the same
    /// (origin, received) pair so the queue never holds more than one and
    /// it always carries the maximum seqno.
    pub fn push_confirm(&self, confirm: Confirm) {
        let mut st = self.state.lock().expect("message queue poisoned");
        for msg in st.messages.iter_mut() {
            if let WorkMsg::Confirm(pending) = msg {
                if pending.origin == confirm.origin && pending.received == confirm.received {
                    if pending.seqno < confirm.seqno {
                        pending.seqno = confirm.seqno;
                        pending.timestamp = confirm.timestamp;
                    }
                    return;
                }
            }
        }
        st.messages.push_back(WorkMsg::Confirm(confirm));
        drop(st);
        self.notify.notify_one();
    }

    pub fn push_wakeup(&self) {
        let mut st = self.state.lock().expect("message queue poisoned");
        st.messages.push_back(WorkMsg::Wakeup);
        drop(st);
        self.notify.notify_one();
    }

    /// Remove and return the head message, waiting until one is present.
    pub async fn dequeue(&self) -> WorkMsg {
        loop {
            if let Some(msg) = {
                let mut st = self.state.lock().expect("message queue poisoned");
                st.messages.pop_front()
            } {
                return msg;
            }
            self.notify.notified().await;
        }
    }

    /// Number of queued messages. Test and introspection use only.
    pub fn len(&self) -> usize {
        self.state.lock().expect("message queue poisoned").messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
