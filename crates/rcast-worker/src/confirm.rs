//! Confirmation forwarding and the process-wide confirm cache.

use std::collections::HashMap;
use std::sync::Mutex;

use sqlx::postgres::PgConnection;
use sqlx::Executor;
use tracing::{debug, error};

use rcast_db::quote_literal;
use rcast_model::{Confirm, EventSeq, NodeId};

/// Last confirmed seqno per (origin, received) pair, shared by all workers
/// in the process. Suppresses re-forwarding confirmations every worker has
/// already seen through some other path.
#[derive(Default)]
pub struct ConfirmCache {
    inner: Mutex<HashMap<(NodeId, NodeId), EventSeq>>,
}

impl ConfirmCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seqno` for the pair if it is news. Returns `false` when the
    /// cache already holds an equal or higher seqno.
    pub fn advance(&self, origin: NodeId, received: NodeId, seqno: EventSeq) -> bool {
        let mut map = self.inner.lock().expect("confirm cache poisoned");
        match map.get_mut(&(origin, received)) {
            Some(known) if *known >= seqno => false,
            Some(known) => {
                *known = seqno;
                true
            }
            None => {
                map.insert((origin, received), seqno);
                true
            }
        }
    }
}

/// Forward one confirmation through the local database unless the cache
/// already knows it. Stored-procedure failures are logged and swallowed:
/// confirmations are redundant and a later one will catch up.
pub async fn forward_confirm(
    cache: &ConfirmCache,
    local_conn: &mut PgConnection,
    namespace: &str,
    worker_node: NodeId,
    confirm: &Confirm,
) {
    if !cache.advance(confirm.origin, confirm.received, confirm.seqno) {
        debug!(
            node = worker_node,
            origin = confirm.origin,
            received = confirm.received,
            seqno = confirm.seqno,
            "confirm already known - not forwarded"
        );
        return;
    }

    debug!(
        node = worker_node,
        origin = confirm.origin,
        received = confirm.received,
        seqno = confirm.seqno,
        "forward confirm"
    );
    let sql = format!(
        "select {namespace}.forwardConfirm({}, {}, '{}', '{}');",
        confirm.origin,
        confirm.received,
        confirm.seqno,
        quote_literal(&confirm.timestamp)
    );
    if let Err(err) = local_conn.execute(sql.as_str()).await {
        error!(node = worker_node, %err, "forwardConfirm failed");
    }
}
