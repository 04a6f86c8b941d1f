//! Helper task: one per data provider, owning that provider's connection
//! while busy.
//!
//! A helper sleeps until the worker dispatches it for a SYNC, then opens a
//! read-only serializable transaction on the provider, walks a server-side
//! cursor over the qualified log rows, and streams re-materialized apply
//! statements back through the shared line pool. It always finishes by
//! pushing a DONE or ERROR control line so the worker's drain terminates.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Executor, Row};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use rcast_model::{LogRow, NodeId, RowChange, TableId};

use crate::lines::{LineCode, WorkData};
use crate::provider::{HelperHandle, HelperStatus};

/// Immutable parameters of one helper task.
#[derive(Debug, Clone)]
pub struct HelperSpec {
    pub worker_node: NodeId,
    pub provider_node: NodeId,
    /// Quoted schema qualifier of the replication catalog.
    pub namespace: String,
    /// Rows fetched from the cursor per round trip; also the upper bound on
    /// lines acquired from the pool at once.
    pub fetch_size: usize,
}

pub fn spawn_helper(spec: HelperSpec, handle: HelperHandle, wd: Arc<WorkData>) -> JoinHandle<()> {
    tokio::spawn(helper_main(spec, handle, wd))
}

async fn helper_main(spec: HelperSpec, handle: HelperHandle, wd: Arc<WorkData>) {
    loop {
        debug!(
            node = spec.worker_node,
            provider = spec.provider_node,
            "helper waiting for work"
        );
        match handle.wait_while(HelperStatus::Idle).await {
            HelperStatus::Exit => {
                debug!(
                    node = spec.worker_node,
                    provider = spec.provider_node,
                    "helper exiting"
                );
                return;
            }
            HelperStatus::Busy => {}
            // A stray Done can only come from a worker bug; park again.
            other => {
                debug!(?other, "helper woken without work");
                handle.set_status(HelperStatus::Idle).await;
                continue;
            }
        }

        let (conn, qualification) = {
            let mut st = handle.lock_owned().await;
            (st.conn.take(), std::mem::take(&mut st.qualification))
        };

        let mut failed = false;
        let conn = match conn {
            Some(mut conn) => {
                if let Err(err) = stream_log_rows(&mut conn, &qualification, &spec, &wd).await {
                    error!(
                        node = spec.worker_node,
                        provider = spec.provider_node,
                        err = %format!("{err:#}"),
                        "helper cursor failed"
                    );
                    failed = true;
                }
                // The provider transaction is read-only; rollback whatever
                // state the cursor left behind.
                if let Err(err) = conn.execute("rollback transaction;").await {
                    error!(provider = spec.provider_node, %err, "provider rollback failed");
                    failed = true;
                }
                Some(conn)
            }
            None => {
                error!(
                    node = spec.worker_node,
                    provider = spec.provider_node,
                    "helper dispatched without a provider connection"
                );
                failed = true;
                None
            }
        };

        // A failed session is not reused; closing it forces the next SYNC
        // attempt to re-dial.
        let keep = if failed {
            if let Some(conn) = conn {
                let _ = conn.close().await;
            }
            None
        } else {
            conn
        };
        {
            let mut st = handle.lock_owned().await;
            st.status = HelperStatus::Done;
            st.conn = keep;
        }

        let mut line = wd.acquire_control_line().await;
        line.code = if failed { LineCode::Error } else { LineCode::Done };
        line.provider = spec.provider_node;
        line.data.clear();
        wd.publish(vec![line], Vec::new()).await;

        handle.wait_while(HelperStatus::Done).await;
    }
}

/// Walk the log cursor and publish one ACTION line per row. Returns early
/// (as an error) when the workgroup aborts under us.
async fn stream_log_rows(
    conn: &mut PgConnection,
    qualification: &str,
    spec: &HelperSpec,
    wd: &WorkData,
) -> Result<()> {
    let ns = &spec.namespace;

    conn.execute("start transaction; set transaction isolation level serializable;")
        .await
        .context("begin provider transaction")?;

    // log_actionseq stays a bigint so the cursor's ORDER BY is numeric.
    let columns = "log_origin, log_xid::text as log_xid, log_tableid, \
                   log_actionseq, \
                   log_cmdtype::text as log_cmdtype, log_cmddata";
    let declare = format!(
        "declare log_read cursor for \
         select {columns} from {ns}.sl_log_1 {qualification} \
         union all \
         select {columns} from {ns}.sl_log_2 {qualification} \
         order by log_actionseq;"
    );
    conn.execute(declare.as_str())
        .await
        .context("declare log cursor")?;

    // Stable for the whole cycle: the worker only touches the cache while
    // no helper is dispatched.
    let tab_fqname = wd.tab_fqnames().await;

    loop {
        let Some(mut lines) = wd.acquire_lines(spec.fetch_size).await else {
            bail!("workgroup aborted");
        };
        let want = lines.len();

        let fetch = format!("fetch {want} from log_read;");
        let rows = match conn.fetch_all(fetch.as_str()).await {
            Ok(rows) => rows,
            Err(err) => {
                wd.return_lines(lines, false).await;
                return Err(err).context("fetch from log cursor");
            }
        };
        let got = rows.len();

        for (i, row) in rows.iter().enumerate() {
            match materialize(row, &tab_fqname) {
                Ok(stmt) => {
                    let line = &mut lines[i];
                    line.code = LineCode::Action;
                    line.provider = spec.provider_node;
                    line.data.clear();
                    line.data.push_str(&stmt);
                }
                Err(err) => {
                    wd.return_lines(lines, false).await;
                    return Err(err);
                }
            }
        }

        let unused = lines.split_off(got);
        wd.publish(lines, unused).await;

        if got < want {
            break;
        }
    }

    conn.execute("close log_read;")
        .await
        .context("close log cursor")?;
    Ok(())
}

fn materialize(row: &sqlx::postgres::PgRow, tab_fqname: &HashMap<TableId, String>) -> Result<String> {
    let origin: i32 = row.try_get("log_origin")?;
    let xid: String = row.try_get("log_xid")?;
    let tableid: TableId = row.try_get("log_tableid")?;
    let actionseq: i64 = row.try_get("log_actionseq")?;
    let cmdtype: String = row.try_get("log_cmdtype")?;
    let cmddata: String = row.try_get("log_cmddata")?;

    let fqname = tab_fqname
        .get(&tableid)
        .ok_or_else(|| anyhow!("no table name cached for log_tableid {tableid}"))?;

    let log_row = LogRow {
        origin,
        xid,
        tableid,
        actionseq,
        change: RowChange::parse(&cmdtype)?,
        cmddata,
    };
    Ok(log_row.apply_statement(fqname))
}
