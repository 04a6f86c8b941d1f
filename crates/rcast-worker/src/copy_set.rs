//! Initial bulk load of a newly enabled set.
//!
//! Runs inside the worker while it handles ENABLE_SUBSCRIPTION, with the
//! local event transaction still open. The provider side runs in one
//! serializable transaction so the table contents and the seeded sync
//! cursor describe the same instant; it is rolled back afterwards since
//! nothing on the provider changes.

use anyhow::{anyhow, Context, Result};
use futures_util::StreamExt;
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Executor, Row};
use tracing::{debug, info};

use rcast_db::quote_literal;
use rcast_model::{NodeId, SetId, SetSyncCursor, XidSnapshot};
use rcast_runtime::Registry;

/// Copy every table of `set_id` from the provider (this worker's node) and
/// seed the local sync cursor. Any failure is returned as a plain error;
/// the caller rolls back and retries with backoff.
pub async fn copy_set(
    registry: &Registry,
    local_conn: &mut PgConnection,
    worker_node: NodeId,
    set_id: SetId,
) -> Result<()> {
    info!(node = worker_node, set = set_id, "copy_set starting");

    let conninfo = registry
        .find_node(worker_node)
        .and_then(|node| node.pa_conninfo())
        .ok_or_else(|| anyhow!("no conninfo for data provider {worker_node}"))?;
    let mut pro_conn = rcast_db::connect(&conninfo, &format!("copy_set_{set_id}"))
        .await
        .context("cannot connect to provider DB")?;

    let result = copy_tables_and_seed_cursor(
        registry,
        local_conn,
        &mut pro_conn,
        worker_node,
        set_id,
    )
    .await;

    // The provider transaction was read-only; release it either way.
    let _ = pro_conn.execute("rollback transaction;").await;
    let _ = pro_conn.close().await;
    result
}

async fn copy_tables_and_seed_cursor(
    registry: &Registry,
    local_conn: &mut PgConnection,
    pro_conn: &mut PgConnection,
    worker_node: NodeId,
    set_id: SetId,
) -> Result<()> {
    let ns = registry.namespace();

    pro_conn
        .execute("start transaction; set transaction isolation level serializable;")
        .await
        .context("begin provider transaction")?;

    let tables_sql = format!(
        "select T.tab_id, \
                \"pg_catalog\".quote_ident(PGN.nspname) || '.' || \
                \"pg_catalog\".quote_ident(PGC.relname) as tab_fqname, \
                T.tab_attkind, T.tab_comment \
         from {ns}.sl_table T, \
              \"pg_catalog\".pg_class PGC, \
              \"pg_catalog\".pg_namespace PGN \
         where T.tab_set = $1 \
             and T.tab_reloid = PGC.oid \
             and PGC.relnamespace = PGN.oid \
         order by tab_id"
    );
    let tables = sqlx::query(&tables_sql)
        .bind(set_id)
        .fetch_all(&mut *pro_conn)
        .await
        .context("select tables in set")?;

    for table in &tables {
        let tab_id: i32 = table.try_get("tab_id")?;
        let tab_fqname: String = table.try_get("tab_fqname")?;
        let tab_attkind: String = table.try_get("tab_attkind")?;
        let tab_comment: String = table.try_get("tab_comment")?;
        debug!(
            node = worker_node,
            tab_id,
            table = %tab_fqname,
            "copying table"
        );

        // Install the table definition locally. While unsubscribed this had
        // been suppressed.
        let add_table = format!(
            "select {ns}.setAddTable_int({set_id}, {tab_id}, '{}', '{}', '{}');",
            quote_literal(&tab_fqname),
            quote_literal(&tab_attkind),
            quote_literal(&tab_comment)
        );
        local_conn
            .execute(add_table.as_str())
            .await
            .context("setAddTable_int failed")?;

        stream_table(local_conn, pro_conn, &tab_fqname).await?;
    }

    let set_origin: i32 = sqlx::query_scalar(&format!(
        "select set_origin from {ns}.sl_set where set_id = $1"
    ))
    .bind(set_id)
    .fetch_one(&mut *pro_conn)
    .await
    .context("cannot determine origin of set")?;

    let cursor = if set_origin == worker_node {
        seed_cursor_from_origin(pro_conn, ns, worker_node).await?
    } else {
        seed_cursor_from_subscriber(pro_conn, ns, set_id).await?
    };

    let insert = format!(
        "insert into {ns}.sl_setsync \
         (ssy_setid, ssy_origin, ssy_seqno, ssy_minxid, ssy_maxxid, ssy_xip, ssy_action_list) \
         values ('{set_id}', '{worker_node}', '{}', '{}', '{}', '{}', '{}');",
        cursor.seqno,
        quote_literal(&cursor.snapshot.minxid),
        quote_literal(&cursor.snapshot.maxxid),
        quote_literal(&cursor.snapshot.xip),
        quote_literal(&cursor.action_list)
    );
    local_conn
        .execute(insert.as_str())
        .await
        .context("insert initial sl_setsync row")?;

    info!(node = worker_node, set = set_id, "copy_set done");
    Ok(())
}

/// Stream one table's COPY bytes provider → local.
async fn stream_table(
    local_conn: &mut PgConnection,
    pro_conn: &mut PgConnection,
    tab_fqname: &str,
) -> Result<()> {
    let mut sink = local_conn
        .copy_in_raw(&format!("copy {tab_fqname} from stdin;"))
        .await
        .context("copy from stdin on local node")?;
    let mut source = match pro_conn
        .copy_out_raw(&format!("copy {tab_fqname} to stdout;"))
        .await
    {
        Ok(source) => source,
        Err(err) => {
            let _ = sink.abort("rowcast: copy set operation failed").await;
            return Err(err).context("copy to stdout on provider");
        }
    };

    let mut copied: u64 = 0;
    loop {
        match source.next().await {
            Some(Ok(chunk)) => {
                copied += chunk.len() as u64;
                if let Err(err) = sink.send(chunk).await {
                    drop(source);
                    let _ = sink.abort("rowcast: copy set operation failed").await;
                    return Err(err).context("forwarding copy data to local node");
                }
            }
            Some(Err(err)) => {
                drop(source);
                let _ = sink.abort("rowcast: copy set operation failed").await;
                return Err(err).context("reading copy data from provider");
            }
            None => break,
        }
    }
    drop(source);

    sink.finish().await.context("finish copy on local node")?;
    debug!(bytes = copied, table = %tab_fqname, "table copied");
    Ok(())
}

/// The provider is the set origin: reconstruct the initial cursor from its
/// event history.
async fn seed_cursor_from_origin(
    pro_conn: &mut PgConnection,
    ns: &str,
    origin: NodeId,
) -> Result<SetSyncCursor> {
    let last_sync: Option<i64> = sqlx::query_scalar(&format!(
        "select max(ev_seqno) from {ns}.sl_event \
         where ev_origin = {origin} and ev_type = 'SYNC'"
    ))
    .fetch_one(&mut *pro_conn)
    .await
    .context("looking up last SYNC on provider")?;

    match last_sync {
        None => {
            // No SYNC yet: cursor zero, every existing action excluded.
            let actions = fetch_action_list(pro_conn, ns, origin, None).await?;
            Ok(SetSyncCursor {
                seqno: 0,
                snapshot: XidSnapshot::zero(),
                action_list: actions,
            })
        }
        Some(seqno) => {
            let row = sqlx::query(&format!(
                "select ev_minxid::text as ev_minxid, \
                        ev_maxxid::text as ev_maxxid, ev_xip \
                 from {ns}.sl_event \
                 where ev_origin = {origin} and ev_seqno = {seqno}"
            ))
            .fetch_one(&mut *pro_conn)
            .await
            .context("reading last SYNC snapshot")?;
            let snapshot = XidSnapshot::new(
                row.try_get::<String, _>("ev_minxid")?,
                row.try_get::<String, _>("ev_maxxid")?,
                row.try_get::<String, _>("ev_xip")?,
            );
            let actions =
                fetch_action_list(pro_conn, ns, origin, Some(snapshot.after_qual())).await?;
            Ok(SetSyncCursor {
                seqno,
                snapshot,
                action_list: actions,
            })
        }
    }
}

/// The provider is another subscriber: its cursor is already correct for
/// the data we just copied.
async fn seed_cursor_from_subscriber(
    pro_conn: &mut PgConnection,
    ns: &str,
    set_id: SetId,
) -> Result<SetSyncCursor> {
    let row = sqlx::query(&format!(
        "select ssy_seqno, ssy_minxid::text as ssy_minxid, \
                ssy_maxxid::text as ssy_maxxid, ssy_xip, ssy_action_list \
         from {ns}.sl_setsync where ssy_setid = $1"
    ))
    .bind(set_id)
    .fetch_one(&mut *pro_conn)
    .await
    .context("sl_setsync entry for set not found on provider")?;

    Ok(SetSyncCursor {
        seqno: row.try_get("ssy_seqno")?,
        snapshot: XidSnapshot::new(
            row.try_get::<String, _>("ssy_minxid")?,
            row.try_get::<String, _>("ssy_maxxid")?,
            row.try_get::<String, _>("ssy_xip")?,
        ),
        action_list: row.try_get("ssy_action_list")?,
    })
}

/// Enumerate action sequences from both log tables, optionally restricted
/// by a snapshot qualification, formatted as a quoted `IN` list.
async fn fetch_action_list(
    pro_conn: &mut PgConnection,
    ns: &str,
    origin: NodeId,
    after_qual: Option<String>,
) -> Result<String> {
    let and_qual = match &after_qual {
        Some(qual) => format!(" and {qual}"),
        None => String::new(),
    };
    let actions: Vec<String> = sqlx::query_scalar(&format!(
        "select log_actionseq::text from {ns}.sl_log_1 \
         where log_origin = {origin}{and_qual} \
         union \
         select log_actionseq::text from {ns}.sl_log_2 \
         where log_origin = {origin}{and_qual}"
    ))
    .fetch_all(&mut *pro_conn)
    .await
    .context("enumerating residual action sequences")?;
    Ok(quoted_list(&actions))
}

/// Join values as `'a','b','c'` for splicing into an `IN (...)` list.
fn quoted_list(values: &[String]) -> String {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('\'');
        out.push_str(value);
        out.push('\'');
    }
    out
}
