//! SYNC orchestration: dial providers, build per-provider log
//! qualifications, run the workgroup, and advance the sync cursors.
//!
//! Everything here happens inside the local transaction the worker opened
//! for the event. Failure never propagates as an error value; it converts
//! into a retry delay the worker sleeps on after rolling back.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgConnection;
use sqlx::{Executor, Row};
use tracing::{debug, error, info, warn};

use rcast_db::quote_literal;
use rcast_model::{
    provider_qualification, Event, NodeId, SetSyncCursor, SyncSet, XidSnapshot,
};
use rcast_runtime::Registry;

use crate::lines::{LineCode, WorkData, WorkGroupStatus};
use crate::provider::{HelperStatus, ProviderContext};

/// Seconds to sleep before retrying a failed SYNC apply.
const SYNC_RETRY_SECS: u64 = 10;
/// Seconds to sleep when the provider's dial information is missing.
const MISSING_CONNINFO_RETRY_SECS: u64 = 10;
/// Seconds to sleep when the local qualification queries fail.
const QUAL_RETRY_SECS: u64 = 60;

/// How long the worker should sleep before re-running the SYNC from
/// scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAfter(pub u64);

/// Process one SYNC event end to end. On `Ok` the caller commits; on
/// `Err(RetryAfter)` it rolls back, sleeps, and rebuilds the transaction.
pub async fn sync_event(
    registry: &Registry,
    local_conn: &mut PgConnection,
    wd: &Arc<WorkData>,
    providers: &[ProviderContext],
    worker_node: NodeId,
    event: &Event,
) -> Result<(), RetryAfter> {
    info!(node = worker_node, seqno = event.seqno, "SYNC processing");

    dial_providers(providers, worker_node).await?;
    check_providers_caught_up(registry, providers, event, worker_node).await?;

    if let Err(err) = build_qualifications(registry, local_conn, wd, providers, event).await {
        error!(node = worker_node, err = %format!("{err:#}"), "building SYNC qualification failed");
        wd.clear_tab_fqnames().await;
        return Err(RetryAfter(QUAL_RETRY_SECS));
    }

    let errors = run_workgroup(local_conn, wd, providers, worker_node).await;

    // Whole group is done with this SYNC; park the helpers for the next one.
    for ctx in providers.iter() {
        ctx.handle.set_status(HelperStatus::Idle).await;
    }
    wd.clear_tab_fqnames().await;
    wd.set_status(WorkGroupStatus::Idle).await;

    if errors != 0 {
        error!(node = worker_node, seqno = event.seqno, "SYNC aborted");
        return Err(RetryAfter(SYNC_RETRY_SECS));
    }

    advance_setsync(registry, local_conn, providers, event, worker_node).await?;

    info!(node = worker_node, seqno = event.seqno, "SYNC done");
    Ok(())
}

/// Establish every missing provider connection, parking it in the helper
/// state for the helper to use.
async fn dial_providers(
    providers: &[ProviderContext],
    worker_node: NodeId,
) -> Result<(), RetryAfter> {
    for ctx in providers.iter() {
        let mut st = ctx.handle.lock_owned().await;
        if st.conn.is_some() {
            continue;
        }
        let Some(conninfo) = ctx.pa_conninfo.as_deref() else {
            error!(
                node = worker_node,
                provider = ctx.no_id,
                "no conninfo for data provider"
            );
            return Err(RetryAfter(MISSING_CONNINFO_RETRY_SECS));
        };
        let symname = format!("subscriber_{}_provider_{}", worker_node, ctx.no_id);
        match rcast_db::connect(conninfo, &symname).await {
            Ok(conn) => st.conn = Some(conn),
            Err(err) => {
                error!(
                    node = worker_node,
                    provider = ctx.no_id,
                    err = %format!("{err:#}"),
                    "cannot connect to data provider"
                );
                return Err(RetryAfter(ctx.pa_connretry));
            }
        }
    }
    Ok(())
}

/// A provider that is neither the event's origin nor the node that handed
/// us the event must itself have processed the SYNC before it can serve the
/// log rows for it. Probe its event table and retry until it catches up.
async fn check_providers_caught_up(
    registry: &Registry,
    providers: &[ProviderContext],
    event: &Event,
    worker_node: NodeId,
) -> Result<(), RetryAfter> {
    let ns = registry.namespace();
    for ctx in providers.iter() {
        if ctx.no_id == event.origin || ctx.no_id == event.provider {
            continue;
        }
        let mut st = ctx.handle.lock_owned().await;
        let Some(conn) = st.conn.as_mut() else {
            // Dialled just above; a vanished connection means a racing
            // teardown, which a retry sorts out.
            return Err(RetryAfter(SYNC_RETRY_SECS));
        };
        let sql = format!(
            "select max(ev_seqno) from {ns}.sl_event where ev_origin = {};",
            event.origin
        );
        let seen: Option<i64> = match sqlx::query_scalar(&sql).fetch_one(&mut *conn).await {
            Ok(seen) => seen,
            Err(err) => {
                error!(provider = ctx.no_id, %err, "provider sync-status query failed");
                return Err(RetryAfter(SYNC_RETRY_SECS));
            }
        };
        if seen.unwrap_or(0) < event.seqno {
            warn!(
                node = worker_node,
                provider = ctx.no_id,
                seqno = event.seqno,
                seen = seen.unwrap_or(0),
                "data provider has not caught up with this SYNC yet"
            );
            return Err(RetryAfter(SYNC_RETRY_SECS));
        }
    }
    Ok(())
}

/// Query the local catalog for every (set, cursor) tuple per provider,
/// cache the table names, and park the composed WHERE clause in each
/// helper's state.
async fn build_qualifications(
    registry: &Registry,
    local_conn: &mut PgConnection,
    wd: &Arc<WorkData>,
    providers: &[ProviderContext],
    event: &Event,
) -> Result<()> {
    let ns = registry.namespace();

    for ctx in providers.iter() {
        let subs_sql = format!(
            "select S.sub_set, SSY.ssy_seqno, \
                    SSY.ssy_minxid::text as ssy_minxid, \
                    SSY.ssy_maxxid::text as ssy_maxxid, \
                    SSY.ssy_xip, SSY.ssy_action_list \
             from {ns}.sl_subscribe S, {ns}.sl_setsync SSY \
             where S.sub_provider = $1 \
                 and S.sub_receiver = $2 \
                 and S.sub_set = SSY.ssy_setid"
        );
        let rows = sqlx::query(&subs_sql)
            .bind(ctx.no_id)
            .bind(registry.local_node_id())
            .fetch_all(&mut *local_conn)
            .await
            .context("select subscribed sets and sync cursors")?;

        let mut sync_sets = Vec::with_capacity(rows.len());
        for row in rows {
            let set_id: i32 = row.try_get("sub_set")?;
            let cursor = SetSyncCursor {
                seqno: row.try_get("ssy_seqno")?,
                snapshot: XidSnapshot::new(
                    row.try_get::<String, _>("ssy_minxid")?,
                    row.try_get::<String, _>("ssy_maxxid")?,
                    row.try_get::<String, _>("ssy_xip")?,
                ),
                action_list: row.try_get("ssy_action_list")?,
            };

            let tabs_sql = format!(
                "select T.tab_id, \
                        \"pg_catalog\".quote_ident(PGN.nspname) || '.' || \
                        \"pg_catalog\".quote_ident(PGC.relname) as tab_fqname \
                 from {ns}.sl_table T, \
                      \"pg_catalog\".pg_class PGC, \
                      \"pg_catalog\".pg_namespace PGN \
                 where T.tab_set = $1 \
                     and PGC.oid = T.tab_reloid \
                     and PGC.relnamespace = PGN.oid"
            );
            let tabs = sqlx::query(&tabs_sql)
                .bind(set_id)
                .fetch_all(&mut *local_conn)
                .await
                .context("select tables of set")?;

            let mut tab_ids = Vec::with_capacity(tabs.len());
            for tab in tabs {
                let tab_id: i32 = tab.try_get("tab_id")?;
                let fqname: String = tab.try_get("tab_fqname")?;
                wd.set_tab_fqname(tab_id, &fqname).await;
                tab_ids.push(tab_id);
            }

            sync_sets.push(SyncSet {
                set_id,
                tab_ids,
                cursor,
            });
        }

        let qualification = provider_qualification(&event.snapshot, &sync_sets);
        ctx.handle.lock_owned().await.qualification = qualification;
    }
    Ok(())
}

/// Dispatch the helpers and drain the line stream, applying every ACTION on
/// the local connection. Returns the number of errors seen.
async fn run_workgroup(
    local_conn: &mut PgConnection,
    wd: &Arc<WorkData>,
    providers: &[ProviderContext],
    worker_node: NodeId,
) -> u32 {
    wd.set_status(WorkGroupStatus::Busy).await;

    let mut active: u32 = 0;
    for ctx in providers.iter() {
        let mut st = ctx.handle.lock_owned().await;
        if st.qualification.is_empty() {
            // Nothing qualifies from this provider; an unfiltered cursor
            // would select the whole log.
            continue;
        }
        st.status = HelperStatus::Busy;
        drop(st);
        ctx.handle.signal();
        debug!(node = worker_node, provider = ctx.no_id, "activate helper");
        active += 1;
    }

    let mut errors: u32 = 0;
    while active > 0 {
        let lines = wd.take_repldata().await;
        let mut consumed = Vec::with_capacity(lines.len());

        for line in lines {
            match line.code {
                LineCode::Action if errors == 0 => {
                    match local_conn.execute(line.data.as_str()).await {
                        Ok(res) if res.rows_affected() == 1 => {}
                        Ok(res) => {
                            error!(
                                node = worker_node,
                                rows = res.rows_affected(),
                                sql = %line.data,
                                "replication query did not affect exactly one row"
                            );
                            errors += 1;
                        }
                        Err(err) => {
                            error!(node = worker_node, %err, sql = %line.data, "replication query failed");
                            errors += 1;
                        }
                    }
                }
                // Already failing: stop applying, but keep consuming so the
                // control lines below still drain.
                LineCode::Action => {}
                LineCode::Done => {
                    debug!(node = worker_node, provider = line.provider, "helper finished");
                    active -= 1;
                }
                LineCode::Error => {
                    error!(
                        node = worker_node,
                        provider = line.provider,
                        "helper finished with error"
                    );
                    active -= 1;
                    errors += 1;
                }
            }
            consumed.push(line);
        }

        wd.return_lines(consumed, errors > 0).await;
    }

    debug!(node = worker_node, "all helpers done");
    errors
}

/// Advance the sync cursor of every set in the workgroup to this SYNC's
/// snapshot, verifying the update covered exactly the participating sets.
async fn advance_setsync(
    registry: &Registry,
    local_conn: &mut PgConnection,
    providers: &[ProviderContext],
    event: &Event,
    worker_node: NodeId,
) -> Result<(), RetryAfter> {
    let set_ids: Vec<String> = providers
        .iter()
        .flat_map(|ctx| ctx.sets.iter().map(|s| s.set_id.to_string()))
        .collect();
    if set_ids.is_empty() {
        return Ok(());
    }

    let ns = registry.namespace();
    let sql = format!(
        "update {ns}.sl_setsync set ssy_origin = '{}', ssy_seqno = '{}', \
         ssy_minxid = '{}', ssy_maxxid = '{}', ssy_xip = '{}', \
         ssy_action_list = '' where ssy_setid in ({});",
        event.origin,
        event.seqno,
        quote_literal(&event.snapshot.minxid),
        quote_literal(&event.snapshot.maxxid),
        quote_literal(&event.snapshot.xip),
        set_ids.join(",")
    );
    match local_conn.execute(sql.as_str()).await {
        Ok(res) if res.rows_affected() == set_ids.len() as u64 => Ok(()),
        Ok(res) => {
            error!(
                node = worker_node,
                rows = res.rows_affected(),
                expected = set_ids.len(),
                "sl_setsync update covered the wrong number of sets - SYNC aborted"
            );
            Err(RetryAfter(SYNC_RETRY_SECS))
        }
        Err(err) => {
            error!(node = worker_node, %err, "sl_setsync update failed - SYNC aborted");
            Err(RetryAfter(SYNC_RETRY_SECS))
        }
    }
}
