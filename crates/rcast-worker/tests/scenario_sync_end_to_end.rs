//! Scenario: SYNC End To End
//!
//! # Invariants under test (live database required)
//!
//! 1. A SYNC from a single-provider, single-table, single-insert fixture
//!    drives the whole worker pipeline: the helper reads the log cursor,
//!    the worker applies the reconstructed insert, and the commit leaves
//!    exactly one new payload row, one `sl_event` row, one self-confirm
//!    row, and the set's sync cursor at the SYNC's seqno.
//! 2. A provider that cannot be dialled makes the SYNC fail with that
//!    provider's configured retry interval; after the path is corrected
//!    and reconciled, the same SYNC applies cleanly.
//!
//! Requires `ROWCAST_DATABASE_URL` to point at a scratch database; skips
//! silently otherwise (CI without Postgres still passes).

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgConnection;
use sqlx::Executor;

use rcast_model::{Event, EventType, XidSnapshot};
use rcast_runtime::{Registry, Scheduler};
use rcast_worker::reconcile::reconcile_providers;
use rcast_worker::sync::{sync_event, RetryAfter};
use rcast_worker::{ConfirmCache, RemoteWorker, WorkData, WorkerConfig};

fn scratch_db_url() -> Option<String> {
    let _ = dotenvy::from_filename(".env.local");
    std::env::var("ROWCAST_DATABASE_URL").ok()
}

/// A throwaway replication catalog standing in for the cluster schema:
/// only the tables and functions the worker paths touch. `log_xid` is a
/// bigint here so the snapshot qualifications compare numerically.
async fn create_catalog(conn: &mut PgConnection, cluster: &str) {
    let ns = format!("\"_{cluster}\"");
    let ddl = format!(
        "drop schema if exists {ns} cascade; \
         create schema {ns}; \
         create table {ns}.sl_event (ev_origin int, ev_seqno bigint, ev_timestamp text, \
             ev_minxid text, ev_maxxid text, ev_xip text, ev_type text, \
             ev_data1 text, ev_data2 text, ev_data3 text, ev_data4 text, \
             ev_data5 text, ev_data6 text, ev_data7 text, ev_data8 text); \
         create table {ns}.sl_confirm (con_origin int, con_received int, \
             con_seqno bigint, con_timestamp timestamptz); \
         create table {ns}.sl_setsync (ssy_setid int, ssy_origin int, ssy_seqno bigint, \
             ssy_minxid text, ssy_maxxid text, ssy_xip text, ssy_action_list text); \
         create table {ns}.sl_subscribe (sub_set int, sub_provider int, sub_receiver int); \
         create table {ns}.sl_table (tab_id int, tab_set int, tab_reloid oid); \
         create table {ns}.sl_set (set_id int, set_origin int); \
         create table {ns}.sl_log_1 (log_origin int, log_xid bigint, log_tableid int, \
             log_actionseq bigint, log_cmdtype text, log_cmddata text); \
         create table {ns}.sl_log_2 (log_origin int, log_xid bigint, log_tableid int, \
             log_actionseq bigint, log_cmdtype text, log_cmddata text); \
         create function {ns}.setsessionrole(text, text) returns int language sql as 'select 1'; \
         create function {ns}.setaddtable_int(int, int, text, text, text) returns int \
             language sql as 'select 0';"
    );
    conn.execute(ddl.as_str())
        .await
        .expect("create scratch catalog");
}

async fn wait_for_seqno(conn: &mut PgConnection, ns: &str, set_id: i32, want: i64) {
    let sql =
        format!("select coalesce(max(ssy_seqno), -1) from {ns}.sl_setsync where ssy_setid = {set_id}");
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let seqno: i64 = sqlx::query_scalar(&sql)
                .fetch_one(&mut *conn)
                .await
                .expect("poll sl_setsync");
            if seqno == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await
    .expect("sync cursor did not advance in time");
}

fn sync_fixture_event(seqno: i64, xid: &str) -> Event {
    Event {
        provider: 1,
        origin: 1,
        seqno,
        timestamp: "2024-05-01 12:00:00".into(),
        snapshot: XidSnapshot::new(xid, xid, ""),
        ev_type: EventType::Sync,
        data: Default::default(),
    }
}

#[tokio::test]
async fn single_sync_single_provider_applies_one_insert() {
    let Some(url) = scratch_db_url() else {
        eprintln!("skipping: ROWCAST_DATABASE_URL not set");
        return;
    };
    let cluster = "rcast_e2e_sync";
    let ns = "\"_rcast_e2e_sync\"";
    let payload = "public.rcast_e2e_sync_payload";

    let mut admin = rcast_db::connect(&url, "e2e_sync_admin")
        .await
        .expect("connect scratch DB");
    create_catalog(&mut admin, cluster).await;
    admin
        .execute(
            format!(
                "drop table if exists {payload}; \
                 create table {payload} (a int primary key, b text); \
                 insert into {ns}.sl_table values (7, 1, '{payload}'::regclass::oid); \
                 insert into {ns}.sl_subscribe values (1, 1, 2); \
                 insert into {ns}.sl_setsync values (1, 1, 0, '0', '0', '', ''); \
                 insert into {ns}.sl_log_1 values (1, 100, 7, 1, 'I', '(a,b) values (1,''x'')');"
            )
            .as_str(),
        )
        .await
        .expect("seed fixture");

    let registry = Arc::new(Registry::new(2, cluster, &url));
    registry.store_node(1, "origin");
    registry.enable_node(1);
    registry.store_path(1, &url, 10);
    registry.store_set(1, 1, "payload set");
    registry.enable_subscription(1, 1, false);
    let node = registry.find_node(1).expect("node stored");

    let sched = Arc::new(Scheduler::new());
    let handle = RemoteWorker::new(
        registry.clone(),
        sched.clone(),
        Arc::new(ConfirmCache::new()),
        node.clone(),
        WorkerConfig::default(),
    )
    .spawn();

    registry.enqueue_event(sync_fixture_event(5, "100"));

    // The cursor advancing is the visible sign of the commit.
    wait_for_seqno(&mut admin, ns, 1, 5).await;

    let (a, b): (i32, String) = sqlx::query_as(&format!("select a, b from {payload}"))
        .fetch_one(&mut admin)
        .await
        .expect("replicated row present");
    assert_eq!((a, b.as_str()), (1, "x"));

    let events: i64 = sqlx::query_scalar(&format!(
        "select count(*) from {ns}.sl_event where ev_origin = 1 and ev_seqno = 5"
    ))
    .fetch_one(&mut admin)
    .await
    .expect("count sl_event");
    assert_eq!(events, 1, "exactly one sl_event row for the SYNC");

    let confirms: i64 = sqlx::query_scalar(&format!(
        "select count(*) from {ns}.sl_confirm \
         where con_origin = 1 and con_received = 2 and con_seqno = 5"
    ))
    .fetch_one(&mut admin)
    .await
    .expect("count sl_confirm");
    assert_eq!(confirms, 1, "the worker self-confirmed the event");

    sched.shutdown();
    registry.enqueue_wakeup(1);
    handle
        .await
        .expect("worker task join")
        .expect("worker exits cleanly");

    let _ = admin
        .execute(format!("drop schema {ns} cascade; drop table {payload};").as_str())
        .await;
}

#[tokio::test]
async fn provider_connect_failure_returns_retry_then_succeeds() {
    let Some(url) = scratch_db_url() else {
        eprintln!("skipping: ROWCAST_DATABASE_URL not set");
        return;
    };
    let cluster = "rcast_e2e_dial";
    let ns = "\"_rcast_e2e_dial\"";
    let payload = "public.rcast_e2e_dial_payload";

    let mut admin = rcast_db::connect(&url, "e2e_dial_admin")
        .await
        .expect("connect scratch DB");
    create_catalog(&mut admin, cluster).await;
    admin
        .execute(
            format!(
                "drop table if exists {payload}; \
                 create table {payload} (a int primary key, b text); \
                 insert into {ns}.sl_table values (7, 1, '{payload}'::regclass::oid); \
                 insert into {ns}.sl_subscribe values (1, 1, 2); \
                 insert into {ns}.sl_setsync values (1, 1, 0, '0', '0', '', ''); \
                 insert into {ns}.sl_log_1 values (1, 150, 7, 1, 'I', '(a,b) values (1,''x'')');"
            )
            .as_str(),
        )
        .await
        .expect("seed fixture");

    // The provider path points at a closed port first.
    let registry = Arc::new(Registry::new(2, cluster, &url));
    registry.store_node(1, "origin");
    registry.enable_node(1);
    registry.store_path(1, "postgres://127.0.0.1:1/refused", 7);
    registry.store_set(1, 1, "payload set");
    registry.enable_subscription(1, 1, false);

    let wd = Arc::new(WorkData::new());
    let config = WorkerConfig::default();
    let mut providers = Vec::new();
    reconcile_providers(&registry, &wd, &mut providers, &config, 1, false).await;

    let mut local_conn = rcast_db::connect(&url, "e2e_dial_local")
        .await
        .expect("connect local");
    let event = sync_fixture_event(6, "200");

    let first = sync_event(&registry, &mut local_conn, &wd, &providers, 1, &event).await;
    assert_eq!(
        first,
        Err(RetryAfter(7)),
        "dial failure must surface the provider's retry interval"
    );

    // Path corrected; the next reconcile picks up the new conninfo and the
    // retried SYNC goes through.
    registry.store_path(1, &url, 7);
    reconcile_providers(&registry, &wd, &mut providers, &config, 1, false).await;

    let second = sync_event(&registry, &mut local_conn, &wd, &providers, 1, &event).await;
    assert_eq!(second, Ok(()), "retried SYNC must apply");

    let b: String = sqlx::query_scalar(&format!("select b from {payload} where a = 1"))
        .fetch_one(&mut admin)
        .await
        .expect("replicated row present");
    assert_eq!(b, "x");
    let seqno: i64 = sqlx::query_scalar(&format!(
        "select ssy_seqno from {ns}.sl_setsync where ssy_setid = 1"
    ))
    .fetch_one(&mut admin)
    .await
    .expect("read sync cursor");
    assert_eq!(seqno, 6);

    reconcile_providers(&registry, &wd, &mut providers, &config, 1, true).await;
    let _ = admin
        .execute(format!("drop schema {ns} cascade; drop table {payload};").as_str())
        .await;
}
