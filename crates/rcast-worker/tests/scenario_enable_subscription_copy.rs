//! Scenario: ENABLE_SUBSCRIPTION Initial Copy With Retry
//!
//! # Invariants under test (live database required)
//!
//! Handling ENABLE_SUBSCRIPTION runs the initial bulk copy inside the
//! event's transaction. A failed copy rolls the whole attempt back
//! (nothing copied, no cursor seeded, no event row kept), the worker
//! sleeps its backoff, and retries. Once the blocking condition is
//! removed, the retry streams the table over COPY, seeds the sync cursor
//! from the origin's event history, and commits the event exactly once.
//!
//! The first attempt is made to fail by withholding the set's `sl_set`
//! row (the set-origin lookup errors after the tables are copied); the
//! test inserts it while the worker is in its first 15 second backoff.
//!
//! Requires `ROWCAST_DATABASE_URL` to point at a scratch database; skips
//! silently otherwise (CI without Postgres still passes).

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgConnection;
use sqlx::Executor;

use rcast_model::{Event, EventType, XidSnapshot};
use rcast_runtime::{Registry, Scheduler};
use rcast_worker::{ConfirmCache, RemoteWorker, WorkerConfig};

fn scratch_db_url() -> Option<String> {
    let _ = dotenvy::from_filename(".env.local");
    std::env::var("ROWCAST_DATABASE_URL").ok()
}

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

#[tokio::test]
async fn copy_failure_backs_off_then_seeds_the_cursor() {
    let Some(url) = scratch_db_url() else {
        eprintln!("skipping: ROWCAST_DATABASE_URL not set");
        return;
    };
    let cluster = "rcast_e2e_copy";
    let ns = "\"_rcast_e2e_copy\"";
    // No primary key: the provider and the local replica are the same
    // scratch database here, so a successful copy doubles the rows.
    let payload = "public.rcast_e2e_copy_payload";

    let mut admin = rcast_db::connect(&url, "e2e_copy_admin")
        .await
        .expect("connect scratch DB");
    create_catalog(&mut admin, cluster).await;
    admin
        .execute(
            format!(
                "drop table if exists {payload}; \
                 create table {payload} (a int, b text); \
                 insert into {payload} values (1, 'x'), (2, 'y'); \
                 insert into {ns}.sl_table values (7, 1, '{payload}'::regclass::oid);"
            )
            .as_str(),
        )
        .await
        .expect("seed fixture");
    // Note: no sl_set row yet; the first copy attempt fails on the
    // set-origin lookup and everything it copied rolls back.

    let registry = Arc::new(Registry::new(2, cluster, &url));
    registry.store_node(1, "origin");
    registry.enable_node(1);
    registry.store_path(1, &url, 10);
    registry.store_set(1, 1, "payload set");
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

    registry.enqueue_event(Event {
        provider: 1,
        origin: 1,
        seqno: 10,
        timestamp: "2024-05-01 12:00:00".into(),
        snapshot: XidSnapshot::new("0", "0", ""),
        ev_type: EventType::EnableSubscription,
        data: [
            Some("1".into()),
            Some("1".into()),
            Some("2".into()),
            Some("f".into()),
            None,
            None,
            None,
            None,
        ],
    });

    // First attempt fails quickly; the worker then sleeps 15 seconds.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let rows: i64 = sqlx::query_scalar(&format!("select count(*) from {payload}"))
        .fetch_one(&mut admin)
        .await
        .expect("count payload rows");
    assert_eq!(rows, 2, "failed copy must leave the payload untouched");
    let cursors: i64 = sqlx::query_scalar(&format!("select count(*) from {ns}.sl_setsync"))
        .fetch_one(&mut admin)
        .await
        .expect("count sl_setsync");
    assert_eq!(cursors, 0, "failed copy must not seed a cursor");

    // Unblock the retry.
    admin
        .execute(format!("insert into {ns}.sl_set values (1, 1);").as_str())
        .await
        .expect("insert sl_set row");

    tokio::time::timeout(Duration::from_secs(90), async {
        loop {
            let cursors: i64 =
                sqlx::query_scalar(&format!("select count(*) from {ns}.sl_setsync"))
                    .fetch_one(&mut admin)
                    .await
                    .expect("poll sl_setsync");
            if cursors == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    })
    .await
    .expect("copy retry did not seed the cursor in time");

    let (seqno, action_list): (i64, String) = sqlx::query_as(&format!(
        "select ssy_seqno, ssy_action_list from {ns}.sl_setsync where ssy_setid = 1"
    ))
    .fetch_one(&mut admin)
    .await
    .expect("read seeded cursor");
    assert_eq!(seqno, 0, "no SYNC on the origin yet, cursor starts at zero");
    assert_eq!(action_list, "", "no residual actions in an empty log");

    let rows: i64 = sqlx::query_scalar(&format!("select count(*) from {payload}"))
        .fetch_one(&mut admin)
        .await
        .expect("count payload rows");
    assert_eq!(rows, 4, "the copy streamed both provider rows into the replica");

    let events: i64 = sqlx::query_scalar(&format!(
        "select count(*) from {ns}.sl_event where ev_origin = 1 and ev_seqno = 10"
    ))
    .fetch_one(&mut admin)
    .await
    .expect("count sl_event");
    assert_eq!(events, 1, "exactly one sl_event row after the retry");

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
