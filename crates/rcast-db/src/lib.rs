//! PostgreSQL plumbing shared by the worker and its helpers.
//!
//! Workers drive transactions by hand (`begin`/`commit`/`rollback` text
//! statements batched with the statements they bracket), because event
//! application builds multi-statement SQL the way the capture side formats
//! it. [`SqlBatch`] executes such batches over the simple query protocol;
//! single statements with bind parameters go through `sqlx::query` as
//! usual.

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnection, PgQueryResult};
use sqlx::{Connection, Executor};
use tracing::{debug, info};

use rcast_model::Event;

/// Dial a database. `symname` identifies the connection in logs, e.g.
/// `remote_worker_3` or `subscriber_2_provider_1`.
pub async fn connect(conninfo: &str, symname: &str) -> Result<PgConnection> {
    let conn = PgConnection::connect(conninfo)
        .await
        .with_context(|| format!("connect {symname} failed"))?;
    info!(symname, "database connection established");
    Ok(conn)
}

/// Escape a string for splicing into a SQL literal: single quotes doubled.
/// The surrounding quotes are the caller's.
pub fn quote_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// An appendable buffer of SQL statements executed as one round trip.
///
/// Statements accumulate with their trailing semicolons; `execute` ships
/// the whole buffer over the simple query protocol, so `begin`/`commit`
/// travel together with the work they bracket. The driver error is
/// returned untranslated; whether a failure is fatal or retryable is the
/// caller's policy.
#[derive(Debug, Default, Clone)]
pub struct SqlBatch {
    sql: String,
}

impl SqlBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_stmt(stmt: impl AsRef<str>) -> Self {
        let mut batch = Self::new();
        batch.append(stmt);
        batch
    }

    pub fn append(&mut self, stmt: impl AsRef<str>) {
        if !self.sql.is_empty() {
            self.sql.push(' ');
        }
        self.sql.push_str(stmt.as_ref());
    }

    pub fn reset(&mut self) {
        self.sql.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn as_sql(&self) -> &str {
        &self.sql
    }

    pub async fn execute(&self, conn: &mut PgConnection) -> Result<PgQueryResult, sqlx::Error> {
        debug!(sql = %self.sql, "executing batch");
        conn.execute(self.sql.as_str()).await
    }
}

/// Append the event-forwarding block to `batch`: notify both channels,
/// duplicate the event record into the local `sl_event`, and self-confirm
/// it in `sl_confirm`. When the surrounding transaction commits, every node
/// listening with us as provider picks up the news.
pub fn append_event_insert(
    batch: &mut SqlBatch,
    namespace: &str,
    cluster_name: &str,
    local_node_id: i32,
    event: &Event,
) {
    batch.append(format!(
        "notify \"_{cluster_name}_Event\"; notify \"_{cluster_name}_Confirm\";"
    ));

    let mut columns = String::from(
        "ev_origin, ev_seqno, ev_timestamp, ev_minxid, ev_maxxid, ev_xip, ev_type",
    );
    let mut values = format!(
        "'{}', '{}', '{}', '{}', '{}', '{}', '{}'",
        event.origin,
        event.seqno,
        quote_literal(&event.timestamp),
        quote_literal(&event.snapshot.minxid),
        quote_literal(&event.snapshot.maxxid),
        quote_literal(&event.snapshot.xip),
        quote_literal(event.ev_type.as_str()),
    );
    for (i, data) in event.data.iter().enumerate() {
        if let Some(data) = data {
            columns.push_str(&format!(", ev_data{}", i + 1));
            values.push_str(&format!(", '{}'", quote_literal(data)));
        }
    }
    batch.append(format!(
        "insert into {namespace}.sl_event ({columns}) values ({values});"
    ));

    batch.append(format!(
        "insert into {namespace}.sl_confirm \
         (con_origin, con_received, con_seqno, con_timestamp) \
         values ({}, {}, '{}', CURRENT_TIMESTAMP);",
        event.origin, local_node_id, event.seqno
    ));
}

/// Put a connection into replication mode so the capture triggers know the
/// session is applying replicated data rather than originating it.
pub async fn set_session_role(
    conn: &mut PgConnection,
    namespace: &str,
    cluster_name: &str,
) -> Result<()> {
    let sql = format!("select {namespace}.setSessionRole('_{cluster_name}', 'rowcast');");
    conn.execute(sql.as_str())
        .await
        .context("setSessionRole failed")?;
    Ok(())
}
