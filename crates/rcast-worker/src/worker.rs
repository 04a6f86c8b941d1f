//! The remote worker main loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgConnection;
use sqlx::Connection;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use rcast_db::{append_event_insert, quote_literal, SqlBatch};
use rcast_model::{Event, EventType};
use rcast_runtime::{NodeHandle, Registry, Scheduler, WorkMsg, WorkerStatus};

use crate::confirm::{forward_confirm, ConfirmCache};
use crate::copy_set::copy_set;
use crate::lines::WorkData;
use crate::provider::ProviderContext;
use crate::reconcile::reconcile_providers;
use crate::sync::{sync_event, RetryAfter};

/// Initial sleep after a failed subscription copy; doubles up to the cap.
const COPY_RETRY_START_SECS: u64 = 15;
const COPY_RETRY_CAP_SECS: u64 = 60;

/// Tunables of one worker and its helpers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Rows each helper fetches from its log cursor per round trip.
    pub fetch_size: usize,
    /// Lines contributed to the shared pool for each provider that joins
    /// the workgroup.
    pub lines_per_helper: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fetch_size: 100,
            lines_per_helper: 50,
        }
    }
}

/// The state machine processing one remote node's event stream.
///
/// Returns `Ok(())` on a graceful stop (scheduler shutdown, node
/// deactivated). Returns `Err` only for failures of the local database,
/// which is authoritative: the process should not continue past them.
pub struct RemoteWorker {
    registry: Arc<Registry>,
    sched: Arc<Scheduler>,
    confirms: Arc<ConfirmCache>,
    node: Arc<NodeHandle>,
    config: WorkerConfig,
}

enum Flow {
    Continue,
    /// Graceful stop requested while sleeping or checking configuration.
    Stop,
}

impl RemoteWorker {
    pub fn new(
        registry: Arc<Registry>,
        sched: Arc<Scheduler>,
        confirms: Arc<ConfirmCache>,
        node: Arc<NodeHandle>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            sched,
            confirms,
            node,
            config,
        }
    }

    /// Mark the node's worker as running and spawn the loop.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        let node = self.node.clone();
        node.set_worker_status(WorkerStatus::Running);
        tokio::spawn(async move {
            let result = self.run().await;
            node.set_worker_status(WorkerStatus::Done);
            if let Err(err) = &result {
                error!(node = node.no_id, err = %format!("{err:#}"), "remote worker failed");
            }
            result
        })
    }

    pub async fn run(self) -> Result<()> {
        let worker_node = self.node.no_id;
        info!(node = worker_node, "remote worker starting");

        let wd = Arc::new(WorkData::new());
        let mut providers: Vec<ProviderContext> = Vec::new();

        let mut local_conn = rcast_db::connect(
            self.registry.local_conninfo(),
            &format!("remote_worker_{worker_node}"),
        )
        .await?;
        rcast_db::set_session_role(
            &mut local_conn,
            self.registry.namespace(),
            self.registry.cluster_name(),
        )
        .await?;

        let result = self
            .event_loop(&mut local_conn, &wd, &mut providers)
            .await;

        // Release all providers and helpers, then the local connection.
        reconcile_providers(
            &self.registry,
            &wd,
            &mut providers,
            &self.config,
            worker_node,
            true,
        )
        .await;
        let _ = local_conn.close().await;

        info!(node = worker_node, "remote worker done");
        result
    }

    async fn event_loop(
        &self,
        local_conn: &mut PgConnection,
        wd: &Arc<WorkData>,
        providers: &mut Vec<ProviderContext>,
    ) -> Result<()> {
        let worker_node = self.node.no_id;
        let mut check_config = true;
        let mut curr_config: Option<u64> = None;

        loop {
            if check_config {
                if !self.sched.status().is_ok() {
                    return Ok(());
                }
                if !self.node.is_active() {
                    return Ok(());
                }
                if self.node.worker_status() != WorkerStatus::Running {
                    return Ok(());
                }
                let generation = self.registry.generation();
                if curr_config != Some(generation) {
                    reconcile_providers(
                        &self.registry,
                        wd,
                        providers,
                        &self.config,
                        worker_node,
                        false,
                    )
                    .await;
                    curr_config = Some(self.registry.generation());
                }
                check_config = false;
            }

            match self.node.queue.dequeue().await {
                WorkMsg::Wakeup => {
                    check_config = true;
                }
                WorkMsg::Confirm(confirm) => {
                    forward_confirm(
                        &self.confirms,
                        local_conn,
                        self.registry.namespace(),
                        worker_node,
                        &confirm,
                    )
                    .await;
                }
                WorkMsg::Event(event) => {
                    match self
                        .process_event(local_conn, wd, providers, &event)
                        .await?
                    {
                        Flow::Continue => {}
                        Flow::Stop => return Ok(()),
                    }
                    // Configuration events may have moved the generation;
                    // re-check before the next message so a subscription
                    // enabled by this very worker gets its provider before
                    // the following SYNC.
                    check_config = true;
                }
            }
        }
    }

    /// Apply one event in its own local transaction.
    async fn process_event(
        &self,
        local_conn: &mut PgConnection,
        wd: &Arc<WorkData>,
        providers: &[ProviderContext],
        event: &Event,
    ) -> Result<Flow> {
        let worker_node = self.node.no_id;
        let ns = self.registry.namespace();

        // Forwarding block: begin, notify both channels, duplicate the
        // event, self-confirm. Committed together with the type-specific
        // work below.
        let mut batch = SqlBatch::from_stmt("begin transaction;");
        append_event_insert(
            &mut batch,
            ns,
            self.registry.cluster_name(),
            self.registry.local_node_id(),
            event,
        );

        if event.ev_type == EventType::Sync {
            loop {
                batch
                    .execute(local_conn)
                    .await
                    .context("event forwarding transaction failed")?;

                match sync_event(&self.registry, local_conn, wd, providers, worker_node, event)
                    .await
                {
                    Ok(()) => break,
                    Err(RetryAfter(secs)) => {
                        SqlBatch::from_stmt("rollback transaction;")
                            .execute(local_conn)
                            .await
                            .context("rollback of failed SYNC")?;
                        if !self.sched.msleep(secs * 1000).await.is_ok() {
                            return Ok(Flow::Stop);
                        }
                    }
                }
            }
            SqlBatch::from_stmt("commit transaction;")
                .execute(local_conn)
                .await
                .context("commit of SYNC transaction")?;
            return Ok(Flow::Continue);
        }

        self.apply_config_event(&mut batch, local_conn, event).await
    }

    /// Mutate the registry and append the matching stored-procedure call,
    /// then commit. ENABLE_SUBSCRIPTION additionally performs the initial
    /// data copy with backoff before the commit.
    async fn apply_config_event(
        &self,
        batch: &mut SqlBatch,
        local_conn: &mut PgConnection,
        event: &Event,
    ) -> Result<Flow> {
        let worker_node = self.node.no_id;
        let local_id = self.registry.local_node_id();
        let ns = self.registry.namespace();

        match &event.ev_type {
            EventType::StoreNode => {
                let no_id = event.int_arg(1)?;
                let comment = event.arg(2).unwrap_or("");
                if no_id != local_id {
                    self.registry.store_node(no_id, comment);
                }
                batch.append(format!(
                    "select {ns}.storeNode_int({no_id}, '{}');",
                    quote_literal(comment)
                ));
            }
            EventType::EnableNode => {
                let no_id = event.int_arg(1)?;
                if no_id != local_id {
                    self.registry.enable_node(no_id);
                }
                batch.append(format!("select {ns}.enableNode_int({no_id});"));
            }
            EventType::StorePath => {
                let pa_server = event.int_arg(1)?;
                let pa_client = event.int_arg(2)?;
                let pa_conninfo = event.arg(3).unwrap_or("");
                let pa_connretry = event.int_arg(4)?;
                if pa_client == local_id {
                    self.registry
                        .store_path(pa_server, pa_conninfo, pa_connretry as u64);
                }
                batch.append(format!(
                    "select {ns}.storePath_int({pa_server}, {pa_client}, '{}', {pa_connretry});",
                    quote_literal(pa_conninfo)
                ));
            }
            EventType::StoreListen => {
                let li_origin = event.int_arg(1)?;
                let li_provider = event.int_arg(2)?;
                let li_receiver = event.int_arg(3)?;
                if li_receiver == local_id {
                    self.registry.store_listen(li_origin, li_provider);
                }
                batch.append(format!(
                    "select {ns}.storeListen_int({li_origin}, {li_provider}, {li_receiver});"
                ));
            }
            EventType::StoreSet => {
                let set_id = event.int_arg(1)?;
                let set_origin = event.int_arg(2)?;
                let set_comment = event.arg(3).unwrap_or("");
                if set_origin != local_id {
                    self.registry.store_set(set_id, set_origin, set_comment);
                }
                batch.append(format!(
                    "select {ns}.storeSet_int({set_id}, {set_origin}, '{}');",
                    quote_literal(set_comment)
                ));
            }
            EventType::SubscribeSet => {
                let sub_set = event.int_arg(1)?;
                let sub_provider = event.int_arg(2)?;
                let sub_receiver = event.int_arg(3)?;
                let sub_forward = event.arg(4).unwrap_or("f");
                if sub_receiver == local_id {
                    self.registry
                        .store_subscribe(sub_set, sub_provider, sub_forward == "t");
                }
                batch.append(format!(
                    "select {ns}.subscribeSet_int({sub_set}, {sub_provider}, {sub_receiver}, '{}');",
                    quote_literal(sub_forward)
                ));
            }
            EventType::EnableSubscription => {
                let sub_set = event.int_arg(1)?;
                let sub_provider = event.int_arg(2)?;
                let sub_receiver = event.int_arg(3)?;
                let sub_forward = event.arg(4).unwrap_or("f");

                // Only enable (and copy) when we are the receiver and the
                // event reached us through the designated provider.
                if sub_receiver == local_id && sub_provider == worker_node {
                    self.registry
                        .enable_subscription(sub_set, sub_provider, sub_forward == "t");

                    let mut sleeptime = COPY_RETRY_START_SECS;
                    loop {
                        batch
                            .execute(local_conn)
                            .await
                            .context("event forwarding transaction failed")?;

                        match copy_set(&self.registry, local_conn, worker_node, sub_set).await {
                            Ok(()) => {
                                // The transaction already carries the copy;
                                // only the commit below remains.
                                batch.reset();
                                break;
                            }
                            Err(err) => {
                                warn!(
                                    node = worker_node,
                                    set = sub_set,
                                    err = %format!("{err:#}"),
                                    sleep_secs = sleeptime,
                                    "data copy for set failed - retrying"
                                );
                                SqlBatch::from_stmt("rollback transaction;")
                                    .execute(local_conn)
                                    .await
                                    .context("rollback of failed copy")?;
                                if !self.sched.msleep(sleeptime * 1000).await.is_ok() {
                                    return Ok(Flow::Stop);
                                }
                                if sleeptime < COPY_RETRY_CAP_SECS {
                                    sleeptime *= 2;
                                }
                            }
                        }
                    }
                }
            }
            EventType::SetAddTable => {
                // Table information is picked up during copy_set; nothing
                // to do until subscribed sets can grow.
            }
            EventType::Other(ev_type) => {
                warn!(
                    node = worker_node,
                    origin = event.origin,
                    seqno = event.seqno,
                    ev_type = %ev_type,
                    "unknown event type - forwarded unchanged"
                );
            }
            EventType::Sync => unreachable!("SYNC handled by process_event"),
        }

        batch.append("commit transaction;");
        batch
            .execute(local_conn)
            .await
            .context("commit of configuration event")?;
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_tunables() {
        let config = WorkerConfig::default();
        assert_eq!(config.fetch_size, 100);
        assert_eq!(config.lines_per_helper, 50);
    }

    #[test]
    fn copy_backoff_doubles_to_cap() {
        let mut sleeptime = COPY_RETRY_START_SECS;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(sleeptime);
            if sleeptime < COPY_RETRY_CAP_SECS {
                sleeptime *= 2;
            }
        }
        assert_eq!(seen, vec![15, 30, 60, 60, 60]);
    }
}
