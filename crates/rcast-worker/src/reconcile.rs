//! Bringing the provider contexts into agreement with the registry.
//!
//! Runs whenever the configuration generation moves, and once in cleanup
//! mode when the worker exits. Every helper lock is held from the moment
//! its set-list is cleared until the final decision about that provider, so
//! a helper never observes a half-rebuilt workgroup.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::Connection;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use rcast_model::NodeId;
use rcast_runtime::Registry;

use crate::helper::{spawn_helper, HelperSpec};
use crate::lines::WorkData;
use crate::provider::{HelperHandle, HelperState, HelperStatus, ProviderContext, ProviderSet};
use crate::worker::WorkerConfig;

pub async fn reconcile_providers(
    registry: &Registry,
    wd: &Arc<WorkData>,
    providers: &mut Vec<ProviderContext>,
    config: &WorkerConfig,
    worker_node: NodeId,
    cleanup: bool,
) {
    debug!(node = worker_node, cleanup, "update provider configuration");

    // Step 1: lock every helper and drop its set-list. The guards stay held
    // until the provider's fate is decided below.
    let mut guards: HashMap<NodeId, OwnedMutexGuard<HelperState>> = HashMap::new();
    for ctx in providers.iter_mut() {
        guards.insert(ctx.no_id, ctx.handle.lock_owned().await);
        ctx.sets.clear();
    }

    // Step 2: re-add every actively replicated set, creating providers as
    // needed. Skipped in cleanup mode so every provider becomes obsolete.
    if !cleanup {
        for set in registry.replicated_sets() {
            let Some(provider_id) = set.sub_provider else {
                continue;
            };
            if !set.sub_active {
                continue;
            }

            if !providers.iter().any(|c| c.no_id == provider_id) {
                let handle = HelperHandle::new();
                guards.insert(provider_id, handle.lock_owned().await);
                let task = spawn_helper(
                    HelperSpec {
                        worker_node,
                        provider_node: provider_id,
                        namespace: registry.namespace().to_string(),
                        fetch_size: config.fetch_size,
                    },
                    handle.clone(),
                    wd.clone(),
                );
                wd.contribute_lines(config.lines_per_helper).await;

                let (pa_conninfo, pa_connretry) = match registry.find_node(provider_id) {
                    Some(node) => (node.pa_conninfo(), node.pa_connretry()),
                    None => (None, 10),
                };
                providers.push(ProviderContext {
                    no_id: provider_id,
                    pa_conninfo,
                    pa_connretry,
                    sets: Vec::new(),
                    handle,
                    task,
                });
                info!(
                    node = worker_node,
                    provider = provider_id,
                    "helper task for provider created"
                );
            }

            let ctx = providers
                .iter_mut()
                .find(|c| c.no_id == provider_id)
                .expect("provider just ensured");
            ctx.sets.push(ProviderSet {
                set_id: set.set_id,
                sub_forward: set.sub_forward,
            });
            debug!(
                node = worker_node,
                set = set.set_id,
                provider = provider_id,
                "added active set to provider"
            );
        }
    }

    // Step 3: retire providers left without sets; refresh dial info on the
    // survivors and release their helpers.
    let mut survivors = Vec::with_capacity(providers.len());
    for mut ctx in providers.drain(..) {
        let mut guard = guards.remove(&ctx.no_id).expect("helper guard held");

        if ctx.sets.is_empty() {
            guard.status = HelperStatus::Exit;
            let conn = guard.conn.take();
            drop(guard);
            ctx.handle.signal();
            if let Err(err) = ctx.task.await {
                warn!(provider = ctx.no_id, %err, "helper task join failed");
            }
            info!(
                node = worker_node,
                provider = ctx.no_id,
                "helper task for provider terminated"
            );
            if let Some(conn) = conn {
                info!(
                    node = worker_node,
                    provider = ctx.no_id,
                    "disconnecting from data provider"
                );
                let _ = conn.close().await;
            }
            continue;
        }

        // A changed connection string invalidates the existing session; it
        // will be re-dialled on the next SYNC.
        let current = registry
            .find_node(ctx.no_id)
            .and_then(|node| node.pa_conninfo());
        if current != ctx.pa_conninfo {
            if let Some(conn) = guard.conn.take() {
                info!(
                    node = worker_node,
                    provider = ctx.no_id,
                    "conninfo changed - disconnecting from data provider"
                );
                let _ = conn.close().await;
            }
            ctx.pa_conninfo = current;
            if let Some(node) = registry.find_node(ctx.no_id) {
                ctx.pa_connretry = node.pa_connretry();
            }
        }

        drop(guard);
        survivors.push(ctx);
    }
    *providers = survivors;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lines::WorkGroupStatus;

    fn registry_with_subscription(active: bool) -> Registry {
        let reg = Registry::new(2, "rowcast", "dbname=node2");
        reg.store_node(1, "origin");
        reg.enable_node(1);
        reg.store_path(1, "dbname=origin", 10);
        reg.store_set(1, 1, "first set");
        if active {
            reg.enable_subscription(1, 1, false);
        } else {
            reg.store_subscribe(1, 1, false);
        }
        reg
    }

    #[tokio::test]
    async fn reconcile_creates_and_reaps_providers() {
        let reg = registry_with_subscription(true);
        let wd = Arc::new(WorkData::new());
        let config = WorkerConfig::default();
        let mut providers = Vec::new();

        reconcile_providers(&reg, &wd, &mut providers, &config, 1, false).await;
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].no_id, 1);
        assert_eq!(providers[0].sets, vec![ProviderSet { set_id: 1, sub_forward: false }]);
        assert_eq!(providers[0].pa_conninfo.as_deref(), Some("dbname=origin"));
        assert_eq!(wd.pool_len().await, config.lines_per_helper);

        // Subscription goes away: the provider must be reaped and its
        // helper joined within this one reconcile.
        reg.store_subscribe(1, 1, false); // deactivates
        reconcile_providers(&reg, &wd, &mut providers, &config, 1, false).await;
        assert!(providers.is_empty());
    }

    #[tokio::test]
    async fn inactive_subscriptions_produce_no_provider() {
        let reg = registry_with_subscription(false);
        let wd = Arc::new(WorkData::new());
        let mut providers = Vec::new();

        reconcile_providers(&reg, &wd, &mut providers, &WorkerConfig::default(), 1, false).await;
        assert!(providers.is_empty());
    }

    #[tokio::test]
    async fn cleanup_mode_tears_everything_down() {
        let reg = registry_with_subscription(true);
        let wd = Arc::new(WorkData::new());
        let mut providers = Vec::new();

        reconcile_providers(&reg, &wd, &mut providers, &WorkerConfig::default(), 1, false).await;
        assert_eq!(providers.len(), 1);

        reconcile_providers(&reg, &wd, &mut providers, &WorkerConfig::default(), 1, true).await;
        assert!(providers.is_empty());
        assert_eq!(wd.status().await, WorkGroupStatus::Idle);
    }

    #[tokio::test]
    async fn conninfo_change_survives_with_new_dial_info() {
        let reg = registry_with_subscription(true);
        let wd = Arc::new(WorkData::new());
        let mut providers = Vec::new();

        reconcile_providers(&reg, &wd, &mut providers, &WorkerConfig::default(), 1, false).await;
        reg.store_path(1, "host=replica2 dbname=origin", 30);
        reconcile_providers(&reg, &wd, &mut providers, &WorkerConfig::default(), 1, false).await;

        assert_eq!(providers.len(), 1);
        assert_eq!(
            providers[0].pa_conninfo.as_deref(),
            Some("host=replica2 dbname=origin")
        );
        assert_eq!(providers[0].pa_connretry, 30);

        // Tear down so the helper task does not outlive the test runtime.
        reconcile_providers(&reg, &wd, &mut providers, &WorkerConfig::default(), 1, true).await;
    }
}
