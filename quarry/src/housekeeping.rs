//! Background task spawners for the misfire handler and cluster manager.
//!
//! The embedding scheduler may run both loops itself by calling
//! `recover_misfires` / `check_cluster` on its own timers; these spawners
//! wrap that in tokio tasks that exit on store shutdown. Both loops absorb
//! errors, reporting them through the signaler, and never propagate.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::delegate::Delegate;
use crate::store::JobStore;

impl<D: Delegate> JobStore<D> {
    /// Spawn the periodic misfire handler.
    ///
    /// The scan repeats every misfire threshold, or immediately while a
    /// pass reports more misfired triggers beyond its page.
    pub fn spawn_misfire_handler(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let shutdown = store.shutdown_token();
            let cancel = CancelToken::new();
            let period =
                std::time::Duration::from_millis(store.config().misfire_threshold_ms.max(1_000));

            loop {
                match store.recover_misfires(&cancel).await {
                    Ok(result) if result.has_more => {
                        // another page is waiting; go again without sleeping
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("misfire handler pass failed: {err}");
                        store
                            .signaler()
                            .notify_scheduler_listeners_error(
                                "misfire recovery pass failed",
                                &err,
                            )
                            .await;
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("misfire handler shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(period) => {}
                }
            }
        })
    }

    /// Spawn the periodic cluster check-in task. No-op loop when clustering
    /// is disabled.
    pub fn spawn_cluster_manager(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            if !store.config().clustered {
                return;
            }
            let shutdown = store.shutdown_token();
            let cancel = CancelToken::new();
            let period =
                std::time::Duration::from_millis(store.config().cluster_checkin_interval_ms);

            loop {
                match store.check_cluster(&cancel).await {
                    Ok(recovered) => {
                        if recovered {
                            info!("cluster recovery pass completed");
                        }
                    }
                    Err(err) => {
                        warn!("cluster check-in failed: {err}");
                        store
                            .signaler()
                            .notify_scheduler_listeners_error("cluster check-in failed", &err)
                            .await;
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("cluster manager shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(period) => {}
                }
            }
        })
    }
}
