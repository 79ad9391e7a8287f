//! Online/offline tracking.
//!
//! The host (or the health probe) flips the flag; everything else watches
//! it. Remote steps race a receiver so an offline flip aborts them promptly.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::remote::RemoteStore;

#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the flag. Receivers are only woken on an actual flip; the
    /// return value says whether one happened.
    pub fn set_online(&self, online: bool) -> bool {
        let flipped = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if flipped {
            if online {
                info!("Connectivity: online");
            } else {
                info!("Connectivity: offline");
            }
        }
        flipped
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Poll the remote health endpoint every `interval` and feed the result
    /// into the monitor until `cancel` fires.
    pub fn spawn_health_probe(
        self: &Arc<Self>,
        remote: Arc<dyn RemoteStore>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!("Health probe started (interval: {}s)", interval.as_secs());
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let reachable = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = tokio::time::timeout(interval, remote.health_check()) => {
                        match result {
                            Ok(Ok(())) => true,
                            Ok(Err(e)) => {
                                debug!("Health check failed: {e}");
                                false
                            }
                            Err(_) => {
                                debug!("Health check timed out");
                                false
                            }
                        }
                    }
                };
                monitor.set_online(reachable);
            }
            info!("Health probe stopped");
        })
    }
}

/// Resolve once `rx` reports offline. Never resolves if the sender is gone.
pub(crate) async fn wait_offline(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|online| !*online).await.is_err() {
        std::future::pending::<()>().await;
    }
}
