/// Background loops for hubs.
///
/// Each loop is an independent tokio task on a fixed interval. Shutdown is
/// cooperative: the signal is checked between ticks, so a tick that is
/// already running (a queue transaction, a reconcile cycle) completes
/// before the task exits.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::hub::{MainHub, MiniHub};

/// How often an edge hub drops stalled reassembly entries.
pub const REASSEMBLY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Handles of a hub's background loops.
pub struct TaskSet {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskSet {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Run `tick` every `period` until shutdown. The first tick fires one
    /// full period after spawn.
    fn spawn_loop<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    _ = stop.changed() => break,
                }
            }
            tracing::debug!("{name} loop stopped");
        });
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every loop to stop and wait for all of them to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::warn!("{name} loop ended abnormally: {e}");
            }
        }
    }
}

/// Retransmit scheduler, manifest poll and reassembly sweep for an edge hub.
pub fn spawn_edge_tasks(hub: Arc<MiniHub>) -> TaskSet {
    let mut tasks = TaskSet::new();
    let config = hub.config().clone();

    let retransmit_hub = hub.clone();
    tasks.spawn_loop("retransmit", config.retransmit.tick, move || {
        let hub = retransmit_hub.clone();
        async move {
            match hub.process_retransmits(arc_transport::now_ms()).await {
                Ok(report) if report.delivered + report.rescheduled + report.exhausted > 0 => {
                    tracing::debug!("{}: retransmit tick {report:?}", hub.node_id());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("{}: retransmit tick failed: {e}", hub.node_id()),
            }
        }
    });

    let poll_hub = hub.clone();
    tasks.spawn_loop("manifest-poll", config.capsule.gossip_interval, move || {
        let hub = poll_hub.clone();
        async move {
            if let Err(e) = hub.sync_with_authority().await {
                tracing::warn!("{}: manifest poll failed: {e}", hub.node_id());
            }
        }
    });

    tasks.spawn_loop("reassembly-sweep", REASSEMBLY_SWEEP_INTERVAL, move || {
        let hub = hub.clone();
        async move {
            let dropped = hub.sweep_reassembly();
            if dropped > 0 {
                tracing::warn!("{}: dropped {dropped} stalled partial transfers", hub.node_id());
            }
        }
    });

    tasks
}

/// Manifest broadcast loop for the authority.
pub fn spawn_authority_tasks(hub: Arc<MainHub>) -> TaskSet {
    let mut tasks = TaskSet::new();
    let period = hub.config().capsule.manifest_interval;

    tasks.spawn_loop("manifest-broadcast", period, move || {
        let hub = hub.clone();
        async move {
            match hub.broadcast_manifest().await {
                Ok(report) if !report.failed.is_empty() => {
                    tracing::warn!("{}: manifest not delivered to {:?}", hub.node_id(), report.failed);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("{}: manifest broadcast failed: {e}", hub.node_id()),
            }
        }
    });

    tasks
}
