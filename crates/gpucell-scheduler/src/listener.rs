//! Topology change listener: folds newly observed GPU nodes into the inventory

use async_trait::async_trait;
use gpucell_core::NodeEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;

/// Stream of node events, e.g. a cluster node watch
#[async_trait]
pub trait NodeSource: Send {
    /// Next event, or `None` once the source is closed
    async fn next_event(&mut self) -> Option<NodeEvent>;
}

/// Node source fed through an in-process channel
pub struct ChannelNodeSource {
    rx: mpsc::Receiver<NodeEvent>,
}

#[async_trait]
impl NodeSource for ChannelNodeSource {
    async fn next_event(&mut self) -> Option<NodeEvent> {
        self.rx.recv().await
    }
}

/// Create a bounded channel whose receiving end is a [`NodeSource`]
pub fn node_event_channel(buffer: usize) -> (mpsc::Sender<NodeEvent>, ChannelNodeSource) {
    let (tx, rx) = mpsc::channel(buffer);
    (tx, ChannelNodeSource { rx })
}

/// Applies node events to the shared scheduler.
///
/// Only additions are applied. Updated and removed nodes keep their cells
/// until restart.
pub struct TopologyListener<S> {
    scheduler: Arc<Scheduler>,
    source: S,
}

impl<S: NodeSource + 'static> TopologyListener<S> {
    pub fn new(scheduler: Arc<Scheduler>, source: S) -> Self {
        Self { scheduler, source }
    }

    /// Consume events until the source closes
    pub async fn run(mut self) {
        info!("Topology listener started");
        while let Some(event) = self.source.next_event().await {
            apply_event(&self.scheduler, &event).await;
        }
        info!("Topology listener stopped");
    }

    /// Run on a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Apply one event; returns the number of cells added
    pub async fn handle(&self, event: &NodeEvent) -> usize {
        apply_event(&self.scheduler, event).await
    }
}

async fn apply_event(scheduler: &Scheduler, event: &NodeEvent) -> usize {
    let node = event.node();
    if !node.is_gpu_node(scheduler.discovery()) {
        debug!(node = %node.name, event = event.kind(), "Skipping non-GPU node");
        return 0;
    }

    match event {
        NodeEvent::Added(node) => match scheduler.add_node(node).await {
            Ok(0) => 0,
            Ok(added) => {
                info!(node = %node.name, cells = added, "GPU node added");
                added
            }
            Err(e) => {
                warn!(node = %node.name, error = %e, "Failed to add GPU node");
                0
            }
        },
        NodeEvent::Updated(_) | NodeEvent::Removed(_) => {
            warn!(
                node = %node.name,
                event = event.kind(),
                "Node change not applied; cells stay in the inventory until restart"
            );
            0
        }
    }
}
