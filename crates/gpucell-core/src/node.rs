//! Cluster nodes and topology events

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::{DiscoveryConfig, PhysicalCellConfig};
use crate::{GpucellError, GpucellResult};

/// A cluster node as reported by node discovery
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Allocatable resources by name (e.g. "nvidia.com/gpu" -> 4)
    #[serde(default)]
    pub capacity: HashMap<String, u64>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_capacity(mut self, resource: impl Into<String>, amount: u64) -> Self {
        self.capacity.insert(resource.into(), amount);
        self
    }

    /// Whether the node carries shareable GPUs according to `discovery`
    pub fn is_gpu_node(&self, discovery: &DiscoveryConfig) -> bool {
        self.labels.get(&discovery.gpu_label).map(String::as_str) == Some("true")
            && self.labels.contains_key(&discovery.model_label)
            && self.gpu_count(discovery) > 0
    }

    /// Number of physical GPUs advertised by the capacity resource
    pub fn gpu_count(&self, discovery: &DiscoveryConfig) -> u64 {
        self.capacity
            .get(&discovery.capacity_resource)
            .copied()
            .unwrap_or(0)
    }

    /// Coarsest-level cells this node contributes, or `None` for non-GPU nodes.
    ///
    /// Fails when the node advertises more than `discovery.max_gpus_per_node`.
    pub fn physical_cells(
        &self,
        discovery: &DiscoveryConfig,
    ) -> GpucellResult<Option<PhysicalCellConfig>> {
        if !self.is_gpu_node(discovery) {
            return Ok(None);
        }
        let Some(gpu_type) = self.labels.get(&discovery.model_label) else {
            return Ok(None);
        };

        let gpus = self.gpu_count(discovery);
        let count = u32::try_from(gpus)
            .ok()
            .filter(|n| *n <= discovery.max_gpus_per_node)
            .ok_or_else(|| {
                GpucellError::Inventory(format!(
                    "node {} advertises {} GPUs, at most {} allowed",
                    self.name, gpus, discovery.max_gpus_per_node
                ))
            })?;

        Ok(Some(PhysicalCellConfig {
            node: self.name.clone(),
            gpu_type: gpu_type.clone(),
            level: None,
            count,
        }))
    }
}

/// Node change observed by the topology watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "node", rename_all = "lowercase")]
pub enum NodeEvent {
    Added(Node),
    Updated(Node),
    Removed(Node),
}

impl NodeEvent {
    pub fn node(&self) -> &Node {
        match self {
            NodeEvent::Added(n) | NodeEvent::Updated(n) | NodeEvent::Removed(n) => n,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeEvent::Added(_) => "added",
            NodeEvent::Updated(_) => "updated",
            NodeEvent::Removed(_) => "removed",
        }
    }
}
