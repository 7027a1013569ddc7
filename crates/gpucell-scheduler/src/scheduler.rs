//! Shared, lock-guarded handle over the cell allocator

use gpucell_core::{
    CellId, CellInfo, DiscoveryConfig, GpucellConfig, GpucellResult, Node, ResourceRequest,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::chain::build_cell_chains;
use crate::engine::{CellAllocator, InventorySnapshot};
use crate::inventory::build_inventory;
use crate::placement::Candidate;
use crate::priority::GpuPriority;

/// Entry point for scheduling hooks.
///
/// Every mutation takes the write lock for one reserve/release step, so
/// concurrent callers never observe or produce a torn free list. Reads share
/// the lock. Nothing here waits on anything but the lock itself.
pub struct Scheduler {
    allocator: RwLock<CellAllocator>,
    discovery: DiscoveryConfig,
}

impl Scheduler {
    /// Wrap an already constructed allocator
    pub fn new(allocator: CellAllocator, discovery: DiscoveryConfig) -> Self {
        Self {
            allocator: RwLock::new(allocator),
            discovery,
        }
    }

    /// Build chains, priority index and inventory from configuration
    pub fn from_config(config: &GpucellConfig) -> GpucellResult<Self> {
        let chains = Arc::new(build_cell_chains(&config.gpu_types)?);
        let priority = GpuPriority::new(&chains);
        let allocator = build_inventory(chains, priority, &config.cells)?;

        info!(
            gpu_types = ?allocator.priority().sorted(),
            "Scheduler initialized"
        );
        Ok(Self::new(allocator, config.discovery.clone()))
    }

    pub fn discovery(&self) -> &DiscoveryConfig {
        &self.discovery
    }

    pub async fn try_reserve(
        &self,
        gpu_type: &str,
        level: &str,
        requester: &str,
    ) -> GpucellResult<Option<CellInfo>> {
        self.allocator
            .write()
            .await
            .try_reserve(gpu_type, level, requester)
    }

    pub async fn try_reserve_on(
        &self,
        gpu_type: &str,
        level: &str,
        requester: &str,
        node: &str,
    ) -> GpucellResult<Option<CellInfo>> {
        self.allocator
            .write()
            .await
            .try_reserve_on(gpu_type, level, requester, node)
    }

    /// Reserve from the most preferred GPU type with capacity
    pub async fn reserve(
        &self,
        request: &ResourceRequest,
        requester: &str,
        node: Option<&str>,
    ) -> GpucellResult<Option<CellInfo>> {
        let reserved = self
            .allocator
            .write()
            .await
            .reserve_best(request, requester, node)?;
        if reserved.is_none() {
            debug!(requester = requester, request = ?request, "No capacity for request");
        }
        Ok(reserved)
    }

    pub async fn release(&self, id: CellId) -> GpucellResult<CellInfo> {
        let result = self.allocator.write().await.release(id);
        if let Err(e) = &result {
            warn!(cell = %id, error = %e, "Release rejected");
        }
        result
    }

    pub async fn release_owner(&self, requester: &str) -> GpucellResult<usize> {
        self.allocator.write().await.release_owner(requester)
    }

    pub async fn select_gpu_types(&self, request: &ResourceRequest) -> Vec<Candidate> {
        self.allocator.read().await.select_gpu_types(request)
    }

    pub async fn inspect(&self, gpu_type: &str, level: &str) -> GpucellResult<usize> {
        self.allocator.read().await.inspect(gpu_type, level)
    }

    pub async fn cell(&self, id: CellId) -> Option<CellInfo> {
        self.allocator.read().await.get(id)
    }

    pub async fn allocated(&self) -> Vec<CellInfo> {
        self.allocator.read().await.allocated()
    }

    pub async fn snapshot(&self) -> InventorySnapshot {
        self.allocator.read().await.snapshot()
    }

    pub async fn check_invariants(&self) -> GpucellResult<()> {
        self.allocator.read().await.check_invariants()
    }

    /// Fold a newly observed node into the inventory.
    ///
    /// Returns the number of coarsest cells added: zero for nodes that are not
    /// GPU nodes or that already contribute cells.
    pub async fn add_node(&self, node: &Node) -> GpucellResult<usize> {
        let Some(cells) = node.physical_cells(&self.discovery)? else {
            debug!(node = %node.name, "Ignoring node without shareable GPUs");
            return Ok(0);
        };

        let mut allocator = self.allocator.write().await;
        if allocator.has_node(&cells.gpu_type, &cells.node) {
            debug!(node = %node.name, gpu_type = %cells.gpu_type, "Node already in inventory");
            return Ok(0);
        }
        let added = allocator.insert_physical_cells(&cells)?;
        Ok(added.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use gpucell_core::GpucellError;
    use std::collections::HashSet;

    const CONFIG: &str = r#"
[[gpu_types]]
name = "V100"
priority = 100
levels = [
  { name = "gpu", split = 2 },
  { name = "half", parent = "gpu", split = 2 },
  { name = "quarter", parent = "half" },
]

[[gpu_types]]
name = "T4"
priority = 10
levels = [
  { name = "gpu", split = 2 },
  { name = "half", parent = "gpu" },
]

[[cells]]
node = "node-1"
gpu_type = "V100"
count = 2

[[cells]]
node = "node-2"
gpu_type = "T4"
count = 1
"#;

    fn scheduler() -> Scheduler {
        Scheduler::from_config(&GpucellConfig::from_toml(CONFIG).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_from_config() {
        let scheduler = scheduler();
        assert_eq!(scheduler.inspect("V100", "gpu").await.unwrap(), 2);
        assert_eq!(scheduler.inspect("T4", "gpu").await.unwrap(), 1);

        let snapshot = scheduler.snapshot().await;
        let order: Vec<&str> = snapshot.gpu_types.iter().map(|t| t.gpu_type.as_str()).collect();
        assert_eq!(order, vec!["V100", "T4"]);
    }

    #[tokio::test]
    async fn test_from_config_rejects_bad_inventory() {
        let config = GpucellConfig::from_toml(&format!(
            "{}\n[[cells]]\nnode = \"node-3\"\ngpu_type = \"A100\"\n",
            CONFIG
        ))
        .unwrap();
        assert!(matches!(
            Scheduler::from_config(&config),
            Err(GpucellError::Inventory(_))
        ));
    }

    #[tokio::test]
    async fn test_select_and_reserve() {
        let scheduler = scheduler();
        let request = ResourceRequest::fraction(0.5).unwrap();

        let candidates = scheduler.select_gpu_types(&request).await;
        assert_eq!(candidates[0].gpu_type, "V100");
        assert_eq!(candidates[1].gpu_type, "T4");

        let cell = scheduler.reserve(&request, "pod-a", None).await.unwrap().unwrap();
        assert_eq!(cell.gpu_type, "V100");
        assert_eq!(cell.level, "half");

        let t4_only = request.clone().with_gpu_types(["T4"]);
        let cell = scheduler.reserve(&t4_only, "pod-b", None).await.unwrap().unwrap();
        assert_eq!(cell.gpu_type, "T4");
        assert_eq!(cell.node, "node-2");
    }

    #[tokio::test]
    async fn test_release_round_trip() {
        let scheduler = scheduler();
        let cell = scheduler
            .try_reserve("V100", "quarter", "pod-a")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.allocated().await.len(), 1);

        let released = scheduler.release(cell.id).await.unwrap();
        assert_eq!(released.owner, None);
        assert!(scheduler.release(cell.id).await.is_err());
        assert_eq!(scheduler.inspect("V100", "gpu").await.unwrap(), 2);
        scheduler.check_invariants().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_node() {
        let scheduler = scheduler();
        let node = Node::new("node-3")
            .with_label("SharedGPU", "true")
            .with_label("sharedgpu/gpu_model", "V100")
            .with_capacity("nvidia.com/gpu", 2);

        assert_eq!(scheduler.add_node(&node).await.unwrap(), 2);
        assert_eq!(scheduler.add_node(&node).await.unwrap(), 0);
        assert_eq!(scheduler.inspect("V100", "gpu").await.unwrap(), 4);

        let cell = scheduler
            .try_reserve_on("V100", "gpu", "pod-a", "node-3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cell.address, "node-3/gpu0");

        assert_eq!(scheduler.add_node(&Node::new("cpu-node")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_add_node_with_unknown_model() {
        let scheduler = scheduler();
        let node = Node::new("node-4")
            .with_label("SharedGPU", "true")
            .with_label("sharedgpu/gpu_model", "A100")
            .with_capacity("nvidia.com/gpu", 1);

        assert!(matches!(
            scheduler.add_node(&node).await,
            Err(GpucellError::Inventory(_))
        ));
    }

    #[tokio::test]
    async fn test_add_node_over_gpu_limit() {
        let scheduler = scheduler();
        let node = Node::new("node-5")
            .with_label("SharedGPU", "true")
            .with_label("sharedgpu/gpu_model", "V100")
            .with_capacity("nvidia.com/gpu", 1 << 40);

        let err = scheduler.add_node(&node).await.unwrap_err();
        assert!(matches!(err, GpucellError::Inventory(_)));
        assert_eq!(scheduler.inspect("V100", "gpu").await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_never_share_a_cell() {
        let scheduler = Arc::new(scheduler());

        // two V100s hold 8 quarters
        let tasks = (0..16).map(|i| {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler
                    .try_reserve("V100", "quarter", &format!("pod-{}", i))
                    .await
                    .unwrap()
            })
        });
        let results = join_all(tasks).await;

        let cells: Vec<CellInfo> = results
            .into_iter()
            .filter_map(|r| r.unwrap())
            .collect();
        assert_eq!(cells.len(), 8);

        let ids: HashSet<CellId> = cells.iter().map(|c| c.id).collect();
        assert_eq!(ids.len(), 8);
        let addresses: HashSet<&str> = cells.iter().map(|c| c.address.as_str()).collect();
        assert_eq!(addresses.len(), 8);
        scheduler.check_invariants().await.unwrap();

        let releases = cells.iter().map(|c| {
            let scheduler = scheduler.clone();
            let id = c.id;
            tokio::spawn(async move { scheduler.release(id).await })
        });
        for r in join_all(releases).await {
            r.unwrap().unwrap();
        }
        assert_eq!(scheduler.inspect("V100", "gpu").await.unwrap(), 2);
        scheduler.check_invariants().await.unwrap();
    }
}
