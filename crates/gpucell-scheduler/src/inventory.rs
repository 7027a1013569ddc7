//! Initial inventory: physical cells placed into the coarsest free lists

use gpucell_core::{CellId, GpucellError, GpucellResult, PhysicalCellConfig, MAX_GPUS_PER_NODE};
use std::sync::Arc;
use tracing::info;

use crate::chain::CellChains;
use crate::engine::{Cell, CellAllocator};
use crate::priority::GpuPriority;

/// Build an allocator holding every discovered coarsest-level cell as Free.
///
/// Finer cells are created lazily when a coarse cell is first split.
pub fn build_inventory(
    chains: Arc<CellChains>,
    priority: GpuPriority,
    cells: &[PhysicalCellConfig],
) -> GpucellResult<CellAllocator> {
    let mut allocator = CellAllocator::new(chains, priority);
    for entry in cells {
        allocator.insert_physical_cells(entry)?;
    }

    info!(
        gpu_types = allocator.chains.len(),
        cells = allocator.capacity.iter().sum::<usize>(),
        "Cell inventory constructed"
    );
    Ok(allocator)
}

impl CellAllocator {
    /// Add one node's coarsest-level cells as Free.
    ///
    /// Fails when the entry names an unknown GPU type or a level other than the
    /// coarsest one, declares more than [`MAX_GPUS_PER_NODE`] cells, or when the
    /// node already contributes cells of that type.
    pub fn insert_physical_cells(&mut self, entry: &PhysicalCellConfig) -> GpucellResult<Vec<CellId>> {
        let t = self.chains.type_index(&entry.gpu_type).ok_or_else(|| {
            GpucellError::Inventory(format!(
                "node {} references unknown GPU type {}",
                entry.node, entry.gpu_type
            ))
        })?;

        if let Some(level) = &entry.level {
            match self.chains.locate(&entry.gpu_type, level) {
                None => {
                    return Err(GpucellError::Inventory(format!(
                        "node {} references unknown level {} of GPU type {}",
                        entry.node, level, entry.gpu_type
                    )));
                }
                Some((_, depth)) if depth != 0 => {
                    return Err(GpucellError::Inventory(format!(
                        "node {} declares {} cells; only the coarsest level of {} can be discovered",
                        entry.node, level, entry.gpu_type
                    )));
                }
                Some(_) => {}
            }
        }
        if entry.node.is_empty() {
            return Err(GpucellError::Inventory(format!(
                "{} cells declared without a node",
                entry.gpu_type
            )));
        }
        if entry.count == 0 {
            return Err(GpucellError::Inventory(format!(
                "node {} declares no {} cells",
                entry.node, entry.gpu_type
            )));
        }
        if entry.count > MAX_GPUS_PER_NODE {
            return Err(GpucellError::Inventory(format!(
                "node {} declares {} {} cells, at most {} allowed",
                entry.node, entry.count, entry.gpu_type, MAX_GPUS_PER_NODE
            )));
        }
        if !self.nodes[t].insert(entry.node.clone()) {
            return Err(GpucellError::Inventory(format!(
                "node {} already holds {} cells",
                entry.node, entry.gpu_type
            )));
        }

        let node: Arc<str> = Arc::from(entry.node.as_str());
        let mut ids = Vec::with_capacity(entry.count as usize);
        for i in 0..entry.count {
            let cell = Cell::new(t, 0, node.clone(), format!("{}/gpu{}", entry.node, i));
            let id = self.arena.insert(cell);
            self.push_free(id)?;
            ids.push(id);
        }
        self.capacity[t] += ids.len();

        info!(
            node = %entry.node,
            gpu_type = %entry.gpu_type,
            cells = ids.len(),
            "Added physical cells"
        );
        Ok(ids)
    }
}
