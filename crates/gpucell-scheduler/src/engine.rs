//! Cell allocation engine: free lists, split-on-demand and merge-on-release

use chrono::{DateTime, Utc};
use gpucell_core::{CellId, CellInfo, CellState, GpucellError, GpucellResult, ResourceRequest};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::chain::CellChains;
use crate::placement::{select_gpu_types, Candidate};
use crate::priority::GpuPriority;

/// Arena record for one cell
#[derive(Debug, Clone)]
pub(crate) struct Cell {
    pub(crate) gpu_type: usize,
    pub(crate) depth: usize,
    pub(crate) node: Arc<str>,
    pub(crate) address: String,
    pub(crate) parent: Option<CellId>,
    pub(crate) children: Vec<CellId>,
    pub(crate) state: CellState,
    pub(crate) owner: Option<String>,
    pub(crate) allocated_at: Option<DateTime<Utc>>,
    /// Creation order, assigned by the arena and never reused
    pub(crate) seq: u64,
}

impl Cell {
    pub(crate) fn new(gpu_type: usize, depth: usize, node: Arc<str>, address: String) -> Self {
        Self {
            gpu_type,
            depth,
            node,
            address,
            parent: None,
            children: Vec::new(),
            state: CellState::Free,
            owner: None,
            allocated_at: None,
            seq: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    cell: Option<Cell>,
}

/// Slot storage for cells, addressed by generational ids
#[derive(Debug, Default)]
pub(crate) struct CellArena {
    slots: Vec<Slot>,
    /// Reused lowest index first
    vacant: BTreeSet<u32>,
    next_seq: u64,
}

impl CellArena {
    pub(crate) fn insert(&mut self, mut cell: Cell) -> CellId {
        cell.seq = self.next_seq;
        self.next_seq += 1;

        if let Some(index) = self.vacant.pop_first() {
            let slot = &mut self.slots[index as usize];
            slot.cell = Some(cell);
            return CellId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            cell: Some(cell),
        });
        CellId::new(index, 0)
    }

    pub(crate) fn get(&self, id: CellId) -> Option<&Cell> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.cell.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: CellId) -> Option<&mut Cell> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.cell.as_mut())
    }

    /// Vacate the slot; its generation moves on so `id` goes stale
    pub(crate) fn remove(&mut self, id: CellId) -> Option<Cell> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let cell = slot.cell.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.insert(id.index);
        Some(cell)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (CellId, &Cell)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.cell
                .as_ref()
                .map(|c| (CellId::new(i as u32, s.generation), c))
        })
    }
}

/// Free cells of one level of one GPU type, oldest cell first.
///
/// Keyed by creation sequence rather than `CellId`: arena indices are reused
/// after a merge, sequence numbers are not.
#[derive(Debug, Clone, Default)]
pub struct LevelCellList {
    cells: BTreeMap<u64, CellId>,
}

impl LevelCellList {
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn contains(&self, id: CellId) -> bool {
        self.cells.values().any(|c| *c == id)
    }

    pub(crate) fn insert(&mut self, seq: u64, id: CellId) -> bool {
        self.cells.insert(seq, id).is_none()
    }

    pub(crate) fn remove(&mut self, seq: u64, id: CellId) -> bool {
        match self.cells.get(&seq) {
            Some(found) if *found == id => self.cells.remove(&seq).is_some(),
            _ => false,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u64, CellId)> + '_ {
        self.cells.iter().map(|(seq, id)| (*seq, *id))
    }
}

/// Free cell counts of one level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelSnapshot {
    pub level: String,
    pub share: f64,
    pub free: usize,
}

/// Inventory state of one GPU type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuTypeSnapshot {
    pub gpu_type: String,
    pub priority: i32,
    /// Physical coarsest-level cells
    pub capacity: usize,
    /// Cells currently held by requesters
    pub allocated: usize,
    pub nodes: Vec<String>,
    pub levels: Vec<LevelSnapshot>,
}

/// Owned copy of the inventory, most preferred GPU type first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventorySnapshot {
    pub gpu_types: Vec<GpuTypeSnapshot>,
}

/// Allocation state over every GPU type.
///
/// Each cell is either Free and present in exactly one `LevelCellList`, or
/// Split/Allocated and absent from all of them. Not synchronized; the shared
/// [`crate::Scheduler`] wraps it in a lock.
pub struct CellAllocator {
    pub(crate) chains: Arc<CellChains>,
    pub(crate) priority: GpuPriority,
    pub(crate) arena: CellArena,
    /// Indexed by GPU type, then depth
    pub(crate) free_lists: Vec<Vec<LevelCellList>>,
    /// Physical coarsest cells per GPU type
    pub(crate) capacity: Vec<usize>,
    /// Nodes already contributing cells, per GPU type
    pub(crate) nodes: Vec<BTreeSet<String>>,
}

impl CellAllocator {
    /// Create an allocator with empty free lists for every chain
    pub fn new(chains: Arc<CellChains>, priority: GpuPriority) -> Self {
        let free_lists = chains
            .iter()
            .map(|c| vec![LevelCellList::default(); c.depth()])
            .collect();
        let types = chains.len();

        Self {
            chains,
            priority,
            arena: CellArena::default(),
            free_lists,
            capacity: vec![0; types],
            nodes: vec![BTreeSet::new(); types],
        }
    }

    pub fn chains(&self) -> &CellChains {
        &self.chains
    }

    pub fn priority(&self) -> &GpuPriority {
        &self.priority
    }

    fn locate(&self, gpu_type: &str, level: &str) -> GpucellResult<(usize, usize)> {
        self.chains.locate(gpu_type, level).ok_or_else(|| {
            GpucellError::InvariantViolation(format!(
                "unknown GPU type/level {}/{}",
                gpu_type, level
            ))
        })
    }

    /// Reserve a cell of `level` for `requester`, splitting coarser cells when
    /// the level has nothing free. `Ok(None)` means no capacity.
    pub fn try_reserve(
        &mut self,
        gpu_type: &str,
        level: &str,
        requester: &str,
    ) -> GpucellResult<Option<CellInfo>> {
        let (t, depth) = self.locate(gpu_type, level)?;
        self.reserve_at(t, depth, requester, None)
    }

    /// Like [`Self::try_reserve`], restricted to cells hosted on `node`
    pub fn try_reserve_on(
        &mut self,
        gpu_type: &str,
        level: &str,
        requester: &str,
        node: &str,
    ) -> GpucellResult<Option<CellInfo>> {
        let (t, depth) = self.locate(gpu_type, level)?;
        self.reserve_at(t, depth, requester, Some(node))
    }

    /// Try every eligible GPU type in priority order; stop at the first success
    pub fn reserve_best(
        &mut self,
        request: &ResourceRequest,
        requester: &str,
        node: Option<&str>,
    ) -> GpucellResult<Option<CellInfo>> {
        for candidate in self.select_gpu_types(request) {
            let (t, depth) = self.locate(&candidate.gpu_type, &candidate.level)?;
            if let Some(cell) = self.reserve_at(t, depth, requester, node)? {
                return Ok(Some(cell));
            }
            debug!(
                gpu_type = %candidate.gpu_type,
                level = %candidate.level,
                "No capacity, trying next GPU type"
            );
        }
        Ok(None)
    }

    fn reserve_at(
        &mut self,
        t: usize,
        depth: usize,
        requester: &str,
        node: Option<&str>,
    ) -> GpucellResult<Option<CellInfo>> {
        let Some(id) = self.take_free(t, depth, node)? else {
            return Ok(None);
        };

        let cell = self.cell_mut(id)?;
        cell.state = CellState::Allocated;
        cell.owner = Some(requester.to_string());
        cell.allocated_at = Some(Utc::now());

        let info = self.describe(id)?;
        info!(
            cell = %info.id,
            gpu_type = %info.gpu_type,
            level = %info.level,
            address = %info.address,
            requester = requester,
            "Reserved cell"
        );
        Ok(Some(info))
    }

    /// Pop a free cell at `depth`, splitting a coarser one if needed.
    /// The returned cell is out of every free list and still marked Free.
    fn take_free(
        &mut self,
        t: usize,
        depth: usize,
        node: Option<&str>,
    ) -> GpucellResult<Option<CellId>> {
        if let Some(id) = self.pop_free(t, depth, node)? {
            return Ok(Some(id));
        }
        if depth == 0 {
            return Ok(None);
        }
        let Some(parent) = self.take_free(t, depth - 1, node)? else {
            return Ok(None);
        };

        let children = self.split(parent)?;
        let (first, rest) = children.split_first().ok_or_else(|| {
            GpucellError::InvariantViolation(format!("split of cell {} produced no children", parent))
        })?;
        for child in rest {
            self.push_free(*child)?;
        }
        Ok(Some(*first))
    }

    fn pop_free(
        &mut self,
        t: usize,
        depth: usize,
        node: Option<&str>,
    ) -> GpucellResult<Option<CellId>> {
        let found = {
            let list = &self.free_lists[t][depth];
            match node {
                None => list.iter().next(),
                Some(node) => list
                    .iter()
                    .find(|(_, id)| self.arena.get(*id).is_some_and(|c| &*c.node == node)),
            }
        };
        let Some((seq, id)) = found else {
            return Ok(None);
        };

        self.free_lists[t][depth].remove(seq, id);
        let state = self.cell(id)?.state;
        if state != CellState::Free {
            return Err(GpucellError::InvariantViolation(format!(
                "free list holds cell {} in state {}",
                id, state
            )));
        }
        Ok(Some(id))
    }

    /// Materialize the children of a Free cell and mark it Split
    fn split(&mut self, parent: CellId) -> GpucellResult<Vec<CellId>> {
        let (t, depth, node, address) = {
            let cell = self.cell(parent)?;
            (cell.gpu_type, cell.depth, cell.node.clone(), cell.address.clone())
        };
        let fan_out = self
            .chains
            .get(t)
            .and_then(|c| c.element(depth))
            .map(|e| e.split)
            .unwrap_or(0);
        if fan_out == 0 {
            return Err(GpucellError::InvariantViolation(format!(
                "cell {} at the finest level cannot split",
                parent
            )));
        }

        let children: Vec<CellId> = (0..fan_out)
            .map(|i| {
                let mut child = Cell::new(t, depth + 1, node.clone(), format!("{}/{}", address, i));
                child.parent = Some(parent);
                self.arena.insert(child)
            })
            .collect();

        let cell = self.cell_mut(parent)?;
        cell.state = CellState::Split;
        cell.children = children.clone();

        debug!(cell = %parent, address = %address, children = fan_out, "Split cell");
        Ok(children)
    }

    /// Return an allocated cell to its free list and merge free siblings upwards
    pub fn release(&mut self, id: CellId) -> GpucellResult<CellInfo> {
        let cell = self
            .arena
            .get_mut(id)
            .ok_or_else(|| GpucellError::Release(format!("unknown cell {}", id)))?;
        if cell.state != CellState::Allocated {
            return Err(GpucellError::Release(format!(
                "cell {} is {}, not allocated",
                id, cell.state
            )));
        }

        let owner = cell.owner.take();
        cell.state = CellState::Free;
        cell.allocated_at = None;
        self.push_free(id)?;

        let released = self.describe(id)?;
        info!(
            cell = %id,
            address = %released.address,
            requester = owner.as_deref().unwrap_or_default(),
            "Released cell"
        );

        self.merge_upwards(id)?;
        Ok(released)
    }

    fn merge_upwards(&mut self, id: CellId) -> GpucellResult<()> {
        let mut current = id;
        while let Some(parent) = self.cell(current)?.parent {
            let siblings = self.cell(parent)?.children.clone();
            let all_free = siblings
                .iter()
                .all(|s| self.arena.get(*s).is_some_and(|c| c.state == CellState::Free));
            if !all_free {
                break;
            }

            for sibling in &siblings {
                if !self.pull_free(*sibling)? {
                    return Err(GpucellError::InvariantViolation(format!(
                        "free cell {} missing from its free list",
                        sibling
                    )));
                }
                self.arena.remove(*sibling);
            }

            let cell = self.cell_mut(parent)?;
            cell.children.clear();
            cell.state = CellState::Free;
            self.push_free(parent)?;

            debug!(cell = %parent, children = siblings.len(), "Merged cell");
            current = parent;
        }
        Ok(())
    }

    /// Release every cell held by `requester`; returns how many were released
    pub fn release_owner(&mut self, requester: &str) -> GpucellResult<usize> {
        let held: Vec<CellId> = self
            .arena
            .iter()
            .filter(|(_, c)| c.state == CellState::Allocated && c.owner.as_deref() == Some(requester))
            .map(|(id, _)| id)
            .collect();

        for id in &held {
            self.release(*id)?;
        }
        Ok(held.len())
    }

    /// Eligible GPU types for `request`, most preferred first
    pub fn select_gpu_types(&self, request: &ResourceRequest) -> Vec<Candidate> {
        select_gpu_types(&self.chains, &self.priority, request)
    }

    /// Number of free cells at a level
    pub fn inspect(&self, gpu_type: &str, level: &str) -> GpucellResult<usize> {
        let (t, depth) = self.locate(gpu_type, level)?;
        Ok(self.free_lists[t][depth].len())
    }

    /// Look up a live cell
    pub fn get(&self, id: CellId) -> Option<CellInfo> {
        self.describe(id).ok()
    }

    /// Cells currently allocated, in id order
    pub fn allocated(&self) -> Vec<CellInfo> {
        self.arena
            .iter()
            .filter(|(_, c)| c.state == CellState::Allocated)
            .filter_map(|(id, _)| self.describe(id).ok())
            .collect()
    }

    pub fn has_node(&self, gpu_type: &str, node: &str) -> bool {
        self.chains
            .type_index(gpu_type)
            .is_some_and(|t| self.nodes[t].contains(node))
    }

    pub fn snapshot(&self) -> InventorySnapshot {
        let gpu_types = self
            .priority
            .sorted()
            .iter()
            .filter_map(|name| {
                let t = self.chains.type_index(name)?;
                let chain = self.chains.get(t)?;
                let allocated = self
                    .arena
                    .iter()
                    .filter(|(_, c)| c.gpu_type == t && c.state == CellState::Allocated)
                    .count();
                Some(GpuTypeSnapshot {
                    gpu_type: name.clone(),
                    priority: chain.priority(),
                    capacity: self.capacity[t],
                    allocated,
                    nodes: self.nodes[t].iter().cloned().collect(),
                    levels: chain
                        .elements()
                        .iter()
                        .map(|e| LevelSnapshot {
                            level: e.name.clone(),
                            share: chain.share(e.depth),
                            free: self.free_lists[t][e.depth].len(),
                        })
                        .collect(),
                })
            })
            .collect();

        InventorySnapshot { gpu_types }
    }

    /// Verify free-list membership and capacity conservation
    pub fn check_invariants(&self) -> GpucellResult<()> {
        let mut accounted = vec![0u64; self.chains.len()];
        let mut free_seen = HashSet::new();

        for (t, levels) in self.free_lists.iter().enumerate() {
            for (depth, list) in levels.iter().enumerate() {
                for (seq, id) in list.iter() {
                    let cell = self.cell(id)?;
                    if cell.state != CellState::Free
                        || cell.gpu_type != t
                        || cell.depth != depth
                        || cell.seq != seq
                    {
                        return Err(GpucellError::InvariantViolation(format!(
                            "free list {}/{} holds {} cell {} of level {}",
                            t, depth, cell.state, id, cell.depth
                        )));
                    }
                    free_seen.insert(id);
                }
            }
        }

        for (id, cell) in self.arena.iter() {
            let chain = self.chains.get(cell.gpu_type).ok_or_else(|| {
                GpucellError::InvariantViolation(format!("cell {} has unknown GPU type", id))
            })?;
            match cell.state {
                CellState::Free if !free_seen.contains(&id) => {
                    return Err(GpucellError::InvariantViolation(format!(
                        "free cell {} is missing from its free list",
                        id
                    )));
                }
                CellState::Split if cell.children.is_empty() => {
                    return Err(GpucellError::InvariantViolation(format!(
                        "split cell {} has no children",
                        id
                    )));
                }
                CellState::Split => {}
                CellState::Free | CellState::Allocated => {
                    accounted[cell.gpu_type] += chain
                        .element(cell.depth)
                        .map(|e| e.units)
                        .unwrap_or(0);
                }
            }
        }

        for (t, units) in accounted.into_iter().enumerate() {
            let expected = self
                .chains
                .get(t)
                .and_then(|c| c.element(0))
                .map(|e| e.units * self.capacity[t] as u64)
                .unwrap_or(0);
            if units != expected {
                return Err(GpucellError::InvariantViolation(format!(
                    "GPU type {} accounts for {} units, expected {}",
                    t, units, expected
                )));
            }
        }
        Ok(())
    }

    /// Insert a Free cell into the list of its level
    pub(crate) fn push_free(&mut self, id: CellId) -> GpucellResult<()> {
        let (t, depth, seq) = {
            let cell = self.cell(id)?;
            (cell.gpu_type, cell.depth, cell.seq)
        };
        if !self.free_lists[t][depth].insert(seq, id) {
            return Err(GpucellError::InvariantViolation(format!(
                "cell {} is already in its free list",
                id
            )));
        }
        Ok(())
    }

    /// Remove a cell from the list of its level; false if it was not listed
    fn pull_free(&mut self, id: CellId) -> GpucellResult<bool> {
        let (t, depth, seq) = {
            let cell = self.cell(id)?;
            (cell.gpu_type, cell.depth, cell.seq)
        };
        Ok(self.free_lists[t][depth].remove(seq, id))
    }

    fn cell(&self, id: CellId) -> GpucellResult<&Cell> {
        self.arena
            .get(id)
            .ok_or_else(|| GpucellError::InvariantViolation(format!("dangling cell id {}", id)))
    }

    fn cell_mut(&mut self, id: CellId) -> GpucellResult<&mut Cell> {
        self.arena
            .get_mut(id)
            .ok_or_else(|| GpucellError::InvariantViolation(format!("dangling cell id {}", id)))
    }

    fn describe(&self, id: CellId) -> GpucellResult<CellInfo> {
        let cell = self.cell(id)?;
        let chain = self.chains.get(cell.gpu_type).ok_or_else(|| {
            GpucellError::InvariantViolation(format!("cell {} has unknown GPU type", id))
        })?;
        let level = chain
            .element(cell.depth)
            .map(|e| e.name.clone())
            .unwrap_or_default();

        Ok(CellInfo {
            id,
            gpu_type: chain.gpu_type().to_string(),
            level,
            node: cell.node.to_string(),
            address: cell.address.clone(),
            state: cell.state,
            owner: cell.owner.clone(),
            allocated_at: cell.allocated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::build_cell_chains;
    use crate::inventory::build_inventory;
    use gpucell_core::{GpuTypeConfig, LevelConfig, PhysicalCellConfig};

    fn level(name: &str, split: Option<i64>) -> LevelConfig {
        LevelConfig {
            name: name.to_string(),
            parent: None,
            split,
        }
    }

    fn quarter_type(name: &str, priority: i32) -> GpuTypeConfig {
        GpuTypeConfig {
            name: name.to_string(),
            priority,
            levels: vec![
                level("gpu", Some(2)),
                level("half", Some(2)),
                level("quarter", None),
            ],
        }
    }

    fn physical(node: &str, gpu_type: &str, count: u32) -> PhysicalCellConfig {
        PhysicalCellConfig {
            node: node.to_string(),
            gpu_type: gpu_type.to_string(),
            level: None,
            count,
        }
    }

    fn allocator(types: &[GpuTypeConfig], cells: &[PhysicalCellConfig]) -> CellAllocator {
        let chains = Arc::new(build_cell_chains(types).unwrap());
        let priority = GpuPriority::new(&chains);
        build_inventory(chains, priority, cells).unwrap()
    }

    fn single_gpu() -> CellAllocator {
        allocator(&[quarter_type("V100", 0)], &[physical("node-1", "V100", 1)])
    }

    fn free_counts(alloc: &CellAllocator) -> (usize, usize, usize) {
        (
            alloc.inspect("V100", "gpu").unwrap(),
            alloc.inspect("V100", "half").unwrap(),
            alloc.inspect("V100", "quarter").unwrap(),
        )
    }

    #[test]
    fn test_quarter_scenario() {
        let mut alloc = single_gpu();
        assert_eq!(free_counts(&alloc), (1, 0, 0));

        let q1 = alloc.try_reserve("V100", "quarter", "pod-a").unwrap().unwrap();
        assert_eq!(q1.state, CellState::Allocated);
        assert_eq!(q1.owner.as_deref(), Some("pod-a"));
        assert_eq!(free_counts(&alloc), (0, 1, 1));

        let q2 = alloc.try_reserve("V100", "quarter", "pod-b").unwrap().unwrap();
        assert_eq!(free_counts(&alloc), (0, 1, 0));

        let q3 = alloc.try_reserve("V100", "quarter", "pod-c").unwrap().unwrap();
        assert_eq!(free_counts(&alloc), (0, 0, 1));
        alloc.check_invariants().unwrap();

        for q in [&q1, &q2, &q3] {
            alloc.release(q.id).unwrap();
            alloc.check_invariants().unwrap();
        }
        assert_eq!(free_counts(&alloc), (1, 0, 0));
    }

    #[test]
    fn test_addresses_follow_split_path() {
        let mut alloc = single_gpu();
        let q1 = alloc.try_reserve("V100", "quarter", "a").unwrap().unwrap();
        let q2 = alloc.try_reserve("V100", "quarter", "b").unwrap().unwrap();
        assert_eq!(q1.address, "node-1/gpu0/0/0");
        assert_eq!(q2.address, "node-1/gpu0/0/1");
        assert_eq!(q1.node, "node-1");
        assert_eq!(q1.level, "quarter");
    }

    #[test]
    fn test_exhaustion_is_not_an_error() {
        let mut alloc = single_gpu();
        for i in 0..4 {
            assert!(alloc
                .try_reserve("V100", "quarter", &format!("pod-{}", i))
                .unwrap()
                .is_some());
        }
        assert!(alloc.try_reserve("V100", "quarter", "pod-4").unwrap().is_none());
        assert!(alloc.try_reserve("V100", "gpu", "pod-5").unwrap().is_none());
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn test_split_blocks_coarse_reservation_until_merge() {
        let mut alloc = single_gpu();
        let q = alloc.try_reserve("V100", "quarter", "a").unwrap().unwrap();
        assert!(alloc.try_reserve("V100", "gpu", "b").unwrap().is_none());

        alloc.release(q.id).unwrap();
        let whole = alloc.try_reserve("V100", "gpu", "b").unwrap().unwrap();
        assert_eq!(whole.level, "gpu");
        assert_eq!(whole.address, "node-1/gpu0");
    }

    #[test]
    fn test_double_release_leaves_state_unchanged() {
        let mut alloc = single_gpu();
        let half = alloc.try_reserve("V100", "half", "a").unwrap().unwrap();
        let other = alloc.try_reserve("V100", "half", "b").unwrap().unwrap();

        alloc.release(half.id).unwrap();
        let before = free_counts(&alloc);

        let err = alloc.release(half.id).unwrap_err();
        assert!(matches!(err, GpucellError::Release(_)));
        assert_eq!(free_counts(&alloc), before);
        assert!(alloc.get(other.id).unwrap().is_allocated());
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn test_release_of_merged_cell_is_rejected() {
        let mut alloc = single_gpu();
        let half = alloc.try_reserve("V100", "half", "a").unwrap().unwrap();
        alloc.release(half.id).unwrap();

        // the halves merged back into the gpu, so the old id is stale
        assert!(alloc.get(half.id).is_none());
        let err = alloc.release(half.id).unwrap_err();
        assert!(err.to_string().contains("unknown cell"));

        // a fresh split reuses the slot but never the id
        let again = alloc.try_reserve("V100", "half", "b").unwrap().unwrap();
        assert_eq!(again.id.index, half.id.index);
        assert_ne!(again.id, half.id);
        assert_eq!(again.address, "node-1/gpu0/0");
        assert!(alloc.release(half.id).is_err());
        assert!(alloc.get(again.id).unwrap().is_allocated());
    }

    #[test]
    fn test_release_of_split_cell_is_rejected() {
        let mut alloc = single_gpu();
        alloc.try_reserve("V100", "quarter", "a").unwrap().unwrap();
        let gpu = CellId::new(0, 0);
        assert_eq!(alloc.get(gpu).unwrap().state, CellState::Split);
        assert!(matches!(alloc.release(gpu), Err(GpucellError::Release(_))));
    }

    #[test]
    fn test_unknown_level_is_invariant_violation() {
        let mut alloc = single_gpu();
        let err = alloc.try_reserve("V100", "eighth", "a").unwrap_err();
        assert!(matches!(err, GpucellError::InvariantViolation(_)));
        assert!(alloc.inspect("A100", "gpu").is_err());
    }

    #[test]
    fn test_lowest_id_first() {
        let mut alloc = allocator(
            &[quarter_type("V100", 0)],
            &[physical("node-1", "V100", 2), physical("node-2", "V100", 1)],
        );
        let first = alloc.try_reserve("V100", "gpu", "a").unwrap().unwrap();
        let second = alloc.try_reserve("V100", "gpu", "b").unwrap().unwrap();
        let third = alloc.try_reserve("V100", "gpu", "c").unwrap().unwrap();
        assert_eq!(first.address, "node-1/gpu0");
        assert_eq!(second.address, "node-1/gpu1");
        assert_eq!(third.address, "node-2/gpu0");
    }

    #[test]
    fn test_insertion_order_survives_slot_reuse() {
        let mut alloc = single_gpu();
        let half = alloc.try_reserve("V100", "half", "a").unwrap().unwrap();
        alloc
            .insert_physical_cells(&physical("node-2", "V100", 1))
            .unwrap();

        // the merge vacates both half slots; node-3 lands in one of them
        alloc.release(half.id).unwrap();
        let node3 = alloc
            .insert_physical_cells(&physical("node-3", "V100", 1))
            .unwrap();
        assert!(node3[0].index < 3);

        let picks: Vec<String> = (0..3)
            .map(|i| {
                alloc
                    .try_reserve("V100", "gpu", &format!("pod-{}", i))
                    .unwrap()
                    .unwrap()
                    .node
            })
            .collect();
        assert_eq!(picks, vec!["node-1", "node-2", "node-3"]);
        alloc.check_invariants().unwrap();
    }

    #[test]
    fn test_reserve_on_node() {
        let mut alloc = allocator(
            &[quarter_type("V100", 0)],
            &[physical("node-1", "V100", 1), physical("node-2", "V100", 1)],
        );
        let q = alloc
            .try_reserve_on("V100", "quarter", "a", "node-2")
            .unwrap()
            .unwrap();
        assert_eq!(q.node, "node-2");

        // node-1 still holds an unsplit gpu
        assert_eq!(alloc.inspect("V100", "gpu").unwrap(), 1);
        let q2 = alloc
            .try_reserve_on("V100", "quarter", "b", "node-2")
            .unwrap()
            .unwrap();
        assert_eq!(q2.node, "node-2");
        assert_eq!(alloc.inspect("V100", "gpu").unwrap(), 1);

        assert!(alloc
            .try_reserve_on("V100", "gpu", "c", "node-3")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_reserve_best_falls_back_by_priority() {
        let mut alloc = allocator(
            &[quarter_type("V100", 100), quarter_type("T4", 10)],
            &[physical("node-1", "V100", 1), physical("node-2", "T4", 1)],
        );
        let request = ResourceRequest::fraction(1.0).unwrap();

        let first = alloc.reserve_best(&request, "a", None).unwrap().unwrap();
        assert_eq!(first.gpu_type, "V100");
        let second = alloc.reserve_best(&request, "b", None).unwrap().unwrap();
        assert_eq!(second.gpu_type, "T4");
        assert!(alloc.reserve_best(&request, "c", None).unwrap().is_none());
    }

    #[test]
    fn test_release_owner() {
        let mut alloc = single_gpu();
        alloc.try_reserve("V100", "quarter", "pod-a").unwrap();
        alloc.try_reserve("V100", "quarter", "pod-a").unwrap();
        alloc.try_reserve("V100", "half", "pod-b").unwrap();

        assert_eq!(alloc.release_owner("pod-a").unwrap(), 2);
        assert_eq!(alloc.release_owner("pod-a").unwrap(), 0);
        assert_eq!(alloc.allocated().len(), 1);
        assert_eq!(free_counts(&alloc), (0, 1, 0));

        assert_eq!(alloc.release_owner("pod-b").unwrap(), 1);
        assert_eq!(free_counts(&alloc), (1, 0, 0));
    }

    #[test]
    fn test_conservation_under_churn() {
        let mut alloc = allocator(
            &[quarter_type("V100", 0)],
            &[physical("node-1", "V100", 3)],
        );
        let levels = ["quarter", "half", "quarter", "gpu", "quarter", "half"];
        let mut held = Vec::new();

        for round in 0..40 {
            let level = levels[round % levels.len()];
            if let Some(cell) = alloc.try_reserve("V100", level, "churn").unwrap() {
                held.push(cell.id);
            }
            if round % 3 == 2 && !held.is_empty() {
                let id = held.remove((round * 7) % held.len());
                alloc.release(id).unwrap();
            }
            alloc.check_invariants().unwrap();
        }

        for id in held.drain(..) {
            alloc.release(id).unwrap();
        }
        alloc.check_invariants().unwrap();
        assert_eq!(alloc.inspect("V100", "gpu").unwrap(), 3);
        assert_eq!(alloc.inspect("V100", "half").unwrap(), 0);
        assert_eq!(alloc.inspect("V100", "quarter").unwrap(), 0);
    }

    #[test]
    fn test_snapshot() {
        let mut alloc = allocator(
            &[quarter_type("T4", 1), quarter_type("V100", 2)],
            &[physical("node-1", "V100", 2), physical("node-2", "T4", 1)],
        );
        alloc.try_reserve("V100", "half", "a").unwrap();

        let snapshot = alloc.snapshot();
        assert_eq!(snapshot.gpu_types[0].gpu_type, "V100");
        assert_eq!(snapshot.gpu_types[0].capacity, 2);
        assert_eq!(snapshot.gpu_types[0].allocated, 1);
        assert_eq!(snapshot.gpu_types[0].nodes, vec!["node-1"]);
        assert_eq!(snapshot.gpu_types[0].levels[0].free, 1);
        assert_eq!(snapshot.gpu_types[0].levels[1].free, 1);
        assert_eq!(snapshot.gpu_types[0].levels[2].share, 0.25);
        assert_eq!(snapshot.gpu_types[1].gpu_type, "T4");
        assert_eq!(snapshot.gpu_types[1].allocated, 0);
    }
}
