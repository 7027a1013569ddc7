//! Cell type chains: per GPU type, the ordered levels from coarsest to finest

use gpucell_core::{GpucellError, GpucellResult, GpuTypeConfig, MAX_SPLIT};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Tolerance used when matching a requested fraction against level shares
const SHARE_EPSILON: f64 = 1e-9;

/// One level in a chain
#[derive(Debug, Clone)]
pub struct CellElement {
    /// Level name
    pub name: String,
    /// Position in the chain, 0 is the coarsest
    pub depth: usize,
    /// Depth of the coarser level, `None` for the coarsest
    pub parent: Option<usize>,
    /// Depth of the finer level, `None` for the finest
    pub child: Option<usize>,
    /// Number of children a cell of this level splits into (0 for the finest)
    pub split: u32,
    /// Number of finest-level cells contained in one cell of this level
    pub units: u64,
}

/// Immutable level chain for a single GPU type
#[derive(Debug, Clone)]
pub struct CellChain {
    gpu_type: String,
    priority: i32,
    elements: Vec<CellElement>,
}

impl CellChain {
    pub fn gpu_type(&self) -> &str {
        &self.gpu_type
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn elements(&self) -> &[CellElement] {
        &self.elements
    }

    pub fn element(&self, depth: usize) -> Option<&CellElement> {
        self.elements.get(depth)
    }

    pub fn depth(&self) -> usize {
        self.elements.len()
    }

    pub fn level_index(&self, name: &str) -> Option<usize> {
        self.elements.iter().position(|e| e.name == name)
    }

    /// Fraction of one coarsest cell represented by a cell at `depth`
    pub fn share(&self, depth: usize) -> f64 {
        match (self.elements.first(), self.elements.get(depth)) {
            (Some(top), Some(e)) => e.units as f64 / top.units as f64,
            _ => 0.0,
        }
    }

    /// Finest level whose cells still cover `fraction` of a coarsest cell
    pub fn level_for_fraction(&self, fraction: f64) -> Option<usize> {
        if fraction <= 0.0 {
            return None;
        }
        (0..self.elements.len())
            .rev()
            .find(|&depth| self.share(depth) + SHARE_EPSILON >= fraction)
    }
}

/// All chains, keyed by GPU type, with a reverse lookup by level
#[derive(Debug, Clone, Default)]
pub struct CellChains {
    chains: Vec<CellChain>,
    by_type: HashMap<String, usize>,
    by_level: HashMap<(String, String), (usize, usize)>,
}

impl CellChains {
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CellChain> {
        self.chains.iter()
    }

    pub fn get(&self, type_index: usize) -> Option<&CellChain> {
        self.chains.get(type_index)
    }

    pub fn type_index(&self, gpu_type: &str) -> Option<usize> {
        self.by_type.get(gpu_type).copied()
    }

    pub fn chain(&self, gpu_type: &str) -> Option<&CellChain> {
        self.type_index(gpu_type).and_then(|i| self.chains.get(i))
    }

    /// Resolve `(gpu_type, level)` to `(type index, depth)`
    pub fn locate(&self, gpu_type: &str, level: &str) -> Option<(usize, usize)> {
        self.by_level
            .get(&(gpu_type.to_string(), level.to_string()))
            .copied()
    }

    /// Look up the element for a level of a GPU type
    pub fn element(&self, gpu_type: &str, level: &str) -> Option<&CellElement> {
        let (t, depth) = self.locate(gpu_type, level)?;
        self.chains.get(t)?.element(depth)
    }
}

/// Build the level chains for every configured GPU type
pub fn build_cell_chains(types: &[GpuTypeConfig]) -> GpucellResult<CellChains> {
    let mut chains = CellChains::default();

    for config in types {
        if config.name.is_empty() {
            return Err(GpucellError::Config("GPU type with empty name".to_string()));
        }
        if chains.by_type.contains_key(&config.name) {
            return Err(GpucellError::Config(format!(
                "GPU type {} is declared twice",
                config.name
            )));
        }

        let chain = build_chain(config)?;
        let type_index = chains.chains.len();
        for element in &chain.elements {
            chains.by_level.insert(
                (chain.gpu_type.clone(), element.name.clone()),
                (type_index, element.depth),
            );
        }
        debug!(
            gpu_type = %chain.gpu_type,
            levels = ?chain.elements.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
            "Built cell chain"
        );
        chains.by_type.insert(chain.gpu_type.clone(), type_index);
        chains.chains.push(chain);
    }

    Ok(chains)
}

fn build_chain(config: &GpuTypeConfig) -> GpucellResult<CellChain> {
    let gpu_type = &config.name;
    if config.levels.is_empty() {
        return Err(GpucellError::Config(format!(
            "GPU type {} declares no levels",
            gpu_type
        )));
    }

    let last = config.levels.len() - 1;
    let mut seen = HashSet::new();
    let mut elements = Vec::with_capacity(config.levels.len());

    for (depth, level) in config.levels.iter().enumerate() {
        if level.name.is_empty() {
            return Err(GpucellError::Config(format!(
                "GPU type {} has a level with an empty name",
                gpu_type
            )));
        }
        if !seen.insert(level.name.as_str()) {
            return Err(GpucellError::Config(format!(
                "GPU type {} declares level {} twice",
                gpu_type, level.name
            )));
        }

        let expected_parent = depth.checked_sub(1).map(|p| config.levels[p].name.as_str());
        match (level.parent.as_deref(), expected_parent) {
            (Some(_), None) => {
                return Err(GpucellError::Config(format!(
                    "coarsest level {} of GPU type {} cannot have a parent",
                    level.name, gpu_type
                )));
            }
            (Some(parent), Some(expected)) if parent != expected => {
                return Err(GpucellError::Config(format!(
                    "level {} of GPU type {} names parent {}, expected {}",
                    level.name, gpu_type, parent, expected
                )));
            }
            _ => {}
        }

        let split = match (level.split, depth == last) {
            (None, true) => 0,
            (Some(_), true) => {
                return Err(GpucellError::Config(format!(
                    "finest level {} of GPU type {} cannot split",
                    level.name, gpu_type
                )));
            }
            (None, false) => {
                return Err(GpucellError::Config(format!(
                    "level {} of GPU type {} is missing a split factor",
                    level.name, gpu_type
                )));
            }
            (Some(n), false) => u32::try_from(n)
                .ok()
                .filter(|n| (1..=MAX_SPLIT).contains(n))
                .ok_or_else(|| {
                    GpucellError::Config(format!(
                        "level {} of GPU type {} has invalid split factor {} (expected 1..={})",
                        level.name, gpu_type, n, MAX_SPLIT
                    ))
                })?,
        };

        elements.push(CellElement {
            name: level.name.clone(),
            depth,
            parent: depth.checked_sub(1),
            child: (depth < last).then_some(depth + 1),
            split,
            units: 1,
        });
    }

    // units accumulate from the finest level upwards
    for depth in (0..last).rev() {
        let below = elements[depth + 1].units;
        elements[depth].units = below
            .checked_mul(u64::from(elements[depth].split))
            .ok_or_else(|| {
                GpucellError::Config(format!("GPU type {} splits too finely", gpu_type))
            })?;
    }

    Ok(CellChain {
        gpu_type: gpu_type.clone(),
        priority: config.priority,
        elements,
    })
}
