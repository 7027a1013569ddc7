//! GPU type priority index

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::chain::CellChains;

/// Total order over GPU types, fixed at startup.
///
/// Higher configured priority wins; equal priorities fall back to the type
/// name so that the order is total.
#[derive(Debug, Clone, Default)]
pub struct GpuPriority {
    priority: HashMap<String, i32>,
    sorted: Vec<String>,
}

impl GpuPriority {
    pub fn new(chains: &CellChains) -> Self {
        let priority: HashMap<String, i32> = chains
            .iter()
            .map(|c| (c.gpu_type().to_string(), c.priority()))
            .collect();

        let mut sorted: Vec<String> = priority.keys().cloned().collect();
        let mut index = Self {
            priority,
            sorted: Vec::new(),
        };
        sorted.sort_by(|a, b| index.compare(a, b));
        index.sorted = sorted;
        index
    }

    /// `Ordering::Less` when `a` is preferred over `b`.
    /// Unknown types sort after every known type.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match (self.priority.get(a), self.priority.get(b)) {
            (Some(pa), Some(pb)) => pb.cmp(pa).then_with(|| a.cmp(b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.cmp(b),
        }
    }

    pub fn priority(&self, gpu_type: &str) -> Option<i32> {
        self.priority.get(gpu_type).copied()
    }

    /// GPU types, most preferred first
    pub fn sorted(&self) -> &[String] {
        &self.sorted
    }
}
