//! Cell identifiers and their externally visible state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::GpucellError;

/// Stable handle to a cell record.
///
/// `index` addresses an arena slot; `generation` is bumped every time a slot is
/// reused, so handles to merged-away cells never alias a newer cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId {
    pub index: u32,
    pub generation: u32,
}

impl CellId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

impl FromStr for CellId {
    type Err = GpucellError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GpucellError::InvalidRequest(format!("invalid cell id: {:?}", s));
        let (index, generation) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self {
            index: index.parse().map_err(|_| invalid())?,
            generation: generation.parse().map_err(|_| invalid())?,
        })
    }
}

/// Occupancy state of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellState {
    /// Sitting in its level's free list
    Free,
    /// Carved into finer cells
    Split,
    /// Reserved by a requester
    Allocated,
}

impl fmt::Display for CellState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellState::Free => write!(f, "Free"),
            CellState::Split => write!(f, "Split"),
            CellState::Allocated => write!(f, "Allocated"),
        }
    }
}

/// Owned view of a cell, handed out by reservations and lookups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellInfo {
    pub id: CellId,
    pub gpu_type: String,
    pub level: String,
    /// Node hosting the physical GPU
    pub node: String,
    /// Physical location, e.g. `node-1/gpu2/1/0`
    pub address: String,
    pub state: CellState,
    /// Requester holding the cell, when allocated
    pub owner: Option<String>,
    pub allocated_at: Option<DateTime<Utc>>,
}

impl CellInfo {
    pub fn is_allocated(&self) -> bool {
        self.state == CellState::Allocated
    }
}
