//! gpucell-scheduler: GPU cell allocation engine
//!
//! This crate turns a cell topology into allocatable GPU fractions:
//! - Cell type chains and the initial inventory
//! - Reservation with split-on-demand, release with merge
//! - GPU type priority and selection
//! - Folding newly discovered GPU nodes into the inventory

pub mod chain;
pub mod engine;
pub mod inventory;
pub mod listener;
pub mod placement;
pub mod priority;
pub mod scheduler;

pub use chain::{build_cell_chains, CellChain, CellChains, CellElement};
pub use engine::{CellAllocator, GpuTypeSnapshot, InventorySnapshot, LevelCellList, LevelSnapshot};
pub use inventory::build_inventory;
pub use listener::{node_event_channel, ChannelNodeSource, NodeSource, TopologyListener};
pub use placement::{select_gpu_types, Candidate};
pub use priority::GpuPriority;
pub use scheduler::Scheduler;
