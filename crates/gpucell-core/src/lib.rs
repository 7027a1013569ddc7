//! gpucell-core: Core types for the gpucell allocator
//!
//! This crate provides the types shared by the allocation engine and its surfaces:
//! - Topology and daemon configuration
//! - Cell identifiers and cell state
//! - Cluster nodes and topology events
//! - GPU resource requests
//! - Error handling

pub mod cell;
pub mod config;
pub mod error;
pub mod node;
pub mod request;

pub use cell::*;
pub use config::*;
pub use error::*;
pub use node::*;
pub use request::*;
