//! Configuration types for gpucell

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Most coarsest-level cells one node may contribute to a GPU type
pub const MAX_GPUS_PER_NODE: u32 = 1024;

/// Largest fan-out a level may declare
pub const MAX_SPLIT: u32 = 64;

/// Top-level configuration: daemon settings plus the GPU topology
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GpucellConfig {
    /// API server configuration
    pub api: ApiConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// GPU node detection settings
    pub discovery: DiscoveryConfig,
    /// Cell chains, one per GPU type
    pub gpu_types: Vec<GpuTypeConfig>,
    /// Physically present coarsest-level cells
    pub cells: Vec<PhysicalCellConfig>,
}

impl GpucellConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::GpucellError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::GpucellError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, crate::GpucellError> {
        Ok(toml::from_str(content)?)
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Labels and resources that identify a GPU-bearing node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Label that must be set to "true" on shareable GPU nodes
    pub gpu_label: String,
    /// Label carrying the GPU model, matched against `gpu_types[].name`
    pub model_label: String,
    /// Capacity resource counting physical GPUs on the node
    pub capacity_resource: String,
    /// Nodes advertising more GPUs than this are rejected
    pub max_gpus_per_node: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            gpu_label: "SharedGPU".to_string(),
            model_label: "sharedgpu/gpu_model".to_string(),
            capacity_resource: "nvidia.com/gpu".to_string(),
            max_gpus_per_node: 64,
        }
    }
}

/// Cell chain for one GPU type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuTypeConfig {
    /// GPU type name (e.g. "V100")
    pub name: String,
    /// Placement priority, higher is preferred
    #[serde(default)]
    pub priority: i32,
    /// Levels ordered from coarsest to finest
    pub levels: Vec<LevelConfig>,
}

/// One granularity level in a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Level name (e.g. "gpu", "half", "quarter")
    pub name: String,
    /// Coarser level this one is carved from; must be the previous entry
    #[serde(default)]
    pub parent: Option<String>,
    /// Number of children a cell of this level splits into.
    /// Kept signed so that negative values surface as configuration errors.
    #[serde(default)]
    pub split: Option<i64>,
}

/// Coarsest-level cells present on one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicalCellConfig {
    /// Node the cells live on
    pub node: String,
    /// GPU type name
    pub gpu_type: String,
    /// Level of the declared cells, defaults to the coarsest level
    #[serde(default)]
    pub level: Option<String>,
    /// Number of cells
    #[serde(default = "default_cell_count")]
    pub count: u32,
}

fn default_cell_count() -> u32 {
    1
}
