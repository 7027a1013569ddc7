//! CLI commands implementation

use anyhow::{Context, Result};
use gpucell_core::{CellInfo, DiscoveryConfig, GpucellConfig, Node, NodeEvent};
use gpucell_scheduler::{InventorySnapshot, Scheduler};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub gpu_types: Vec<String>,
    pub capacity: usize,
    pub allocated: usize,
}

/// Free count of one level
#[derive(Debug, Deserialize)]
pub struct InspectResponse {
    pub gpu_type: String,
    pub level: String,
    pub free: usize,
}

/// Release-by-requester response
#[derive(Debug, Deserialize)]
pub struct ReleaseOwnerResponse {
    pub requester: String,
    pub released: usize,
}

/// Body of a reservation request
#[derive(Debug, Serialize, PartialEq)]
pub struct ReserveBody {
    pub requester: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_request: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub gpu_types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

impl ReserveBody {
    pub fn new(
        requester: Option<String>,
        gpu_request: Option<f64>,
        level: Option<String>,
        gpu_types: Vec<String>,
        node: Option<String>,
    ) -> Self {
        Self {
            requester: requester.unwrap_or_else(|| format!("cli-{}", Uuid::new_v4())),
            gpu_request,
            level,
            gpu_types,
            node,
        }
    }
}

/// Node as announced by `add-node`, labelled the way discovery expects
fn gpu_node(name: String, model: String, gpus: u64) -> Node {
    let discovery = DiscoveryConfig::default();
    Node::new(name)
        .with_label(discovery.gpu_label, "true")
        .with_label(discovery.model_label, model)
        .with_capacity(discovery.capacity_resource, gpus)
}

/// Show scheduler status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("gpucell v{}", status.version);
        println!();
        println!("GPU types: {}", status.gpu_types.join(", "));
        println!("Physical cells: {}", status.capacity);
        println!("Reserved cells: {}", status.allocated);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

/// Show free cells
pub async fn cells(client: &ApiClient, gpu_type: Option<String>, level: Option<String>) -> Result<()> {
    match (gpu_type, level) {
        (Some(gpu_type), Some(level)) => {
            let response = client
                .client
                .get(client.url(&format!("/api/v1/cells/{}/{}", gpu_type, level)))
                .send()
                .await?;

            if response.status().is_success() {
                let inspect: InspectResponse = response.json().await?;
                println!(
                    "{} {}: {} free",
                    inspect.gpu_type, inspect.level, inspect.free
                );
            } else {
                let error = response.text().await?;
                eprintln!("Failed to inspect cells: {}", error);
            }
        }
        (filter, _) => {
            let response = client.client.get(client.url("/api/v1/cells")).send().await?;

            if response.status().is_success() {
                let snapshot: InventorySnapshot = response.json().await?;
                print_snapshot(&snapshot, filter.as_deref());
            } else {
                let error = response.text().await?;
                eprintln!("Failed to list cells: {}", error);
            }
        }
    }

    Ok(())
}

/// List reserved cells
pub async fn ps(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/reservations"))
        .send()
        .await?;

    if response.status().is_success() {
        let cells: Vec<CellInfo> = response.json().await?;

        if cells.is_empty() {
            println!("No reserved cells");
        } else {
            println!(
                "{:<10} {:<8} {:<10} {:<28} {:<30}",
                "CELL", "TYPE", "LEVEL", "ADDRESS", "OWNER"
            );
            println!("{}", "-".repeat(90));
            for cell in cells {
                println!(
                    "{:<10} {:<8} {:<10} {:<28} {:<30}",
                    cell.id.to_string(),
                    cell.gpu_type,
                    cell.level,
                    cell.address,
                    cell.owner.unwrap_or_default()
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list reservations: {}", error);
    }

    Ok(())
}

/// Reserve a cell
pub async fn reserve(client: &ApiClient, req: ReserveBody) -> Result<()> {
    let response = client
        .client
        .post(client.url("/api/v1/reservations"))
        .json(&req)
        .send()
        .await?;

    if response.status().is_success() {
        let cell: CellInfo = response.json().await?;
        println!("Reserved cell {}", cell.id);
        println!("  Type: {}", cell.gpu_type);
        println!("  Level: {}", cell.level);
        println!("  Address: {}", cell.address);
        println!("  Requester: {}", req.requester);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to reserve cell: {}", error);
    }

    Ok(())
}

/// Release a reserved cell
pub async fn release(client: &ApiClient, cell: String) -> Result<()> {
    let response = client
        .client
        .delete(client.url(&format!("/api/v1/reservations/{}", cell)))
        .send()
        .await?;

    if response.status().is_success() {
        println!("Cell {} released", cell);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to release cell: {}", error);
    }

    Ok(())
}

/// Release every cell held by a requester
pub async fn release_owner(client: &ApiClient, requester: String) -> Result<()> {
    let response = client
        .client
        .delete(client.url(&format!("/api/v1/requesters/{}", requester)))
        .send()
        .await?;

    if response.status().is_success() {
        let released: ReleaseOwnerResponse = response.json().await?;
        println!(
            "Released {} cell(s) held by '{}'",
            released.released, released.requester
        );
    } else {
        let error = response.text().await?;
        eprintln!("Failed to release cells: {}", error);
    }

    Ok(())
}

/// Announce a GPU node
pub async fn add_node(client: &ApiClient, name: String, model: String, gpus: u64) -> Result<()> {
    let event = NodeEvent::Added(gpu_node(name.clone(), model, gpus));

    let response = client
        .client
        .post(client.url("/api/v1/nodes"))
        .json(&event)
        .send()
        .await?;

    if response.status().is_success() {
        println!("Node '{}' submitted", name);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to submit node: {}", error);
    }

    Ok(())
}

/// Build chains and inventory from a topology file without a daemon
pub async fn check(path: &Path) -> Result<()> {
    let config = GpucellConfig::from_file(path)?;
    let scheduler = Scheduler::from_config(&config)
        .with_context(|| format!("Invalid topology in {}", path.display()))?;
    scheduler.check_invariants().await?;

    println!("{}: OK", path.display());
    println!();
    print_snapshot(&scheduler.snapshot().await, None);
    Ok(())
}

/// Helper to print per-level free counts
fn print_snapshot(snapshot: &InventorySnapshot, gpu_type: Option<&str>) {
    let types: Vec<_> = snapshot
        .gpu_types
        .iter()
        .filter(|t| gpu_type.map_or(true, |name| t.gpu_type == name))
        .collect();

    if types.is_empty() {
        println!("No GPU types found");
        return;
    }

    for t in types {
        println!(
            "{} (priority {}): {} physical, {} reserved, nodes: {}",
            t.gpu_type,
            t.priority,
            t.capacity,
            t.allocated,
            if t.nodes.is_empty() {
                "-".to_string()
            } else {
                t.nodes.join(", ")
            }
        );
        for level in &t.levels {
            println!(
                "  {:<12} share {:<8.4} free {}",
                level.level, level.share, level.free
            );
        }
    }
}
