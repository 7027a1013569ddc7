//! GPU type selection for placement decisions

use gpucell_core::{LevelRequest, ResourceRequest};
use serde::Serialize;

use crate::chain::CellChains;
use crate::priority::GpuPriority;

/// A GPU type able to serve a request, with the level to reserve at
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub gpu_type: String,
    pub level: String,
}

/// Eligible GPU types for `request`, most preferred first.
///
/// A type is eligible when the request accepts it and its chain can express
/// the requested granularity: the named level exists, or some level's share
/// covers the requested fraction.
pub fn select_gpu_types(
    chains: &CellChains,
    priority: &GpuPriority,
    request: &ResourceRequest,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = chains
        .iter()
        .filter(|chain| request.accepts(chain.gpu_type()))
        .filter_map(|chain| {
            let depth = match &request.level {
                LevelRequest::Named(name) => chain.level_index(name)?,
                LevelRequest::Fraction(fraction) => chain.level_for_fraction(*fraction)?,
            };
            Some(Candidate {
                gpu_type: chain.gpu_type().to_string(),
                level: chain.element(depth)?.name.clone(),
            })
        })
        .collect();

    candidates.sort_by(|a, b| priority.compare(&a.gpu_type, &b.gpu_type));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::build_cell_chains;
    use gpucell_core::{GpuTypeConfig, LevelConfig};

    fn level(name: &str, split: Option<i64>) -> LevelConfig {
        LevelConfig {
            name: name.to_string(),
            parent: None,
            split,
        }
    }

    fn setup() -> (CellChains, GpuPriority) {
        let chains = build_cell_chains(&[
            GpuTypeConfig {
                name: "T4".to_string(),
                priority: 10,
                levels: vec![level("gpu", Some(2)), level("half", None)],
            },
            GpuTypeConfig {
                name: "V100".to_string(),
                priority: 100,
                levels: vec![
                    level("gpu", Some(2)),
                    level("half", Some(2)),
                    level("quarter", None),
                ],
            },
        ])
        .unwrap();
        let priority = GpuPriority::new(&chains);
        (chains, priority)
    }

    #[test]
    fn test_priority_order() {
        let (chains, priority) = setup();
        let candidates = select_gpu_types(&chains, &priority, &ResourceRequest::level("half"));
        let types: Vec<&str> = candidates.iter().map(|c| c.gpu_type.as_str()).collect();
        assert_eq!(types, vec!["V100", "T4"]);
    }

    #[test]
    fn test_named_level_filters_types() {
        let (chains, priority) = setup();
        let candidates = select_gpu_types(&chains, &priority, &ResourceRequest::level("quarter"));
        assert_eq!(
            candidates,
            vec![Candidate {
                gpu_type: "V100".to_string(),
                level: "quarter".to_string()
            }]
        );
    }

    #[test]
    fn test_fraction_maps_per_type() {
        let (chains, priority) = setup();
        let request = ResourceRequest::fraction(0.25).unwrap();
        let candidates = select_gpu_types(&chains, &priority, &request);

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].level, "quarter");
        assert_eq!(candidates[1].gpu_type, "T4");
        assert_eq!(candidates[1].level, "half");
    }

    #[test]
    fn test_model_restriction() {
        let (chains, priority) = setup();
        let request = ResourceRequest::fraction(0.5)
            .unwrap()
            .with_gpu_types(["T4"]);
        let candidates = select_gpu_types(&chains, &priority, &request);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].gpu_type, "T4");
    }

    #[test]
    fn test_more_than_one_gpu_is_not_expressible() {
        let (chains, priority) = setup();
        let request = ResourceRequest::fraction(2.0).unwrap();
        assert!(select_gpu_types(&chains, &priority, &request).is_empty());
    }
}
