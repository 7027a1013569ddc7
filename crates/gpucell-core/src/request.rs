//! GPU resource requests as expressed by pods

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{GpucellError, GpucellResult};

/// Pod annotation carrying the requested fraction of one GPU
pub const GPU_REQUEST_ANNOTATION: &str = "sharedgpu/gpu_request";
/// Pod annotation restricting acceptable GPU models (comma separated)
pub const GPU_MODEL_ANNOTATION: &str = "sharedgpu/gpu_model";

/// Granularity a request asks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelRequest {
    /// An explicit level name, e.g. "quarter"
    Named(String),
    /// A fraction of one coarsest cell, e.g. 0.25
    Fraction(f64),
}

/// A request translatable to one or more eligible GPU types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub level: LevelRequest,
    /// Acceptable GPU types; empty means any
    #[serde(default)]
    pub gpu_types: Vec<String>,
}

impl ResourceRequest {
    pub fn level(name: impl Into<String>) -> Self {
        Self {
            level: LevelRequest::Named(name.into()),
            gpu_types: Vec::new(),
        }
    }

    pub fn fraction(fraction: f64) -> GpucellResult<Self> {
        if !fraction.is_finite() || fraction <= 0.0 {
            return Err(GpucellError::InvalidRequest(format!(
                "gpu request must be a positive fraction, got {}",
                fraction
            )));
        }
        Ok(Self {
            level: LevelRequest::Fraction(fraction),
            gpu_types: Vec::new(),
        })
    }

    pub fn with_gpu_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gpu_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `gpu_type` is acceptable to this request
    pub fn accepts(&self, gpu_type: &str) -> bool {
        self.gpu_types.is_empty() || self.gpu_types.iter().any(|t| t == gpu_type)
    }

    /// Build a request from pod annotations.
    ///
    /// Returns `Ok(None)` for pods that do not ask for a shared GPU.
    pub fn from_annotations(annotations: &HashMap<String, String>) -> GpucellResult<Option<Self>> {
        let Some(raw) = annotations.get(GPU_REQUEST_ANNOTATION) else {
            return Ok(None);
        };
        let fraction: f64 = raw.trim().parse().map_err(|_| {
            GpucellError::InvalidRequest(format!(
                "{} is not a number: {:?}",
                GPU_REQUEST_ANNOTATION, raw
            ))
        })?;

        let mut request = Self::fraction(fraction)?;
        if let Some(models) = annotations.get(GPU_MODEL_ANNOTATION) {
            request = request.with_gpu_types(
                models
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty()),
            );
        }
        Ok(Some(request))
    }
}
