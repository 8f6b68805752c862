// ============================================================
// Layer 5 — Mesh Shape, Layout Rules and Batch Sizing
// ============================================================
// The three derived values the facade computes before it can
// build an estimator:
//
//   tpu_mesh_shape()     "2x2" + 8-way model parallelism
//                        → batch:1;model:8
//   LayoutRules          "batch:batch,d_ff:model,..."
//                        → tensor dim → mesh dim assignments
//   compute_batch_size() ("tokens_per_batch", 1024) + lengths
//                        → global batch size in sequences
//
// Nothing here shards a tensor; it only describes the layout
// the runtime will use.

use anyhow::{bail, Context, Result};
use std::{fmt, str::FromStr};

use crate::domain::config::{BatchSizeMethod, SequenceLengths};

/// TPU v2/v3 chips carry two cores each.
const CORES_PER_CHIP: usize = 2;

// ─── MeshShape ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshDim {
    pub name: String,
    pub size: usize,
}

/// Named mesh dimensions, written `batch:4;model:8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshShape(Vec<MeshDim>);

impl MeshShape {
    pub fn size_of(&self, name: &str) -> Option<usize> {
        self.0.iter().find(|d| d.name == name).map(|d| d.size)
    }
}

impl fmt::Display for MeshShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|d| format!("{}:{}", d.name, d.size)).collect();
        f.write_str(&parts.join(";"))
    }
}

/// Mesh shape for a TPU slice: all cores split into a data-parallel
/// `batch` dimension and a `model` dimension of `model_parallelism`.
pub fn tpu_mesh_shape(tpu_topology: &str, model_parallelism: usize) -> Result<MeshShape> {
    let chips = tpu_topology
        .split('x')
        .map(|f| {
            f.trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .with_context(|| format!("invalid TPU topology '{tpu_topology}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    if chips.len() < 2 {
        bail!("invalid TPU topology '{tpu_topology}' (expected e.g. \"2x2\")");
    }

    let num_cores = chips.iter().product::<usize>() * CORES_PER_CHIP;
    if model_parallelism == 0 || num_cores % model_parallelism != 0 {
        bail!(
            "model parallelism {model_parallelism} does not divide the {num_cores} cores \
             of topology '{tpu_topology}'"
        );
    }

    Ok(MeshShape(vec![
        MeshDim { name: "batch".to_string(), size: num_cores / model_parallelism },
        MeshDim { name: "model".to_string(), size: model_parallelism },
    ]))
}

// ─── LayoutRules ──────────────────────────────────────────────────────────────

/// Assignment of logical tensor dimensions to mesh dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutRules(Vec<(String, String)>);

impl LayoutRules {
    pub fn mesh_dim_for(&self, tensor_dim: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(t, _)| t == tensor_dim)
            .map(|(_, m)| m.as_str())
    }

    /// How many ways `tensor_dim` is split on this mesh. Dimensions
    /// with no rule, or mapped to a mesh dimension the mesh lacks,
    /// are not split.
    pub fn tensor_dim_to_mesh_dim_size(&self, mesh: &MeshShape, tensor_dim: &str) -> usize {
        self.mesh_dim_for(tensor_dim)
            .and_then(|m| mesh.size_of(m))
            .unwrap_or(1)
    }
}

impl fmt::Display for LayoutRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(t, m)| format!("{t}:{m}")).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for LayoutRules {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut rules: Vec<(String, String)> = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (tensor_dim, mesh_dim) = match part.split(':').collect::<Vec<_>>()[..] {
                [t, m] if !t.trim().is_empty() && !m.trim().is_empty() => (t.trim(), m.trim()),
                _ => bail!("layout rule '{part}' is not of the form tensor_dim:mesh_dim"),
            };
            if rules.iter().any(|(t, _)| t == tensor_dim) {
                bail!("layout rules assign tensor dimension '{tensor_dim}' more than once");
            }
            rules.push((tensor_dim.to_string(), mesh_dim.to_string()));
        }
        Ok(Self(rules))
    }
}

// ─── Batch sizing ─────────────────────────────────────────────────────────────

/// Global batch size in sequences for a `(method, value)` pair.
///
/// Token-based methods divide by the longest feature length; the
/// per-replica methods multiply by the number of ways the `batch`
/// tensor dimension is split on the mesh.
pub fn compute_batch_size(
    sequence_length: &SequenceLengths,
    mesh_shape:      &MeshShape,
    layout_rules:    &LayoutRules,
    method:          BatchSizeMethod,
    value:           usize,
) -> Result<usize> {
    let num_replicas = layout_rules.tensor_dim_to_mesh_dim_size(mesh_shape, "batch");
    let per_replica = |value: usize| {
        value.checked_mul(num_replicas).with_context(|| {
            format!("batch size {value} per replica overflows across {num_replicas} replicas")
        })
    };
    let max_length = || {
        sequence_length
            .values()
            .copied()
            .max()
            .filter(|n| *n > 0)
            .context("token-based batch sizing needs a non-zero sequence length")
    };

    let batch_size = match method {
        BatchSizeMethod::SequencesPerBatch   => value,
        BatchSizeMethod::TokensPerBatch      => value / max_length()?,
        BatchSizeMethod::SequencesPerReplica => per_replica(value)?,
        BatchSizeMethod::TokensPerReplica    => per_replica(value)? / max_length()?,
    };

    if batch_size == 0 {
        bail!(
            "batch size ({}, {value}) resolves to zero sequences for lengths {:?}",
            method.as_str(),
            sequence_length
        );
    }
    Ok(batch_size)
}
