// ============================================================
// Layer 3 — Estimator Requests
// ============================================================
// What the facade hands across the estimator boundary:
//
//   EstimatorSpec → everything needed to build the estimator once
//   TrainRequest  → one training run
//   EvalRequest   → one evaluation pass at one checkpoint step
//   InferRequest  → one decode pass at one checkpoint step
//
// Requests borrow from the facade; the estimator never owns
// the vocabulary or dataset functions.

use regex::Regex;
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use url::Url;

use crate::data::dataset_fn::{EvalDatasetFn, TrainDatasetFn};
use crate::data::vocabulary::VocabularyPair;
use crate::domain::config::{ModelType, OptimizerConfig, SequenceLengths};
use crate::domain::traits::LearningRateSchedule;
use crate::ml::decode::DecodeParams;
use crate::ml::mesh::{LayoutRules, MeshShape};

// ─── Cluster ──────────────────────────────────────────────────────────────────
/// A resolved compute cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cluster {
    /// No TPU; the runtime uses whatever local devices it finds
    Local,
    /// A TPU reachable at a fixed gRPC address
    Endpoint(Url),
    /// A Cloud TPU addressed by name; the runtime looks up its workers
    Named {
        name:    String,
        zone:    Option<String>,
        project: Option<String>,
    },
}

impl Cluster {
    pub fn use_tpu(&self) -> bool {
        !matches!(self, Cluster::Local)
    }

    /// The value to pass as the runtime's `--tpu` flag
    pub fn tpu_address(&self) -> Option<String> {
        match self {
            Cluster::Local          => None,
            Cluster::Endpoint(url)  => Some(url.to_string()),
            Cluster::Named { name, .. } => Some(name.clone()),
        }
    }
}

// ─── PredictFn ────────────────────────────────────────────────────────────────
/// Replaces the runtime's default decoding: maps the input ids of one
/// example to its predicted target ids. Estimators that cannot ship
/// it to their runtime run it in process.
#[derive(Clone)]
pub struct PredictFn(Arc<dyn Fn(&[u32], &DecodeParams) -> Vec<u32> + Send + Sync>);

impl PredictFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u32], &DecodeParams) -> Vec<u32> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, inputs: &[u32], params: &DecodeParams) -> Vec<u32> {
        (self.0)(inputs, params)
    }
}

impl fmt::Debug for PredictFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PredictFn(..)")
    }
}

// ─── EstimatorSpec ────────────────────────────────────────────────────────────
/// The fully resolved configuration an estimator is built from.
#[derive(Debug, Clone)]
pub struct EstimatorSpec {
    pub model_type:             ModelType,
    pub input_vocab_size:       usize,
    pub output_vocab_size:      usize,
    pub layout_rules:           LayoutRules,
    pub mesh_shape:             MeshShape,
    pub model_dir:              PathBuf,
    pub batch_size:             usize,
    pub sequence_length:        SequenceLengths,
    pub autostack:              bool,
    pub learning_rate_schedule: Arc<dyn LearningRateSchedule>,
    pub keep_checkpoint_max:    Option<usize>,
    pub save_checkpoints_steps: u64,
    pub optimizer:              OptimizerConfig,
    pub predict_fn:             Option<PredictFn>,
    pub variable_filter:        Option<Regex>,
    pub ensemble_inputs:        Option<usize>,
    pub use_tpu:                bool,
    pub tpu_job_name:           Option<String>,
    pub iterations_per_loop:    u64,
    pub init_checkpoint:        Option<PathBuf>,
}

// ─── Per-call requests ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct TrainRequest<'a> {
    pub vocabulary:      &'a VocabularyPair,
    pub sequence_length: &'a SequenceLengths,
    pub batch_size:      usize,
    pub dataset_fn:      &'a TrainDatasetFn,
    /// Total number of steps to train for
    pub steps:           u64,
    pub ensemble_inputs: Option<usize>,
    /// Seed for the dataset function's shuffle and mixing
    pub seed:            u64,
}

#[derive(Debug, Clone, Copy)]
pub struct EvalRequest<'a> {
    pub vocabulary:      &'a VocabularyPair,
    pub sequence_length: &'a SequenceLengths,
    pub batch_size:      usize,
    pub split:           &'a str,
    pub model_dir:       &'a Path,
    pub dataset_fn:      &'a EvalDatasetFn,
    pub summary_dir:     &'a Path,
    pub checkpoint_step: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct InferRequest<'a> {
    pub vocabulary:      &'a VocabularyPair,
    pub sequence_length: &'a SequenceLengths,
    pub batch_size:      usize,
    pub model_type:      ModelType,
    pub model_dir:       &'a Path,
    pub checkpoint_step: u64,
    /// Newline-separated prompts
    pub input_file:      &'a Path,
    /// Already carries the `-<step>` suffix
    pub output_file:     &'a Path,
}
