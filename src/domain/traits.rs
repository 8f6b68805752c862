// ============================================================
// Layer 3 — Core Traits (Collaborators)
// ============================================================
// The facade owns none of the heavy lifting. It talks to the
// mesh runtime, the TPU control plane, the model directory and
// the tokenizer only through the traits below, so each can be
// swapped (or mocked in tests) without touching the facade.
//
// Implementations:
//   Vocabulary         → data::vocabulary::SentencePieceVocabulary
//   DataSource         → data::registry::{TsvSource, InMemorySource}
//   LearningRateSchedule → ml::schedules::{NoamSchedule, ConstantSchedule}
//   ClusterResolver    → infra::cluster::TpuClusterResolver
//   CheckpointSource   → infra::checkpoint::DirectoryCheckpoints
//   EstimatorFactory   → infra::process_estimator::ProcessEstimatorFactory

use anyhow::Result;
use std::{fmt, path::Path};

use crate::domain::example::TextExample;
use crate::domain::requests::{Cluster, EstimatorSpec, EvalRequest, InferRequest, TrainRequest};

// ─── Vocabulary ───────────────────────────────────────────────────────────────
/// Maps text to token ids and back for one role (inputs or targets).
pub trait Vocabulary: Send + Sync + fmt::Debug {
    /// Total number of ids, including any sentinel ids
    fn vocab_size(&self) -> usize;

    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Sentinel ids counted in `vocab_size` on top of the model's pieces
    fn extra_ids(&self) -> usize {
        0
    }

    /// SentencePiece `.model` file the runtime can load this
    /// vocabulary from, if there is one
    fn model_file(&self) -> Option<&Path> {
        None
    }
}

// ─── DataSource ───────────────────────────────────────────────────────────────
/// Raw text examples for a task, one list per split.
pub trait DataSource: Send + Sync + fmt::Debug {
    /// Names of the splits this source can serve
    fn splits(&self) -> Vec<String>;

    fn load(&self, split: &str) -> Result<Vec<TextExample>>;
}

// ─── LearningRateSchedule ─────────────────────────────────────────────────────
pub trait LearningRateSchedule: Send + Sync + fmt::Debug {
    fn learning_rate(&self, step: u64, total_train_steps: u64) -> f64;
}

// ─── ClusterResolver ──────────────────────────────────────────────────────────
/// Turns a TPU address/name into a handle the estimator can bind to.
pub trait ClusterResolver {
    fn resolve(
        &self,
        tpu:     &str,
        zone:    Option<&str>,
        project: Option<&str>,
    ) -> Result<Cluster>;
}

// ─── CheckpointSource ─────────────────────────────────────────────────────────
/// Knows which checkpoint steps exist and how to wait for new ones.
pub trait CheckpointSource: Send {
    /// Steps currently present, ascending
    fn available_steps(&self) -> Result<Vec<u64>>;

    /// Block until a checkpoint newer than `after` exists and return
    /// the newest step. `None` means the source stopped waiting.
    fn wait_for_next(&self, after: Option<u64>) -> Result<Option<u64>>;
}

// ─── Estimator ────────────────────────────────────────────────────────────────
/// The long-lived handle the facade forwards its verbs to.
pub trait Estimator: Send {
    fn train(&self, request: TrainRequest<'_>) -> Result<()>;

    /// One evaluation pass against one checkpoint
    fn evaluate(&self, request: EvalRequest<'_>) -> Result<()>;

    /// Decode one input file against one checkpoint
    fn infer(&self, request: InferRequest<'_>) -> Result<()>;
}

/// Builds the estimator once from the fully resolved configuration.
pub trait EstimatorFactory {
    fn build(&self, spec: EstimatorSpec, cluster: &Cluster) -> Result<Box<dyn Estimator>>;
}
