// ============================================================
// Layer 3 — Model Configuration
// ============================================================
// The configuration bundle the facade is built from. Every
// field has a documented default so a config file only needs
// `model_dir` and `tpu`.
//
// Values that need interpretation (layout rules, model type,
// variable filter) stay as strings here and are parsed when
// the facade is constructed, so a bad value fails there.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

pub const DEFAULT_TOPOLOGY: &str = "2x2";
pub const DEFAULT_LAYOUT_RULES: &str =
    "ensemble:batch,batch:batch,d_ff:model,heads:model,vocab:model,experts:model";
pub const DEFAULT_SEQUENCE_LENGTH: usize = 512;
pub const DEFAULT_VOCABULARY_PATH: &str = "vocabs/cc_all.32000/sentencepiece.json";
pub const DEFAULT_EXTRA_IDS: usize = 100;
pub const DEFAULT_RUNTIME: &str = "t5_mesh_transformer";

// ─── Batch Size ───────────────────────────────────────────────────────────────

/// How a `(method, value)` batch size pair is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSizeMethod {
    /// `value` is the global batch size in sequences
    SequencesPerBatch,
    /// `value` is the global number of tokens per batch
    TokensPerBatch,
    /// `value` sequences for every data-parallel replica
    SequencesPerReplica,
    /// `value` tokens for every data-parallel replica
    TokensPerReplica,
}

impl BatchSizeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SequencesPerBatch   => "sequences_per_batch",
            Self::TokensPerBatch      => "tokens_per_batch",
            Self::SequencesPerReplica => "sequences_per_replica",
            Self::TokensPerReplica    => "tokens_per_replica",
        }
    }
}

impl FromStr for BatchSizeMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sequences_per_batch"   => Ok(Self::SequencesPerBatch),
            "tokens_per_batch"      => Ok(Self::TokensPerBatch),
            "sequences_per_replica" => Ok(Self::SequencesPerReplica),
            "tokens_per_replica"    => Ok(Self::TokensPerReplica),
            other => bail!("unknown batch size method '{other}'"),
        }
    }
}

/// Global batch size: either fixed, or computed from a method/value
/// pair once the mesh and sequence lengths are known.
/// JSON accepts `256` or `["tokens_per_batch", 1024]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchSize {
    Fixed(usize),
    Computed(BatchSizeMethod, usize),
}

impl Default for BatchSize {
    fn default() -> Self {
        BatchSize::Computed(BatchSizeMethod::TokensPerBatch, 1024)
    }
}

// ─── Sequence Length ──────────────────────────────────────────────────────────

/// Packed sequence length per feature key.
pub type SequenceLengths = BTreeMap<String, usize>;

/// Either one length for both features or an explicit map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SequenceLength {
    Uniform(usize),
    PerFeature(SequenceLengths),
}

impl SequenceLength {
    /// Expand to a feature map. A single integer applies to both
    /// `inputs` and `targets`; a map is returned unchanged.
    pub fn normalize(&self) -> SequenceLengths {
        match self {
            SequenceLength::Uniform(n) => BTreeMap::from([
                ("inputs".to_string(), *n),
                ("targets".to_string(), *n),
            ]),
            SequenceLength::PerFeature(map) => map.clone(),
        }
    }
}

impl Default for SequenceLength {
    fn default() -> Self {
        SequenceLength::PerFeature(SequenceLength::Uniform(DEFAULT_SEQUENCE_LENGTH).normalize())
    }
}

// ─── Vocabulary ───────────────────────────────────────────────────────────────

/// A serialized subword model on disk plus the number of sentinel
/// ids appended above it.
///
/// `path` is the `tokenizer.json` used for local tokenization. The
/// runtime loads vocabularies from a SentencePiece `.model` file,
/// so it only gets one when `model_file` is set; otherwise it is
/// told the vocabulary sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentencePieceConfig {
    pub path: PathBuf,
    #[serde(default = "default_extra_ids")]
    pub extra_ids: usize,
    #[serde(default)]
    pub model_file: Option<PathBuf>,
}

fn default_extra_ids() -> usize {
    DEFAULT_EXTRA_IDS
}

impl Default for SentencePieceConfig {
    fn default() -> Self {
        Self {
            path:       PathBuf::from(DEFAULT_VOCABULARY_PATH),
            extra_ids:  DEFAULT_EXTRA_IDS,
            model_file: None,
        }
    }
}

/// One vocabulary for both roles, or separate input/target ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VocabularyConfig {
    Split {
        inputs:  SentencePieceConfig,
        targets: SentencePieceConfig,
    },
    Shared(SentencePieceConfig),
}

// ─── Model Type ───────────────────────────────────────────────────────────────

/// Architectures the mesh runtime knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Bitransformer,
    BiStudentTeacher,
    Lm,
    DelimitedLm,
    Aligned,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Bitransformer    => "bitransformer",
            ModelType::BiStudentTeacher => "bi_student_teacher",
            ModelType::Lm               => "lm",
            ModelType::DelimitedLm      => "delimited_lm",
            ModelType::Aligned          => "aligned",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bitransformer"      => Ok(ModelType::Bitransformer),
            "bi_student_teacher" => Ok(ModelType::BiStudentTeacher),
            "lm"                 => Ok(ModelType::Lm),
            "delimited_lm"       => Ok(ModelType::DelimitedLm),
            "aligned"            => Ok(ModelType::Aligned),
            other => bail!(
                "unsupported model type '{other}' (expected one of: bitransformer, \
                 bi_student_teacher, lm, delimited_lm, aligned)"
            ),
        }
    }
}

// ─── Learning Rate Schedule ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Noam(NoamConfig),
    Constant(ConstantConfig),
}

/// Inverse square root decay with a warmup plateau, optionally
/// decaying linearly to zero over the last fraction of training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoamConfig {
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: u64,
    #[serde(default = "default_linear_decay_fraction")]
    pub linear_decay_fraction: f64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub offset: u64,
}

fn default_warmup_steps() -> u64 {
    10_000
}
fn default_linear_decay_fraction() -> f64 {
    0.1
}
fn default_multiplier() -> f64 {
    1.0
}

impl Default for NoamConfig {
    fn default() -> Self {
        Self {
            warmup_steps:          default_warmup_steps(),
            linear_decay_fraction: default_linear_decay_fraction(),
            multiplier:            default_multiplier(),
            offset:                0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantConfig {
    pub learning_rate: f64,
}

// ─── Optimizer ────────────────────────────────────────────────────────────────

/// Which optimizer the runtime should instantiate, with its knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adafactor(AdafactorConfig),
    Adam(AdamConfig),
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adafactor(AdafactorConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdafactorConfig {
    pub decay_rate:                  f64,
    pub beta1:                       f64,
    pub clipping_threshold:          f64,
    pub factored:                    bool,
    pub epsilon1:                    f64,
    pub epsilon2:                    f64,
    pub multiply_by_parameter_scale: bool,
}

impl Default for AdafactorConfig {
    fn default() -> Self {
        Self {
            decay_rate:                  0.8,
            beta1:                       0.0,
            clipping_threshold:          1.0,
            factored:                    true,
            epsilon1:                    1e-30,
            epsilon2:                    1e-3,
            multiply_by_parameter_scale: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub weight_decay_rate: f64,
    pub beta1:             f64,
    pub beta2:             f64,
    pub epsilon:           f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            weight_decay_rate: 0.0,
            beta1:             0.9,
            beta2:             0.999,
            epsilon:           1e-6,
        }
    }
}

// ─── Checkpoint Watching ──────────────────────────────────────────────────────

/// Polling policy used when eval/predict wait for new checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointWatchConfig {
    pub poll_interval_secs: u64,
    /// Give up waiting after this long without a new checkpoint.
    /// `None` waits forever.
    pub timeout_secs: Option<u64>,
}

impl Default for CheckpointWatchConfig {
    fn default() -> Self {
        Self { poll_interval_secs: 30, timeout_secs: None }
    }
}

// ─── Model Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Where checkpoints and event files live
    pub model_dir: PathBuf,

    /// TPU address or name; empty means run without a TPU
    pub tpu: String,

    #[serde(default)]
    pub tpu_job_name: Option<String>,

    #[serde(default)]
    pub tpu_zone: Option<String>,

    #[serde(default)]
    pub gcp_project: Option<String>,

    /// Chip grid, e.g. "2x2"
    #[serde(default = "default_topology")]
    pub tpu_topology: String,

    /// Cores per model replica
    #[serde(default = "default_model_parallelism")]
    pub model_parallelism: usize,

    /// Global batch size, not per shard
    #[serde(default)]
    pub batch_size: BatchSize,

    #[serde(default)]
    pub sequence_length: SequenceLength,

    #[serde(default)]
    pub vocabulary: Option<VocabularyConfig>,

    #[serde(default = "default_model_type")]
    pub model_type: String,

    /// Comma-separated `tensor_dim:mesh_dim` pairs
    #[serde(default = "default_layout_rules")]
    pub layout_rules: String,

    #[serde(default = "default_true")]
    pub autostack: bool,

    #[serde(default)]
    pub learning_rate_schedule: Option<ScheduleConfig>,

    #[serde(default)]
    pub keep_checkpoint_max: Option<usize>,

    #[serde(default = "default_save_checkpoints_steps")]
    pub save_checkpoints_steps: u64,

    #[serde(default)]
    pub optimizer: Option<OptimizerConfig>,

    /// Only variables whose names match this regex are trained
    #[serde(default)]
    pub variable_filter: Option<String>,

    #[serde(default)]
    pub ensemble_inputs: Option<usize>,

    #[serde(default = "default_iterations_per_loop")]
    pub iterations_per_loop: u64,

    #[serde(default)]
    pub init_checkpoint: Option<PathBuf>,

    /// Executable that runs the mesh runtime
    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default)]
    pub checkpoint_watch: CheckpointWatchConfig,

    /// Local directory where tokenized datasets and the learning
    /// rate table are staged for the runtime
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Seed for shuffling and mixing training examples
    #[serde(default)]
    pub dataset_seed: u64,
}

fn default_topology() -> String {
    DEFAULT_TOPOLOGY.to_string()
}
fn default_model_parallelism() -> usize {
    8
}
fn default_model_type() -> String {
    ModelType::Bitransformer.as_str().to_string()
}
fn default_layout_rules() -> String {
    DEFAULT_LAYOUT_RULES.to_string()
}
fn default_true() -> bool {
    true
}
fn default_save_checkpoints_steps() -> u64 {
    5000
}
fn default_iterations_per_loop() -> u64 {
    100
}
fn default_runtime() -> String {
    DEFAULT_RUNTIME.to_string()
}
fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("mtf-model")
}

impl ModelConfig {
    /// A config with every optional field at its default.
    pub fn new(model_dir: impl Into<PathBuf>, tpu: impl Into<String>) -> Self {
        Self {
            model_dir:              model_dir.into(),
            tpu:                    tpu.into(),
            tpu_job_name:           None,
            tpu_zone:               None,
            gcp_project:            None,
            tpu_topology:           default_topology(),
            model_parallelism:      default_model_parallelism(),
            batch_size:             BatchSize::default(),
            sequence_length:        SequenceLength::default(),
            vocabulary:             None,
            model_type:             default_model_type(),
            layout_rules:           default_layout_rules(),
            autostack:              true,
            learning_rate_schedule: None,
            keep_checkpoint_max:    None,
            save_checkpoints_steps: default_save_checkpoints_steps(),
            optimizer:              None,
            variable_filter:        None,
            ensemble_inputs:        None,
            iterations_per_loop:    default_iterations_per_loop(),
            init_checkpoint:        None,
            runtime:                default_runtime(),
            checkpoint_watch:       CheckpointWatchConfig::default(),
            work_dir:               default_work_dir(),
            dataset_seed:           0,
        }
    }
}
