// ============================================================
// Layer 2 — MtfModel Facade
// ============================================================
// Builds one estimator from a configuration bundle and forwards
// the three verbs to it.
//
// Construction, in order:
//
//   Step 1: Mesh shape from topology + parallelism   (Layer 5 - ml)
//   Step 2: Vocabulary (override / config / default)  (Layer 4 - data)
//   Step 3: Sequence lengths normalised per feature   (Layer 3 - domain)
//   Step 4: Layout rules parsed                       (Layer 5 - ml)
//   Step 5: Global batch size resolved                (Layer 5 - ml)
//   Step 6: Schedule + optimizer defaults             (Layer 5 - ml)
//   Step 7: Model type and variable filter validated  (Layer 3 - domain)
//   Step 8: TPU cluster resolved                      (Layer 6 - infra)
//   Step 9: Estimator built once                      (Layer 6 - infra)
//
// Verbs:
//   train   → registry lookup → train dataset fn → Estimator::train
//   eval    → registry lookup → eval dataset fn  → Estimator::evaluate
//             once per resolved checkpoint step
//   predict → decode scope    → Estimator::infer once per step,
//             writing `<output_file>-<step>`

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::data::dataset_fn::{mesh_eval_dataset_fn, mesh_train_dataset_fn};
use crate::data::registry::Registry;
use crate::data::vocabulary::{SentencePieceVocabulary, VocabularyPair};
use crate::domain::checkpoint::CheckpointSelector;
use crate::domain::config::{BatchSize, ModelConfig, ModelType, SentencePieceConfig, SequenceLengths};
use crate::domain::requests::{
    Cluster, EstimatorSpec, EvalRequest, InferRequest, PredictFn, TrainRequest,
};
use crate::domain::traits::{
    CheckpointSource, ClusterResolver, Estimator, EstimatorFactory, LearningRateSchedule,
};
use crate::infra::{
    checkpoint::{resolve_steps, DirectoryCheckpoints},
    cluster::TpuClusterResolver,
    process_estimator::ProcessEstimatorFactory,
};
use crate::ml::{
    decode::{DecodeParams, DecodeScope},
    mesh::{compute_batch_size, tpu_mesh_shape, LayoutRules, MeshShape},
    schedules,
};

/// Split evaluated when the caller does not name one.
pub const DEFAULT_EVAL_SPLIT: &str = "validation";

// ─── Builder ──────────────────────────────────────────────────────────────────
/// Collects the collaborators and callable overrides that cannot be
/// expressed in a JSON config. Anything left unset gets the
/// production implementation.
pub struct MtfModelBuilder {
    config:                 ModelConfig,
    registry:               Option<Arc<Registry>>,
    cluster_resolver:       Option<Box<dyn ClusterResolver>>,
    checkpoints:            Option<Box<dyn CheckpointSource>>,
    estimator_factory:      Option<Box<dyn EstimatorFactory>>,
    vocabulary:             Option<VocabularyPair>,
    default_vocabulary:     SentencePieceConfig,
    learning_rate_schedule: Option<Arc<dyn LearningRateSchedule>>,
    predict_fn:             Option<PredictFn>,
}

impl MtfModelBuilder {
    /// Registry to look task and mixture names up in. Defaults to
    /// `Registry::global()`.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to `TpuClusterResolver`.
    pub fn cluster_resolver(mut self, resolver: impl ClusterResolver + 'static) -> Self {
        self.cluster_resolver = Some(Box::new(resolver));
        self
    }

    /// Where eval/predict find checkpoints. Defaults to the files
    /// in `config.model_dir`.
    pub fn checkpoint_source(mut self, source: impl CheckpointSource + 'static) -> Self {
        self.checkpoints = Some(Box::new(source));
        self
    }

    /// Defaults to the runtime subprocess named by `config.runtime`.
    pub fn estimator_factory(mut self, factory: impl EstimatorFactory + 'static) -> Self {
        self.estimator_factory = Some(Box::new(factory));
        self
    }

    /// Takes precedence over `config.vocabulary`.
    pub fn vocabulary(mut self, vocabulary: VocabularyPair) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    /// The vocabulary loaded when neither an override nor
    /// `config.vocabulary` is given.
    pub fn default_vocabulary(mut self, config: SentencePieceConfig) -> Self {
        self.default_vocabulary = config;
        self
    }

    /// Takes precedence over `config.learning_rate_schedule`.
    pub fn learning_rate_schedule(mut self, schedule: Arc<dyn LearningRateSchedule>) -> Self {
        self.learning_rate_schedule = Some(schedule);
        self
    }

    /// Decode prompts in process with this function instead of the
    /// runtime's decoder.
    pub fn predict_fn(mut self, predict_fn: PredictFn) -> Self {
        self.predict_fn = Some(predict_fn);
        self
    }

    pub fn build(self) -> Result<MtfModel> {
        let config = self.config;

        // ── Step 1: Mesh shape ────────────────────────────────────────────────
        let mesh_shape = tpu_mesh_shape(&config.tpu_topology, config.model_parallelism)?;

        // ── Step 2: Vocabulary ────────────────────────────────────────────────
        let vocabulary = match (self.vocabulary, &config.vocabulary) {
            (Some(vocabulary), _) => vocabulary,
            (None, Some(vocab_config)) => VocabularyPair::from_config(vocab_config)?,
            (None, None) => VocabularyPair::shared(Arc::new(SentencePieceVocabulary::load(
                &self.default_vocabulary,
            )?)),
        };

        // ── Step 3-5: Sequence lengths, layout rules, batch size ──────────────
        let sequence_length = config.sequence_length.normalize();
        let layout_rules: LayoutRules = config
            .layout_rules
            .parse()
            .with_context(|| format!("Invalid layout rules '{}'", config.layout_rules))?;
        let batch_size = match config.batch_size {
            BatchSize::Fixed(n) => n,
            BatchSize::Computed(method, value) => {
                compute_batch_size(&sequence_length, &mesh_shape, &layout_rules, method, value)?
            }
        };
        tracing::info!(
            "Mesh {} | batch size {} | sequence length {:?}",
            mesh_shape,
            batch_size,
            sequence_length
        );

        // ── Step 6-7: Schedule, optimizer, model type, variable filter ────────
        let learning_rate_schedule = match (self.learning_rate_schedule, &config.learning_rate_schedule) {
            (Some(schedule), _) => schedule,
            (None, Some(schedule_config)) => schedules::from_config(schedule_config),
            (None, None) => schedules::default_schedule(),
        };
        let model_type: ModelType = config.model_type.parse()?;
        let variable_filter = config
            .variable_filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("Invalid variable filter")?;

        // ── Step 8: Cluster ───────────────────────────────────────────────────
        let resolver = self
            .cluster_resolver
            .unwrap_or_else(|| Box::new(TpuClusterResolver));
        let cluster = resolver
            .resolve(&config.tpu, config.tpu_zone.as_deref(), config.gcp_project.as_deref())
            .with_context(|| format!("Cannot resolve TPU '{}'", config.tpu))?;
        tracing::info!("Cluster: {:?}", cluster);

        // ── Step 9: Estimator ─────────────────────────────────────────────────
        let spec = EstimatorSpec {
            model_type,
            input_vocab_size:       vocabulary.inputs.vocab_size(),
            output_vocab_size:      vocabulary.targets.vocab_size(),
            layout_rules:           layout_rules.clone(),
            mesh_shape:             mesh_shape.clone(),
            model_dir:              config.model_dir.clone(),
            batch_size,
            sequence_length:        sequence_length.clone(),
            autostack:              config.autostack,
            learning_rate_schedule,
            keep_checkpoint_max:    config.keep_checkpoint_max,
            save_checkpoints_steps: config.save_checkpoints_steps,
            optimizer:              config.optimizer.clone().unwrap_or_default(),
            predict_fn:             self.predict_fn,
            variable_filter,
            ensemble_inputs:        config.ensemble_inputs,
            use_tpu:                cluster.use_tpu(),
            tpu_job_name:           config.tpu_job_name.clone(),
            iterations_per_loop:    config.iterations_per_loop,
            init_checkpoint:        config.init_checkpoint.clone(),
        };
        let factory = self
            .estimator_factory
            .unwrap_or_else(|| {
                Box::new(ProcessEstimatorFactory::new(config.runtime.clone(), config.work_dir.clone()))
            });
        let estimator = factory.build(spec, &cluster).context("Cannot build estimator")?;

        let checkpoints = self.checkpoints.unwrap_or_else(|| {
            Box::new(DirectoryCheckpoints::new(&config.model_dir, &config.checkpoint_watch))
        });

        Ok(MtfModel {
            registry: self.registry.unwrap_or_else(Registry::global),
            config,
            vocabulary,
            sequence_length,
            mesh_shape,
            layout_rules,
            batch_size,
            model_type,
            cluster,
            checkpoints,
            estimator,
        })
    }
}

// ─── ModelPlan ────────────────────────────────────────────────────────────────
/// The resolved values, as printed by `mtf-model plan`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelPlan {
    pub model_dir:         PathBuf,
    pub model_type:        String,
    pub mesh_shape:        String,
    pub layout_rules:      String,
    pub batch_size:        usize,
    pub sequence_length:   SequenceLengths,
    pub input_vocab_size:  usize,
    pub output_vocab_size: usize,
    pub use_tpu:           bool,
    pub tpu:               Option<String>,
}

// ─── MtfModel ─────────────────────────────────────────────────────────────────
pub struct MtfModel {
    config:          ModelConfig,
    registry:        Arc<Registry>,
    vocabulary:      VocabularyPair,
    sequence_length: SequenceLengths,
    mesh_shape:      MeshShape,
    layout_rules:    LayoutRules,
    batch_size:      usize,
    model_type:      ModelType,
    cluster:         Cluster,
    checkpoints:     Box<dyn CheckpointSource>,
    estimator:       Box<dyn Estimator>,
}

impl MtfModel {
    /// Build with every collaborator at its production default.
    pub fn new(config: ModelConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start a builder for overriding collaborators.
    pub fn builder(config: ModelConfig) -> MtfModelBuilder {
        MtfModelBuilder {
            config,
            registry:               None,
            cluster_resolver:       None,
            checkpoints:            None,
            estimator_factory:      None,
            vocabulary:             None,
            default_vocabulary:     SentencePieceConfig::default(),
            learning_rate_schedule: None,
            predict_fn:             None,
        }
    }

    /// The configuration the model was built from.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Global batch size in sequences.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Maximum length per feature, always keyed `inputs` and `targets`.
    pub fn sequence_length(&self) -> &SequenceLengths {
        &self.sequence_length
    }

    /// Resolved mesh, e.g. `batch:1;model:8`.
    pub fn mesh_shape(&self) -> &MeshShape {
        &self.mesh_shape
    }

    /// Parsed tensor-to-mesh dimension assignments.
    pub fn layout_rules(&self) -> &LayoutRules {
        &self.layout_rules
    }

    /// Input and target vocabularies.
    pub fn vocabulary(&self) -> &VocabularyPair {
        &self.vocabulary
    }

    /// The resolved cluster, local or TPU.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Snapshot of the resolved values.
    pub fn plan(&self) -> ModelPlan {
        ModelPlan {
            model_dir:         self.config.model_dir.clone(),
            model_type:        self.model_type.to_string(),
            mesh_shape:        self.mesh_shape.to_string(),
            layout_rules:      self.layout_rules.to_string(),
            batch_size:        self.batch_size,
            sequence_length:   self.sequence_length.clone(),
            input_vocab_size:  self.vocabulary.inputs.vocab_size(),
            output_vocab_size: self.vocabulary.targets.vocab_size(),
            use_tpu:           self.cluster.use_tpu(),
            tpu:               self.cluster.tpu_address(),
        }
    }

    /// Train on a registered task or mixture for `steps` total steps.
    pub fn train(&self, mixture_or_task_name: &str, steps: u64) -> Result<()> {
        let dataset_fn = mesh_train_dataset_fn(&self.registry, mixture_or_task_name)
            .with_context(|| format!("Cannot train on '{mixture_or_task_name}'"))?;

        tracing::info!("Training '{}' for {} steps", mixture_or_task_name, steps);
        self.estimator.train(TrainRequest {
            vocabulary:      &self.vocabulary,
            sequence_length: &self.sequence_length,
            batch_size:      self.batch_size,
            dataset_fn:      &dataset_fn,
            steps,
            ensemble_inputs: self.config.ensemble_inputs,
            seed:            self.config.dataset_seed,
        })
    }

    /// Evaluate a registered task or mixture against the selected
    /// checkpoints. Summaries go to `<model_dir>/eval_<split>` unless
    /// `summary_dir` is given.
    pub fn eval(
        &self,
        mixture_or_task_name: &str,
        checkpoint:           impl Into<CheckpointSelector>,
        summary_dir:          Option<&Path>,
        split:                Option<&str>,
    ) -> Result<()> {
        let dataset_fn = mesh_eval_dataset_fn(&self.registry, mixture_or_task_name)
            .with_context(|| format!("Cannot evaluate '{mixture_or_task_name}'"))?;

        let split = split.unwrap_or(DEFAULT_EVAL_SPLIT);
        let summary_dir = summary_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.model_dir.join(format!("eval_{split}")));
        let selector = checkpoint.into();

        tracing::info!(
            "Evaluating '{}' on '{}' at checkpoint {}",
            mixture_or_task_name,
            split,
            selector
        );
        self.for_each_checkpoint(&selector, |step| {
            self.estimator.evaluate(EvalRequest {
                vocabulary:      &self.vocabulary,
                sequence_length: &self.sequence_length,
                batch_size:      self.batch_size,
                split,
                model_dir:       &self.config.model_dir,
                dataset_fn:      &dataset_fn,
                summary_dir:     &summary_dir,
                checkpoint_step: step,
            })
        })
    }

    /// Decode every line of `input_file` at each selected checkpoint,
    /// writing `<output_file>-<step>`. `beam_size` and `temperature`
    /// replace the process-wide decode parameters for this call only.
    pub fn predict(
        &self,
        checkpoint:  impl Into<CheckpointSelector>,
        input_file:  &Path,
        output_file: &Path,
        beam_size:   usize,
        temperature: f64,
    ) -> Result<()> {
        let _scope = DecodeScope::enter(DecodeParams { beam_size, temperature });
        let selector = checkpoint.into();

        tracing::info!("Predicting '{}' at checkpoint {}", input_file.display(), selector);
        self.for_each_checkpoint(&selector, |step| {
            let output = step_output_path(output_file, step);
            self.estimator.infer(InferRequest {
                vocabulary:      &self.vocabulary,
                sequence_length: &self.sequence_length,
                batch_size:      self.batch_size,
                model_type:      self.model_type,
                model_dir:       &self.config.model_dir,
                checkpoint_step: step,
                input_file,
                output_file:     &output,
            })?;
            tracing::info!("Wrote predictions for step {} to '{}'", step, output.display());
            Ok(())
        })
    }

    /// Run `f` for each step the selector names. `Continuous` keeps
    /// waiting for newer checkpoints until the source gives up.
    fn for_each_checkpoint(
        &self,
        selector: &CheckpointSelector,
        mut f:    impl FnMut(u64) -> Result<()>,
    ) -> Result<()> {
        if let CheckpointSelector::Continuous = selector {
            let mut last = None;
            while let Some(step) = self.checkpoints.wait_for_next(last)? {
                f(step)?;
                last = Some(step);
            }
            tracing::info!("Stopped waiting for checkpoints (last step {:?})", last);
            return Ok(());
        }

        for step in resolve_steps(selector, self.checkpoints.as_ref())? {
            f(step)?;
        }
        Ok(())
    }
}

fn step_output_path(output_file: &Path, step: u64) -> PathBuf {
    let mut name: OsString = output_file.as_os_str().to_owned();
    name.push(format!("-{step}"));
    PathBuf::from(name)
}
