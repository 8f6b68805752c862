// ============================================================
// Layer 6 — Process-backed Estimator
// ============================================================
// Runs the mesh runtime as a subprocess. Each verb becomes one
// invocation of the runtime binary, configured entirely through
// command-line flags and `--gin_param` bindings:
//
//   mtf-model train ...
//       │
//       ▼
//   t5_mesh_transformer --model_dir=... --tpu=...
//       --gin_param="utils.run.mode = 'train'"
//       --gin_param="utils.run.mesh_shape = 'batch:1;model:8'"
//       ...
//
// Task data never goes through the runtime's own registry. Before
// a run, the request's dataset function is called and its output
// is staged under the work dir:
//
//   work_dir/<task or mixture>/
//     train.jsonl               tokenized, shuffled, mixed by rate
//     learning_rate.tsv         step<TAB>rate every iterations_per_loop
//     <split>/<task>.jsonl      one file per evaluated task
//
// The estimator is built once; every request only adds the
// bindings that differ per call (mode, steps, split, files).
// Decode parameters are read from `ml::decode::current()` at
// the moment an inference call is marshaled. With a custom
// predict function, inference runs in this process instead.

use anyhow::{bail, Context, Result};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use crate::data::vocabulary::{VocabularyPair, EOS_ID, PAD_ID};
use crate::domain::config::{OptimizerConfig, SequenceLengths};
use crate::domain::requests::{
    Cluster, EstimatorSpec, EvalRequest, InferRequest, PredictFn, TrainRequest,
};
use crate::domain::traits::{Estimator, EstimatorFactory};
use crate::ml::decode;

const TRAIN_SPLIT: &str = "train";

// ─── Factory ──────────────────────────────────────────────────────────────────

/// Builds estimators that shell out to `binary`, staging their
/// input files under `work_dir`.
#[derive(Debug, Clone)]
pub struct ProcessEstimatorFactory {
    binary:   String,
    work_dir: PathBuf,
}

impl ProcessEstimatorFactory {
    pub fn new(binary: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into(), work_dir: work_dir.into() }
    }
}

impl EstimatorFactory for ProcessEstimatorFactory {
    fn build(&self, spec: EstimatorSpec, cluster: &Cluster) -> Result<Box<dyn Estimator>> {
        tracing::debug!("Runtime '{}' bound to {:?}", self.binary, cluster);
        if spec.predict_fn.is_some() {
            tracing::info!("Predictions will be decoded in process with the custom predict function");
        }
        Ok(Box::new(ProcessEstimator {
            binary:   self.binary.clone(),
            work_dir: self.work_dir.clone(),
            spec,
            cluster:  cluster.clone(),
        }))
    }
}

// ─── Estimator ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ProcessEstimator {
    binary:   String,
    work_dir: PathBuf,
    spec:     EstimatorSpec,
    cluster:  Cluster,
}

/// A string as a gin literal: single-quoted, with quotes escaped.
fn quoted(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn quoted_path(path: &Path) -> String {
    quoted(&path.display().to_string())
}

fn py_bool(b: bool) -> &'static str {
    if b { "True" } else { "False" }
}

fn sequence_length_literal(lengths: &SequenceLengths) -> String {
    let items: Vec<String> = lengths.iter().map(|(k, v)| format!("{}: {v}", quoted(k))).collect();
    format!("{{{}}}", items.join(", "))
}

/// A registry or split name as a single path component.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
        .collect()
}

fn gin_args(gin: impl IntoIterator<Item = String>) -> impl Iterator<Item = String> {
    gin.into_iter().map(|g| format!("--gin_param={g}"))
}

impl ProcessEstimator {
    /// Flags and bindings shared by every verb.
    fn base_args(&self, vocabulary: &VocabularyPair) -> Vec<String> {
        let spec = &self.spec;
        let mut args = vec![format!("--model_dir={}", spec.model_dir.display())];

        match &self.cluster {
            Cluster::Local => {}
            Cluster::Endpoint(url) => args.push(format!("--tpu={url}")),
            Cluster::Named { name, zone, project } => {
                args.push(format!("--tpu={name}"));
                if let Some(zone) = zone {
                    args.push(format!("--tpu_zone={zone}"));
                }
                if let Some(project) = project {
                    args.push(format!("--gcp_project={project}"));
                }
            }
        }

        let mut gin = vec![
            format!("utils.run.model_type = {}", quoted(spec.model_type.as_str())),
            format!("utils.run.mesh_shape = {}", quoted(&spec.mesh_shape.to_string())),
            format!("utils.run.layout_rules = {}", quoted(&spec.layout_rules.to_string())),
            format!("utils.run.batch_size = ('sequences_per_batch', {})", spec.batch_size),
            format!("utils.run.sequence_length = {}", sequence_length_literal(&spec.sequence_length)),
            format!("utils.run.autostack = {}", py_bool(spec.autostack)),
            format!("utils.run.save_checkpoints_steps = {}", spec.save_checkpoints_steps),
            format!("utils.run.iterations_per_loop = {}", spec.iterations_per_loop),
            format!("utils.tpu_estimator_model_fn.use_tpu = {}", py_bool(spec.use_tpu)),
        ];
        gin.extend(self.vocabulary_bindings(vocabulary));

        if let Some(max) = spec.keep_checkpoint_max {
            gin.push(format!("utils.run.keep_checkpoint_max = {max}"));
        }
        if let Some(job) = &spec.tpu_job_name {
            gin.push(format!("utils.run.tpu_job_name = {}", quoted(job)));
        }
        if let Some(filter) = &spec.variable_filter {
            gin.push(format!("utils.run.variable_filter = {}", quoted(filter.as_str())));
        }
        if let Some(init) = &spec.init_checkpoint {
            gin.push(format!("utils.run.init_checkpoint = {}", quoted_path(init)));
        }

        match &spec.optimizer {
            OptimizerConfig::Adafactor(c) => {
                gin.push("utils.run.optimizer = @optimize.AdafactorOptimizer".into());
                gin.push(format!("AdafactorOptimizer.decay_rate = {:?}", c.decay_rate));
                gin.push(format!("AdafactorOptimizer.beta1 = {:?}", c.beta1));
                gin.push(format!("AdafactorOptimizer.clipping_threshold = {:?}", c.clipping_threshold));
                gin.push(format!("AdafactorOptimizer.factored = {}", py_bool(c.factored)));
                gin.push(format!("AdafactorOptimizer.epsilon1 = {:?}", c.epsilon1));
                gin.push(format!("AdafactorOptimizer.epsilon2 = {:?}", c.epsilon2));
                gin.push(format!(
                    "AdafactorOptimizer.multiply_by_parameter_scale = {}",
                    py_bool(c.multiply_by_parameter_scale)
                ));
            }
            OptimizerConfig::Adam(c) => {
                gin.push("utils.run.optimizer = @optimize.AdamWeightDecayOptimizer".into());
                gin.push(format!("AdamWeightDecayOptimizer.weight_decay_rate = {:?}", c.weight_decay_rate));
                gin.push(format!("AdamWeightDecayOptimizer.beta_1 = {:?}", c.beta1));
                gin.push(format!("AdamWeightDecayOptimizer.beta_2 = {:?}", c.beta2));
                gin.push(format!("AdamWeightDecayOptimizer.epsilon = {:?}", c.epsilon));
            }
        }

        args.extend(gin_args(gin));
        args
    }

    /// The runtime adds `extra_ids` on top of a `.model` file itself,
    /// so it gets either the model files or the total sizes, never both.
    fn vocabulary_bindings(&self, vocabulary: &VocabularyPair) -> Vec<String> {
        match (vocabulary.inputs.model_file(), vocabulary.targets.model_file()) {
            (Some(inputs), Some(targets)) => vec![
                format!("inputs_vocabulary.sentencepiece_model_file = {}", quoted_path(inputs)),
                format!("inputs_vocabulary.extra_ids = {}", vocabulary.inputs.extra_ids()),
                format!("targets_vocabulary.sentencepiece_model_file = {}", quoted_path(targets)),
                format!("targets_vocabulary.extra_ids = {}", vocabulary.targets.extra_ids()),
            ],
            _ => {
                tracing::debug!("No SentencePiece model files; passing vocabulary sizes only");
                vec![
                    format!("utils.build_model.input_vocab_size = {}", self.spec.input_vocab_size),
                    format!("utils.build_model.output_vocab_size = {}", self.spec.output_vocab_size),
                ]
            }
        }
    }

    fn staging_dir(&self, parts: &[&str]) -> Result<PathBuf> {
        let dir = parts
            .iter()
            .fold(self.work_dir.clone(), |dir, part| dir.join(file_stem(part)));
        fs::create_dir_all(&dir)
            .with_context(|| format!("Cannot create staging dir '{}'", dir.display()))?;
        Ok(dir)
    }

    /// One `step<TAB>rate` row every `iterations_per_loop` steps,
    /// plus a final row at `total_steps`.
    fn write_learning_rate_table(&self, path: &Path, total_steps: u64) -> Result<()> {
        let schedule = &self.spec.learning_rate_schedule;
        let every    = self.spec.iterations_per_loop.max(1);
        let file = File::create(path)
            .with_context(|| format!("Cannot create learning rate table '{}'", path.display()))?;
        let mut out = BufWriter::new(file);

        let mut step = 0;
        while step < total_steps {
            writeln!(out, "{step}\t{:?}", schedule.learning_rate(step, total_steps))?;
            step += every;
        }
        writeln!(out, "{total_steps}\t{:?}", schedule.learning_rate(total_steps, total_steps))?;
        out.flush()?;

        tracing::info!(
            "Learning rate {:.3e} at step 0, {:.3e} at step {}",
            schedule.learning_rate(0, total_steps),
            schedule.learning_rate(total_steps, total_steps),
            total_steps
        );
        Ok(())
    }

    pub(crate) fn train_args(&self, request: &TrainRequest<'_>) -> Result<Vec<String>> {
        let name    = request.dataset_fn.mixture_or_task_name();
        let staging = self.staging_dir(&[name])?;

        // ── Tokenized training data ──────────────────────────────────────────
        let dataset = request.dataset_fn.call(
            request.vocabulary,
            request.sequence_length,
            TRAIN_SPLIT,
            request.seed,
        )?;
        let dataset_file = staging.join(format!("{TRAIN_SPLIT}.jsonl"));
        dataset.write_jsonl(&dataset_file)?;
        tracing::info!(
            "Staged {} examples of '{}' ({} batches of {}) in '{}'",
            dataset.len(),
            name,
            dataset.len().div_ceil(request.batch_size.max(1)),
            request.batch_size,
            dataset_file.display()
        );

        // ── Learning rate table ──────────────────────────────────────────────
        let schedule_file = staging.join("learning_rate.tsv");
        self.write_learning_rate_table(&schedule_file, request.steps)?;

        let mut args = self.base_args(request.vocabulary);
        let mut gin = vec![
            "utils.run.mode = 'train'".to_string(),
            format!("utils.run.train_steps = {}", request.steps),
            format!("utils.run.mixture_or_task_name = {}", quoted(name)),
            format!("utils.run.train_dataset_file = {}", quoted_path(&dataset_file)),
            "utils.run.learning_rate_schedule = @learning_rate_schedules.tabulated".to_string(),
            format!("tabulated.filename = {}", quoted_path(&schedule_file)),
        ];
        if let Some(n) = request.ensemble_inputs {
            gin.push(format!("utils.run.ensemble_inputs = {n}"));
        }
        args.extend(gin_args(gin));
        Ok(args)
    }

    pub(crate) fn eval_args(&self, request: &EvalRequest<'_>) -> Result<Vec<String>> {
        let name    = request.dataset_fn.mixture_or_task_name();
        let staging = self.staging_dir(&[name, request.split])?;

        let datasets = request
            .dataset_fn
            .call(request.vocabulary, request.sequence_length, request.split)?;
        let mut files = Vec::with_capacity(datasets.len());
        for eval in &datasets {
            let path = staging.join(format!("{}.jsonl", file_stem(&eval.task_name)));
            if eval.dataset.is_empty() {
                tracing::warn!("Task '{}' has an empty '{}' split", eval.task_name, request.split);
            }
            eval.dataset.write_jsonl(&path)?;
            tracing::debug!(
                "Staged {} '{}' examples of '{}' in '{}'",
                eval.dataset.len(),
                request.split,
                eval.task_name,
                path.display()
            );
            files.push(format!("{}: {}", quoted(&eval.task_name), quoted_path(&path)));
        }

        let mut args = self.base_args(request.vocabulary);
        let gin = [
            "utils.run.mode = 'eval'".to_string(),
            format!("utils.run.eval_checkpoint_step = {}", request.checkpoint_step),
            format!("utils.run.dataset_split = {}", quoted(request.split)),
            format!("utils.run.mixture_or_task_name = {}", quoted(name)),
            format!("utils.run.eval_summary_dir = {}", quoted_path(request.summary_dir)),
            format!("utils.run.eval_dataset_files = {{{}}}", files.join(", ")),
        ];
        args.extend(gin_args(gin));
        Ok(args)
    }

    pub(crate) fn infer_args(&self, request: &InferRequest<'_>) -> Vec<String> {
        let mut args = self.base_args(request.vocabulary);
        let params = decode::current();
        let gin = [
            "utils.run.mode = 'infer'".to_string(),
            format!("utils.run.eval_checkpoint_step = {}", request.checkpoint_step),
            format!("decode_from_file.input_filename = {}", quoted_path(request.input_file)),
            format!("decode_from_file.output_filename = {}", quoted_path(request.output_file)),
            format!("Bitransformer.decode.beam_size = {}", params.beam_size),
            format!("Bitransformer.decode.temperature = {:?}", params.temperature),
        ];
        args.extend(gin_args(gin));
        args
    }

    /// Decode each input line with `predict_fn`: encode, append EOS,
    /// truncate to the inputs length, and decode the prediction up to
    /// its first EOS.
    fn decode_in_process(&self, predict_fn: &PredictFn, request: &InferRequest<'_>) -> Result<()> {
        let params = decode::current();
        let input_length = request.sequence_length.get("inputs").copied();
        let text = fs::read_to_string(request.input_file)
            .with_context(|| format!("Cannot read inputs '{}'", request.input_file.display()))?;
        let file = File::create(request.output_file).with_context(|| {
            format!("Cannot create predictions '{}'", request.output_file.display())
        })?;
        let mut out = BufWriter::new(file);

        let mut lines = 0usize;
        for line in text.lines() {
            let mut ids = request.vocabulary.inputs.encode(line)?;
            ids.push(EOS_ID);
            if let Some(n) = input_length {
                ids.truncate(n);
            }
            let predicted: Vec<u32> = predict_fn
                .call(&ids, &params)
                .into_iter()
                .take_while(|&id| id != EOS_ID)
                .filter(|&id| id != PAD_ID)
                .collect();
            writeln!(out, "{}", request.vocabulary.targets.decode(&predicted)?)?;
            lines += 1;
        }
        out.flush()?;

        tracing::info!(
            "Decoded {} lines in process for step {} (beam {}, temperature {})",
            lines,
            request.checkpoint_step,
            params.beam_size,
            params.temperature
        );
        Ok(())
    }

    fn run(&self, mode: &str, args: Vec<String>) -> Result<()> {
        tracing::info!("Starting runtime '{}' ({mode})", self.binary);
        tracing::debug!("Spawning: {} {}", self.binary, args.join(" "));

        let status = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .status()
            .with_context(|| format!("Cannot start runtime '{}'", self.binary))?;

        if !status.success() {
            bail!("runtime '{}' failed during {mode}: {status}", self.binary);
        }
        tracing::info!("Runtime finished {mode}");
        Ok(())
    }
}

impl Estimator for ProcessEstimator {
    fn train(&self, request: TrainRequest<'_>) -> Result<()> {
        let args = self.train_args(&request)?;
        self.run("train", args)
    }

    fn evaluate(&self, request: EvalRequest<'_>) -> Result<()> {
        let args = self.eval_args(&request)?;
        self.run(&format!("eval@{}", request.checkpoint_step), args)
    }

    fn infer(&self, request: InferRequest<'_>) -> Result<()> {
        if let Some(predict_fn) = &self.spec.predict_fn {
            return self.decode_in_process(predict_fn, &request);
        }
        let args = self.infer_args(&request);
        self.run(&format!("infer@{}", request.checkpoint_step), args)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset_fn::{mesh_eval_dataset_fn, mesh_train_dataset_fn};
    use crate::data::registry::{Registry, TaskConfig};
    use crate::data::vocabulary::{write_test_vocabulary, SentencePieceVocabulary};
    use crate::domain::config::{ModelType, SentencePieceConfig, DEFAULT_LAYOUT_RULES};
    use crate::domain::traits::LearningRateSchedule;
    use crate::ml::decode::{DecodeParams, DecodeScope};
    use crate::ml::{mesh::tpu_mesh_shape, schedules};
    use serial_test::serial;
    use std::{collections::BTreeMap, sync::Arc};
    use tempfile::{tempdir, TempDir};

    #[derive(Debug)]
    struct Flat;

    impl LearningRateSchedule for Flat {
        fn learning_rate(&self, _step: u64, _total: u64) -> f64 {
            0.01
        }
    }

    /// A task read from TSV files, a word-level vocabulary and a
    /// scratch work dir.
    struct Fixture {
        dir:        TempDir,
        registry:   Registry,
        vocabulary: VocabularyPair,
    }

    impl Fixture {
        fn new(model_file: bool) -> Self {
            let dir = tempdir().unwrap();
            let train = dir.path().join("train.tsv");
            let validation = dir.path().join("validation.tsv");
            fs::write(&train, "hello world\thello\n").unwrap();
            fs::write(&validation, "world\tworld hello\n").unwrap();

            let registry = Registry::new();
            registry
                .register_all(
                    &[TaskConfig {
                        name:   "greetings".into(),
                        splits: BTreeMap::from([
                            ("train".to_string(), train),
                            ("validation".to_string(), validation),
                        ]),
                    }],
                    &[],
                )
                .unwrap();

            let path = write_test_vocabulary(dir.path(), "vocab.json", &["hello", "world"]);
            let config = SentencePieceConfig {
                path,
                extra_ids:  2,
                model_file: model_file.then(|| dir.path().join("spm.model")),
            };
            let vocabulary =
                VocabularyPair::shared(Arc::new(SentencePieceVocabulary::load(&config).unwrap()));
            Self { dir, registry, vocabulary }
        }

        fn work_dir(&self) -> PathBuf {
            self.dir.path().join("work")
        }

        fn estimator(&self, binary: &str, spec: EstimatorSpec) -> ProcessEstimator {
            ProcessEstimator {
                binary:   binary.into(),
                work_dir: self.work_dir(),
                spec,
                cluster:  cluster(),
            }
        }
    }

    fn spec() -> EstimatorSpec {
        EstimatorSpec {
            model_type:             ModelType::Bitransformer,
            input_vocab_size:       7,
            output_vocab_size:      7,
            layout_rules:           DEFAULT_LAYOUT_RULES.parse().unwrap(),
            mesh_shape:             tpu_mesh_shape("2x2", 8).unwrap(),
            model_dir:              PathBuf::from("/models/t5"),
            batch_size:             2,
            sequence_length:        BTreeMap::from([("inputs".into(), 512), ("targets".into(), 512)]),
            autostack:              true,
            learning_rate_schedule: schedules::default_schedule(),
            keep_checkpoint_max:    Some(3),
            save_checkpoints_steps: 5000,
            optimizer:              OptimizerConfig::default(),
            predict_fn:             None,
            variable_filter:        None,
            ensemble_inputs:        None,
            use_tpu:                true,
            tpu_job_name:           None,
            iterations_per_loop:    100,
            init_checkpoint:        None,
        }
    }

    fn cluster() -> Cluster {
        Cluster::Named { name: "t5-pod".into(), zone: Some("us-central1-b".into()), project: None }
    }

    fn has(args: &[String], needle: &str) -> bool {
        args.iter().any(|a| a == needle)
    }

    fn gin_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
        let prefix = format!("--gin_param={key} = ");
        args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
    }

    fn unquote(value: &str) -> PathBuf {
        PathBuf::from(value.trim_matches('\''))
    }

    #[test]
    fn test_factory_accepts_custom_schedule_and_predict_fn() {
        let factory = ProcessEstimatorFactory::new("true", std::env::temp_dir());
        let mut custom = spec();
        custom.learning_rate_schedule = Arc::new(Flat);
        custom.predict_fn = Some(PredictFn::new(|ids, _| ids.to_vec()));
        assert!(factory.build(custom, &Cluster::Local).is_ok());
    }

    #[test]
    fn test_train_stages_task_data_for_the_runtime() {
        let fx = Fixture::new(true);
        let dataset_fn = mesh_train_dataset_fn(&fx.registry, "greetings").unwrap();
        let lengths = spec().sequence_length;
        let args = fx
            .estimator("true", spec())
            .train_args(&TrainRequest {
                vocabulary:      &fx.vocabulary,
                sequence_length: &lengths,
                batch_size:      2,
                dataset_fn:      &dataset_fn,
                steps:           1_000,
                ensemble_inputs: None,
                seed:            0,
            })
            .unwrap();

        assert!(has(&args, "--model_dir=/models/t5"));
        assert!(has(&args, "--tpu=t5-pod"));
        assert!(has(&args, "--tpu_zone=us-central1-b"));
        assert!(!args.iter().any(|a| a.starts_with("--gcp_project")));
        assert!(has(&args, "--gin_param=utils.run.mesh_shape = 'batch:1;model:8'"));
        assert!(has(&args, "--gin_param=utils.run.train_steps = 1000"));
        assert!(has(&args, "--gin_param=utils.run.mixture_or_task_name = 'greetings'"));
        assert!(has(&args, "--gin_param=utils.run.keep_checkpoint_max = 3"));
        assert!(has(&args, "--gin_param=utils.run.optimizer = @optimize.AdafactorOptimizer"));

        // the TSV rows, tokenized with EOS, are what the runtime reads
        let dataset_file = unquote(gin_value(&args, "utils.run.train_dataset_file").unwrap());
        assert_eq!(dataset_file, fx.work_dir().join("greetings").join("train.jsonl"));
        assert_eq!(
            fs::read_to_string(&dataset_file).unwrap(),
            "{\"inputs\":[3,4,1],\"targets\":[3,1]}\n"
        );
    }

    #[test]
    fn test_train_tabulates_learning_rate_schedule() {
        let fx = Fixture::new(true);
        let dataset_fn = mesh_train_dataset_fn(&fx.registry, "greetings").unwrap();
        let lengths = spec().sequence_length;
        let mut custom = spec();
        custom.learning_rate_schedule = Arc::new(Flat);
        let args = fx
            .estimator("true", custom)
            .train_args(&TrainRequest {
                vocabulary:      &fx.vocabulary,
                sequence_length: &lengths,
                batch_size:      2,
                dataset_fn:      &dataset_fn,
                steps:           250,
                ensemble_inputs: Some(4),
                seed:            0,
            })
            .unwrap();

        assert!(has(
            &args,
            "--gin_param=utils.run.learning_rate_schedule = @learning_rate_schedules.tabulated"
        ));
        assert!(has(&args, "--gin_param=utils.run.ensemble_inputs = 4"));
        let table = unquote(gin_value(&args, "tabulated.filename").unwrap());
        assert_eq!(
            fs::read_to_string(table).unwrap(),
            "0\t0.01\n100\t0.01\n200\t0.01\n250\t0.01\n"
        );
    }

    #[test]
    fn test_model_files_replace_vocabulary_sizes() {
        let fx = Fixture::new(true);
        let args = fx.estimator("true", spec()).base_args(&fx.vocabulary);
        let model_file = unquote(gin_value(&args, "inputs_vocabulary.sentencepiece_model_file").unwrap());
        assert_eq!(model_file.extension().unwrap(), "model");
        assert!(gin_value(&args, "targets_vocabulary.sentencepiece_model_file").is_some());
        assert!(has(&args, "--gin_param=inputs_vocabulary.extra_ids = 2"));
        // sizes already include the extra ids, so they are not sent as well
        assert!(gin_value(&args, "utils.build_model.input_vocab_size").is_none());
    }

    #[test]
    fn test_without_model_files_only_sizes_are_passed() {
        let fx = Fixture::new(false);
        let args = fx.estimator("true", spec()).base_args(&fx.vocabulary);
        assert!(has(&args, "--gin_param=utils.build_model.input_vocab_size = 7"));
        assert!(has(&args, "--gin_param=utils.build_model.output_vocab_size = 7"));
        assert!(!args.iter().any(|a| a.contains("sentencepiece_model_file")));
    }

    #[test]
    fn test_eval_stages_one_file_per_task() {
        let fx = Fixture::new(true);
        let dataset_fn = mesh_eval_dataset_fn(&fx.registry, "greetings").unwrap();
        let lengths = spec().sequence_length;
        let args = fx
            .estimator("true", spec())
            .eval_args(&EvalRequest {
                vocabulary:      &fx.vocabulary,
                sequence_length: &lengths,
                batch_size:      2,
                split:           "validation",
                model_dir:       Path::new("/models/t5"),
                dataset_fn:      &dataset_fn,
                summary_dir:     Path::new("/models/t5/eval_validation"),
                checkpoint_step: 5_000,
            })
            .unwrap();

        assert!(has(&args, "--gin_param=utils.run.mode = 'eval'"));
        assert!(has(&args, "--gin_param=utils.run.eval_checkpoint_step = 5000"));
        assert!(has(&args, "--gin_param=utils.run.dataset_split = 'validation'"));
        assert!(has(&args, "--gin_param=utils.run.eval_summary_dir = '/models/t5/eval_validation'"));

        let staged = fx.work_dir().join("greetings").join("validation").join("greetings.jsonl");
        let expected = format!("{{'greetings': '{}'}}", staged.display());
        assert_eq!(gin_value(&args, "utils.run.eval_dataset_files"), Some(expected.as_str()));
        assert_eq!(
            fs::read_to_string(staged).unwrap(),
            "{\"inputs\":[4,1],\"targets\":[4,3,1]}\n"
        );
    }

    #[test]
    fn test_batch_size_and_sequence_length_bound_once() {
        let fx = Fixture::new(true);
        let lengths = spec().sequence_length;
        let request = InferRequest {
            vocabulary:      &fx.vocabulary,
            sequence_length: &lengths,
            batch_size:      2,
            model_type:      ModelType::Bitransformer,
            model_dir:       Path::new("/models/t5"),
            checkpoint_step: 1,
            input_file:      Path::new("/data/in.txt"),
            output_file:     Path::new("/data/out.txt-1"),
        };
        let args = fx.estimator("true", spec()).infer_args(&request);
        for key in ["utils.run.batch_size", "utils.run.sequence_length", "utils.run.model_type"] {
            let prefix = format!("--gin_param={key} = ");
            assert_eq!(args.iter().filter(|a| a.starts_with(&prefix)).count(), 1, "{key}");
        }
        assert!(has(&args, "--gin_param=utils.run.sequence_length = {'inputs': 512, 'targets': 512}"));
    }

    #[test]
    #[serial(decode_params)]
    fn test_infer_args_read_current_decode_params() {
        let fx = Fixture::new(true);
        let lengths = spec().sequence_length;
        let e = fx.estimator("true", spec());
        let request = InferRequest {
            vocabulary:      &fx.vocabulary,
            sequence_length: &lengths,
            batch_size:      2,
            model_type:      ModelType::Bitransformer,
            model_dir:       Path::new("/models/t5"),
            checkpoint_step: 7_000,
            input_file:      Path::new("/data/in.txt"),
            output_file:     Path::new("/data/out.txt-7000"),
        };

        let args = {
            let _scope = DecodeScope::enter(DecodeParams { beam_size: 4, temperature: 0.0 });
            e.infer_args(&request)
        };
        assert!(has(&args, "--gin_param=Bitransformer.decode.beam_size = 4"));
        assert!(has(&args, "--gin_param=decode_from_file.output_filename = '/data/out.txt-7000'"));

        let after = e.infer_args(&request);
        let default = DecodeParams::DEFAULT.beam_size;
        assert!(has(&after, &format!("--gin_param=Bitransformer.decode.beam_size = {default}")));
    }

    #[test]
    #[serial(decode_params)]
    fn test_predict_fn_decodes_in_process() {
        let fx = Fixture::new(true);
        let input = fx.dir.path().join("in.txt");
        let output = fx.dir.path().join("out.txt-10");
        fs::write(&input, "hello world\nworld\n").unwrap();

        // echo the inputs back with the top sentinel in front
        let mut with_fn = spec();
        with_fn.predict_fn = Some(PredictFn::new(|ids, params| {
            assert_eq!(params.beam_size, 3);
            let mut out = vec![6];
            out.extend_from_slice(ids);
            out.push(PAD_ID);
            out
        }));
        let lengths = spec().sequence_length;
        let request = InferRequest {
            vocabulary:      &fx.vocabulary,
            sequence_length: &lengths,
            batch_size:      2,
            model_type:      ModelType::Bitransformer,
            model_dir:       Path::new("/models/t5"),
            checkpoint_step: 10,
            input_file:      &input,
            output_file:     &output,
        };

        // "false" as the runtime: it must not be started
        let _scope = DecodeScope::enter(DecodeParams { beam_size: 3, temperature: 0.0 });
        fx.estimator("false", with_fn).infer(request).unwrap();
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "<extra_id_0> hello world\n<extra_id_0> world\n"
        );
    }

    #[test]
    fn test_quoted_escapes() {
        assert_eq!(quoted("it's"), r"'it\'s'");
        assert_eq!(file_stem("glue/mnli v2"), "glue_mnli_v2");
    }

    #[cfg(unix)]
    #[test]
    #[serial(runtime)]
    fn test_exit_status_is_propagated() {
        let fx = Fixture::new(true);
        let lengths = spec().sequence_length;
        let request = InferRequest {
            vocabulary:      &fx.vocabulary,
            sequence_length: &lengths,
            batch_size:      2,
            model_type:      ModelType::Bitransformer,
            model_dir:       Path::new("/models/t5"),
            checkpoint_step: 1,
            input_file:      Path::new("/data/in.txt"),
            output_file:     Path::new("/data/out.txt-1"),
        };
        assert!(fx.estimator("true", spec()).infer(request).is_ok());
        assert!(fx.estimator("false", spec()).infer(request).is_err());
        assert!(fx.estimator("/nonexistent/runtime", spec()).infer(request).is_err());
    }

    #[cfg(unix)]
    #[test]
    #[serial(runtime)]
    fn test_model_train_hands_registered_data_to_runtime() {
        use crate::application::mtf_model::MtfModel;
        use crate::domain::config::ModelConfig;
        use std::os::unix::fs::PermissionsExt;

        let fx = Fixture::new(true);
        let argv_file = fx.dir.path().join("argv.txt");
        let runtime = fx.dir.path().join("runtime.sh");
        fs::write(&runtime, format!("#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\n", argv_file.display()))
            .unwrap();
        fs::set_permissions(&runtime, fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = ModelConfig::new(fx.dir.path().join("model"), "");
        config.runtime = runtime.display().to_string();
        config.work_dir = fx.work_dir();
        let Fixture { dir, registry, vocabulary } = fx;
        let model = MtfModel::builder(config)
            .registry(Arc::new(registry))
            .vocabulary(vocabulary)
            .build()
            .unwrap();
        model.train("greetings", 10).unwrap();

        let argv = fs::read_to_string(&argv_file).unwrap();
        let args: Vec<String> = argv.lines().map(str::to_string).collect();
        assert!(has(&args, "--gin_param=utils.run.mode = 'train'"));
        let dataset_file = unquote(gin_value(&args, "utils.run.train_dataset_file").unwrap());
        assert!(dataset_file.starts_with(dir.path().join("work")));
        assert!(fs::read_to_string(dataset_file).unwrap().contains("\"inputs\":[3,4,1]"));
    }
}
