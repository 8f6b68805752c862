// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the four subcommands: `plan`, `train`, `eval` and
// `predict`, plus the JSON run file every command reads.
//
// Run file layout:
//   {
//     "model":    { ...ModelConfig... },
//     "tasks":    [ { "name": "...", "splits": { "train": "a.tsv" } } ],
//     "mixtures": [ { "name": "...", "tasks": [ { "task": "...", "rate": 1.0 } ] } ]
//   }

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Deserialize;
use std::{fs, path::{Path, PathBuf}};

use crate::data::registry::{MixtureConfig, TaskConfig};
use crate::domain::checkpoint::CheckpointSelector;
use crate::domain::config::ModelConfig;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve the configuration and print it without running anything
    Plan,

    /// Train on a registered task or mixture
    Train(TrainArgs),

    /// Evaluate checkpoints on a registered task or mixture
    Eval(EvalArgs),

    /// Decode an input file with one or more checkpoints
    Predict(PredictArgs),
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Task or mixture name from the run file
    #[arg(long)]
    pub mixture_or_task: String,

    /// Total number of training steps
    #[arg(long)]
    pub steps: u64,
}

#[derive(Args, Debug)]
pub struct EvalArgs {
    #[arg(long)]
    pub mixture_or_task: String,

    /// Checkpoint step to evaluate; repeat for several, or pass
    /// `latest`. Omit to keep evaluating new checkpoints as they appear.
    #[arg(long = "checkpoint-step")]
    pub checkpoint_steps: Vec<String>,

    /// Defaults to <model_dir>/eval_<split>
    #[arg(long)]
    pub summary_dir: Option<PathBuf>,

    #[arg(long, default_value = "validation")]
    pub split: String,
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Same forms as `eval --checkpoint-step`
    #[arg(long = "checkpoint-step")]
    pub checkpoint_steps: Vec<String>,

    /// One prompt per line
    #[arg(long)]
    pub input_file: PathBuf,

    /// Predictions are written to <output-file>-<step>
    #[arg(long)]
    pub output_file: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub beam_size: usize,

    /// 0.0 is argmax; must be 0.0 when beam size is above 1
    #[arg(long, default_value_t = 1.0)]
    pub temperature: f64,
}

impl EvalArgs {
    pub fn selector(&self) -> Result<CheckpointSelector> {
        CheckpointSelector::from_args(&self.checkpoint_steps)
    }
}

impl PredictArgs {
    pub fn selector(&self) -> Result<CheckpointSelector> {
        CheckpointSelector::from_args(&self.checkpoint_steps)
    }
}

/// Contents of the `--config` file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunFile {
    pub model: ModelConfig,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub mixtures: Vec<MixtureConfig>,
}

impl RunFile {
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read run file '{}'", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("Invalid run file '{}'", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;
    use tempfile::tempdir;

    #[test]
    fn test_eval_without_steps_is_continuous() {
        let cli = Cli::parse_from(["mtf-model", "--config", "run.json", "eval", "--mixture-or-task", "squad"]);
        match cli.command {
            Commands::Eval(args) => {
                assert_eq!(args.selector().unwrap(), CheckpointSelector::Continuous);
                assert_eq!(args.split, "validation");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_predict_repeated_steps() {
        let cli = Cli::parse_from([
            "mtf-model", "--config", "run.json", "predict",
            "--checkpoint-step", "1000", "--checkpoint-step", "2000",
            "--input-file", "in.txt", "--output-file", "out.txt", "--beam-size", "4",
            "--temperature", "0.0",
        ]);
        match cli.command {
            Commands::Predict(args) => {
                assert_eq!(args.selector().unwrap(), CheckpointSelector::Steps(vec![1000, 2000]));
                assert_eq!(args.beam_size, 4);
                assert_eq!(args.temperature, 0.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_run_file_loads_model_tasks_and_mixtures() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(
            &path,
            r#"{
                "model": { "model_dir": "/models/t5", "tpu": "", "sequence_length": 128 },
                "tasks": [ { "name": "squad", "splits": { "train": "squad.tsv" } } ],
                "mixtures": [ { "name": "mix", "tasks": [ { "task": "squad", "rate": 2.0 } ] } ]
            }"#,
        )
        .unwrap();
        let run = RunFile::load(&path).unwrap();
        assert_eq!(run.model.model_dir, PathBuf::from("/models/t5"));
        assert_eq!(run.tasks[0].name, "squad");
        assert_eq!(run.mixtures[0].tasks[0].rate, 2.0);
    }
}
