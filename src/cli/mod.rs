// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction, parsed with `clap`.
// Every command first loads the run file, registers its tasks
// and mixtures in the global registry, and builds the facade.
// All real work is delegated to Layer 2.
//
//   mtf-model --config run.json plan
//   mtf-model --config run.json train   --mixture-or-task NAME --steps N
//   mtf-model --config run.json eval    --mixture-or-task NAME [--checkpoint-step S]...
//   mtf-model --config run.json predict --input-file F --output-file P

pub mod commands;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use commands::{Commands, EvalArgs, PredictArgs, RunFile, TrainArgs};
use crate::application::mtf_model::MtfModel;
use crate::data::registry::Registry;

#[derive(Parser, Debug)]
#[command(
    name = "mtf-model",
    version,
    about = "Train, evaluate and decode mesh transformer models on registered tasks."
)]
pub struct Cli {
    /// JSON run file with `model`, `tasks` and `mixtures`
    #[arg(long, global = true, default_value = "mtf_model.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Load the run file, register its tasks and mixtures, build the
    /// model and dispatch the subcommand.
    pub fn run(self) -> Result<()> {
        let run = RunFile::load(&self.config)?;
        Registry::global().register_all(&run.tasks, &run.mixtures)?;
        tracing::info!(
            "Registered {} tasks and {} mixtures from '{}'",
            run.tasks.len(),
            run.mixtures.len(),
            self.config.display()
        );

        let model = MtfModel::new(run.model)?;
        match self.command {
            Commands::Plan          => Self::run_plan(&model),
            Commands::Train(args)   => Self::run_train(&model, args),
            Commands::Eval(args)    => Self::run_eval(&model, args),
            Commands::Predict(args) => Self::run_predict(&model, args),
        }
    }

    /// Print the resolved configuration as JSON.
    fn run_plan(model: &MtfModel) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(&model.plan())?);
        Ok(())
    }

    /// Train on `--mixture-or-task` for `--steps` steps.
    fn run_train(model: &MtfModel, args: TrainArgs) -> Result<()> {
        model.train(&args.mixture_or_task, args.steps)?;
        println!("Training complete.");
        Ok(())
    }

    /// Evaluate the selected checkpoints, or keep polling when none are given.
    fn run_eval(model: &MtfModel, args: EvalArgs) -> Result<()> {
        let selector = args.selector()?;
        model.eval(
            &args.mixture_or_task,
            selector,
            args.summary_dir.as_deref(),
            Some(&args.split),
        )?;
        println!("Evaluation complete.");
        Ok(())
    }

    /// Decode `--input-file` once per selected checkpoint.
    fn run_predict(model: &MtfModel, args: PredictArgs) -> Result<()> {
        let selector = args.selector()?;
        model.predict(
            selector,
            &args.input_file,
            &args.output_file,
            args.beam_size,
            args.temperature,
        )?;
        println!("Predictions written to {}-<step>", args.output_file.display());
        Ok(())
    }
}
