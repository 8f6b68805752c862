// ============================================================
// Layer 4 — Dataset Functions
// ============================================================
// Binds a registered task/mixture name to a function the
// estimator can call to get tokenized examples:
//
//   mesh_train_dataset_fn(name) → TrainDatasetFn
//       one mixed, shuffled pass over every task's split
//   mesh_eval_dataset_fn(name)  → EvalDatasetFn
//       one dataset per task that has the requested split
//
// The name is resolved against the registry when the function
// is built, so an unknown name fails before any data is read.
//
// Tokenization per feature:
//   text → vocabulary ids → append EOS → truncate to length
//
// A dataset is written for the runtime as JSON lines, one
// example per line:
//   {"inputs":[3,4,1],"targets":[5,1]}

use anyhow::{bail, Context, Result};
use rand::{distributions::WeightedIndex, prelude::*, rngs::StdRng};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
    sync::Arc,
};

use crate::data::registry::{Registry, Task};
use crate::data::vocabulary::{VocabularyPair, EOS_ID};
use crate::domain::config::SequenceLengths;
use crate::domain::example::TextExample;

// ─── Examples and datasets ────────────────────────────────────────────────────

/// One tokenized example: feature key → token ids
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct Example {
    pub features: BTreeMap<String, Vec<u32>>,
}

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    examples: Vec<Example>,
}

impl Dataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Example> {
        self.examples.iter()
    }

    /// Write one JSON object per example to `path`.
    pub fn write_jsonl(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Cannot create dataset file '{}'", path.display()))?;
        let mut out = BufWriter::new(file);
        for example in self.iter() {
            serde_json::to_writer(&mut out, example)?;
            out.write_all(b"\n")?;
        }
        out.flush()
            .with_context(|| format!("Cannot write dataset file '{}'", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct EvalDataset {
    pub task_name: String,
    pub dataset:   Dataset,
}

fn tokenize(
    example:         &TextExample,
    vocabulary:      &VocabularyPair,
    sequence_length: &SequenceLengths,
) -> Result<Example> {
    let mut features = BTreeMap::new();
    for (key, &len) in sequence_length {
        let Some(text) = example.feature(key) else { continue };
        let mut ids = vocabulary.for_feature(key).encode(text)?;
        ids.push(EOS_ID);
        ids.truncate(len);
        features.insert(key.clone(), ids);
    }
    Ok(Example { features })
}

fn tokenize_split(
    task:            &Task,
    split:           &str,
    vocabulary:      &VocabularyPair,
    sequence_length: &SequenceLengths,
) -> Result<Vec<Example>> {
    task.load(split)?
        .iter()
        .map(|ex| tokenize(ex, vocabulary, sequence_length))
        .collect()
}

// ─── Train ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainDatasetFn {
    name:  String,
    tasks: Vec<(Arc<Task>, f64)>,
}

pub fn mesh_train_dataset_fn(registry: &Registry, mixture_or_task_name: &str) -> Result<TrainDatasetFn> {
    let provider = registry.get(mixture_or_task_name)?;
    let tasks    = registry.resolve_tasks(&provider)?;
    Ok(TrainDatasetFn { name: provider.name().to_string(), tasks })
}

impl TrainDatasetFn {
    pub fn mixture_or_task_name(&self) -> &str {
        &self.name
    }

    /// One pass over the split. Mixtures draw each example from a
    /// task chosen in proportion to its rate, cycling through that
    /// task's examples; the draw count equals the total example count.
    pub fn call(
        &self,
        vocabulary:      &VocabularyPair,
        sequence_length: &SequenceLengths,
        split:           &str,
        seed:            u64,
    ) -> Result<Dataset> {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut per_task: Vec<(Vec<Example>, f64)> = Vec::with_capacity(self.tasks.len());
        for (task, rate) in &self.tasks {
            let mut examples = tokenize_split(task, split, vocabulary, sequence_length)?;
            examples.shuffle(&mut rng);
            if !examples.is_empty() {
                per_task.push((examples, *rate));
            }
        }

        let total: usize = per_task.iter().map(|(e, _)| e.len()).sum();
        if total == 0 {
            bail!("'{}' has no examples in split '{split}'", self.name);
        }
        if per_task.len() == 1 {
            let (examples, _) = per_task.remove(0);
            return Ok(Dataset::new(examples));
        }

        let weights = WeightedIndex::new(per_task.iter().map(|(_, rate)| *rate))?;
        let mut cursors = vec![0usize; per_task.len()];
        let mixed = (0..total)
            .map(|_| {
                let t = weights.sample(&mut rng);
                let (examples, _) = &per_task[t];
                let ex = examples[cursors[t] % examples.len()].clone();
                cursors[t] += 1;
                ex
            })
            .collect();

        tracing::debug!("'{}': mixed {} examples from {} tasks", self.name, total, per_task.len());
        Ok(Dataset::new(mixed))
    }
}

// ─── Eval ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EvalDatasetFn {
    name:  String,
    tasks: Vec<Arc<Task>>,
}

pub fn mesh_eval_dataset_fn(registry: &Registry, mixture_or_task_name: &str) -> Result<EvalDatasetFn> {
    let provider = registry.get(mixture_or_task_name)?;
    let tasks    = registry
        .resolve_tasks(&provider)?
        .into_iter()
        .map(|(task, _)| task)
        .collect();
    Ok(EvalDatasetFn { name: provider.name().to_string(), tasks })
}

impl EvalDatasetFn {
    pub fn mixture_or_task_name(&self) -> &str {
        &self.name
    }

    /// One dataset per task with the split. Tasks without it are
    /// skipped; it is an error if none have it.
    pub fn call(
        &self,
        vocabulary:      &VocabularyPair,
        sequence_length: &SequenceLengths,
        split:           &str,
    ) -> Result<Vec<EvalDataset>> {
        let mut datasets = Vec::new();
        for task in &self.tasks {
            if !task.has_split(split) {
                tracing::warn!("Skipping task '{}': no '{split}' split", task.name());
                continue;
            }
            let examples = tokenize_split(task, split, vocabulary, sequence_length)?;
            datasets.push(EvalDataset {
                task_name: task.name().to_string(),
                dataset:   Dataset::new(examples),
            });
        }
        if datasets.is_empty() {
            bail!("no task in '{}' has a '{split}' split", self.name);
        }
        Ok(datasets)
    }
}
