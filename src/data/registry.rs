// ============================================================
// Layer 4 — Task / Mixture Registry
// ============================================================
// Named dataset definitions the verbs refer to:
//
//   Task    → a name plus a DataSource that yields raw text
//             examples per split
//   Mixture → a name plus a list of (task name, rate) entries
//
// `Registry::global()` is the process-wide registry the facade
// uses by default. Names are unique across tasks and mixtures.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    sync::{Arc, OnceLock},
};

use crate::domain::example::TextExample;
use crate::domain::traits::DataSource;

// ─── Data sources ─────────────────────────────────────────────────────────────

/// One file per split, each line `inputs<TAB>targets`.
#[derive(Debug, Clone)]
pub struct TsvSource {
    files: BTreeMap<String, PathBuf>,
}

impl TsvSource {
    pub fn new(files: BTreeMap<String, PathBuf>) -> Self {
        Self { files }
    }
}

impl DataSource for TsvSource {
    fn splits(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn load(&self, split: &str) -> Result<Vec<TextExample>> {
        let path = self
            .files
            .get(split)
            .with_context(|| format!("no file configured for split '{split}'"))?;
        let text = fs::read_to_string(path)
            .with_context(|| format!("Cannot read '{}'", path.display()))?;

        let examples = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                let (inputs, targets) = line.split_once('\t').with_context(|| {
                    format!("{}:{}: expected inputs<TAB>targets", path.display(), i + 1)
                })?;
                Ok(TextExample::new(inputs, targets))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(examples)
    }
}

/// Examples held in memory, keyed by split.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    splits: BTreeMap<String, Vec<TextExample>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_split(mut self, split: impl Into<String>, examples: Vec<TextExample>) -> Self {
        self.splits.insert(split.into(), examples);
        self
    }
}

impl DataSource for InMemorySource {
    fn splits(&self) -> Vec<String> {
        self.splits.keys().cloned().collect()
    }

    fn load(&self, split: &str) -> Result<Vec<TextExample>> {
        self.splits
            .get(split)
            .cloned()
            .with_context(|| format!("no examples for split '{split}'"))
    }
}

// ─── Task / Mixture ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Task {
    name:   String,
    source: Arc<dyn DataSource>,
}

impl Task {
    pub fn new(name: impl Into<String>, source: Arc<dyn DataSource>) -> Self {
        Self { name: name.into(), source }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_split(&self, split: &str) -> bool {
        self.source.splits().iter().any(|s| s == split)
    }

    pub fn load(&self, split: &str) -> Result<Vec<TextExample>> {
        self.source
            .load(split)
            .with_context(|| format!("task '{}'", self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureEntry {
    pub task: String,
    #[serde(default = "default_rate")]
    pub rate: f64,
}

fn default_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mixture {
    name:  String,
    tasks: Vec<MixtureEntry>,
}

impl Mixture {
    pub fn new(name: impl Into<String>, tasks: Vec<MixtureEntry>) -> Self {
        Self { name: name.into(), tasks }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What a registered name refers to.
#[derive(Debug, Clone)]
pub enum Provider {
    Task(Arc<Task>),
    Mixture(Arc<Mixture>),
}

impl Provider {
    pub fn name(&self) -> &str {
        match self {
            Provider::Task(t)    => t.name(),
            Provider::Mixture(m) => m.name(),
        }
    }
}

// ─── Config file forms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name:   String,
    /// split name → TSV file
    pub splits: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixtureConfig {
    pub name:  String,
    pub tasks: Vec<MixtureEntry>,
}

// ─── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Registry {
    tasks:    RwLock<BTreeMap<String, Arc<Task>>>,
    mixtures: RwLock<BTreeMap<String, Arc<Mixture>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Registry> {
        static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Registry::new())))
    }

    fn is_registered(&self, name: &str) -> bool {
        self.tasks.read().contains_key(name) || self.mixtures.read().contains_key(name)
    }

    /// Register a task; its name must not be taken by any task or mixture.
    pub fn add_task(&self, task: Task) -> Result<()> {
        if self.is_registered(&task.name) {
            bail!("'{}' is already registered", task.name);
        }
        tracing::debug!("Registered task '{}'", task.name);
        self.tasks.write().insert(task.name.clone(), Arc::new(task));
        Ok(())
    }

    /// Register a mixture of already registered tasks, each with a
    /// positive finite rate.
    pub fn add_mixture(&self, mixture: Mixture) -> Result<()> {
        if self.is_registered(&mixture.name) {
            bail!("'{}' is already registered", mixture.name);
        }
        if mixture.tasks.is_empty() {
            bail!("mixture '{}' has no tasks", mixture.name);
        }
        for entry in &mixture.tasks {
            if !self.tasks.read().contains_key(&entry.task) {
                bail!("mixture '{}' refers to unknown task '{}'", mixture.name, entry.task);
            }
            if !(entry.rate > 0.0 && entry.rate.is_finite()) {
                bail!(
                    "mixture '{}' gives task '{}' a non-positive rate {}",
                    mixture.name, entry.task, entry.rate
                );
            }
        }
        tracing::debug!("Registered mixture '{}' ({} tasks)", mixture.name, mixture.tasks.len());
        self.mixtures.write().insert(mixture.name.clone(), Arc::new(mixture));
        Ok(())
    }

    /// Every registered task and mixture name, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.read().keys().cloned().collect();
        names.extend(self.mixtures.read().keys().cloned());
        names.sort();
        names
    }

    /// Look a name up among tasks first, then mixtures.
    pub fn get(&self, name: &str) -> Result<Provider> {
        if let Some(task) = self.tasks.read().get(name) {
            return Ok(Provider::Task(Arc::clone(task)));
        }
        if let Some(mixture) = self.mixtures.read().get(name) {
            return Ok(Provider::Mixture(Arc::clone(mixture)));
        }
        Err(anyhow!(
            "'{name}' is not a registered task or mixture (registered: [{}])",
            self.names().join(", ")
        ))
    }

    /// A registered task by name; mixtures are not considered.
    pub fn get_task(&self, name: &str) -> Result<Arc<Task>> {
        self.tasks
            .read()
            .get(name)
            .cloned()
            .with_context(|| format!("'{name}' is not a registered task"))
    }

    /// Tasks behind a provider with their sampling rates. A plain
    /// task has rate 1.
    pub fn resolve_tasks(&self, provider: &Provider) -> Result<Vec<(Arc<Task>, f64)>> {
        match provider {
            Provider::Task(task) => Ok(vec![(Arc::clone(task), 1.0)]),
            Provider::Mixture(mixture) => mixture
                .tasks
                .iter()
                .map(|e| Ok((self.get_task(&e.task)?, e.rate)))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("mixture '{}'", mixture.name)),
        }
    }

    /// Register the tasks and mixtures declared in a config file.
    pub fn register_all(&self, tasks: &[TaskConfig], mixtures: &[MixtureConfig]) -> Result<()> {
        for t in tasks {
            self.add_task(Task::new(&t.name, Arc::new(TsvSource::new(t.splits.clone()))))?;
        }
        for m in mixtures {
            self.add_mixture(Mixture::new(&m.name, m.tasks.clone()))?;
        }
        Ok(())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn memory_task(name: &str) -> Task {
        let source = InMemorySource::new()
            .with_split("train", vec![TextExample::new("a", "b")]);
        Task::new(name, Arc::new(source))
    }

    #[test]
    fn test_lookup_task_and_mixture() {
        let r = Registry::new();
        r.add_task(memory_task("squad")).unwrap();
        r.add_mixture(Mixture::new(
            "glue_mix",
            vec![MixtureEntry { task: "squad".into(), rate: 2.0 }],
        ))
        .unwrap();

        assert!(matches!(r.get("squad").unwrap(), Provider::Task(_)));
        let mixture = r.get("glue_mix").unwrap();
        assert_eq!(mixture.name(), "glue_mix");
        let tasks = r.resolve_tasks(&mixture).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].1, 2.0);
    }

    #[test]
    fn test_unknown_name_is_named_in_error() {
        let r = Registry::new();
        r.add_task(memory_task("squad")).unwrap();
        let err = r.get("wmt_ende").unwrap_err().to_string();
        assert!(err.contains("wmt_ende"));
        assert!(err.contains("squad"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let r = Registry::new();
        r.add_task(memory_task("squad")).unwrap();
        assert!(r.add_task(memory_task("squad")).is_err());
        let clash = Mixture::new("squad", vec![MixtureEntry { task: "squad".into(), rate: 1.0 }]);
        assert!(r.add_mixture(clash).is_err());
    }

    #[test]
    fn test_bad_mixtures_rejected() {
        let r = Registry::new();
        r.add_task(memory_task("squad")).unwrap();
        assert!(r.add_mixture(Mixture::new("empty", vec![])).is_err());
        assert!(r
            .add_mixture(Mixture::new("ghost", vec![MixtureEntry { task: "nope".into(), rate: 1.0 }]))
            .is_err());
        assert!(r
            .add_mixture(Mixture::new("zero", vec![MixtureEntry { task: "squad".into(), rate: 0.0 }]))
            .is_err());
    }

    #[test]
    fn test_tsv_source_reads_split_files() {
        let dir = tempdir().unwrap();
        let train = dir.path().join("train.tsv");
        std::fs::write(&train, "translate: hi\thallo\n\nsummarize: x\ty\n").unwrap();

        let source = TsvSource::new(BTreeMap::from([("train".to_string(), train)]));
        assert_eq!(source.splits(), vec!["train".to_string()]);
        let examples = source.load("train").unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0], TextExample::new("translate: hi", "hallo"));
        assert!(source.load("validation").is_err());
    }

    #[test]
    fn test_tsv_source_reports_bad_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.tsv");
        std::fs::write(&path, "ok\tfine\nno tab here\n").unwrap();
        let source = TsvSource::new(BTreeMap::from([("train".to_string(), path)]));
        let err = source.load("train").unwrap_err().to_string();
        assert!(err.contains(":2:"));
    }

    #[test]
    fn test_register_all_from_config() {
        let r = Registry::new();
        let tasks = vec![TaskConfig {
            name:   "qa".into(),
            splits: BTreeMap::from([("train".to_string(), PathBuf::from("train.tsv"))]),
        }];
        let mixtures = vec![MixtureConfig {
            name:  "all".into(),
            tasks: vec![MixtureEntry { task: "qa".into(), rate: 1.0 }],
        }];
        r.register_all(&tasks, &mixtures).unwrap();
        assert_eq!(r.names(), vec!["all".to_string(), "qa".to_string()]);
        assert!(r.get_task("qa").unwrap().has_split("train"));
    }
}
