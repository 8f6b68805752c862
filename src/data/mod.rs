// ============================================================
// Layer 4 — Data Layer
// ============================================================
// Everything between a task name in a config file and the
// token ids an estimator consumes:
//
//   registry name ("glue_mixture")
//       │
//       ▼
//   Registry          → task or mixture of tasks with rates
//       │
//       ▼
//   DatasetFn         → loads a split, tokenizes, mixes
//       │
//       ▼
//   Vocabulary        → text ↔ ids, plus sentinel extra ids
//
// The facade never builds datasets itself; it builds the
// dataset functions and hands them to the estimator.

/// SentencePiece-style vocabularies backed by `tokenizers`
pub mod vocabulary;

/// Named tasks and mixtures, process-wide registry
pub mod registry;

/// Train/eval dataset functions bound to a registry name
pub mod dataset_fn;
