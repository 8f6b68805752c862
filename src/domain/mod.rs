// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain structs, enums and traits describing what the facade
// works with: the configuration bundle, checkpoint selectors,
// the requests handed to the estimator, and the collaborator
// traits the other layers implement.
//
// Rules for this layer:
//   - NO process spawning or network calls
//   - NO file I/O beyond loading a config file
//   - Only plain Rust types and traits

/// The configuration bundle captured at construction
pub mod config;

/// A raw inputs/targets text pair
pub mod example;

/// Which checkpoints eval/predict should run against
pub mod checkpoint;

/// Arguments handed to the estimator for each verb
pub mod requests;

/// Collaborator abstractions the facade depends on
pub mod traits;
