// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// The concrete collaborators behind the domain traits. Each one
// talks to something outside the process:
//
//   cluster.rs           — TPU address/name → Cluster
//   checkpoint.rs        — checkpoint files in the model dir,
//                          polling for new ones
//   process_estimator.rs — the mesh runtime, run as a
//                          subprocess per verb
//
// The facade only sees the traits, so tests swap any of these
// for in-memory fakes.

/// TPU cluster resolution
pub mod cluster;

/// Checkpoint discovery and selector resolution
pub mod checkpoint;

/// Subprocess-backed estimator
pub mod process_estimator;
