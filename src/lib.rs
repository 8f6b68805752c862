// ============================================================
// mtf-model
// ============================================================
// A configuration-driven facade over a mesh-parallel transformer
// runtime. Layers, outermost first:
//
//   cli          — Layer 1: clap commands
//   application  — Layer 2: MtfModel facade
//   domain       — Layer 3: config, requests, collaborator traits
//   data         — Layer 4: vocabulary, registry, dataset fns
//   ml           — Layer 5: mesh, schedules, decode parameters
//   infra        — Layer 6: cluster, checkpoints, runtime process

pub mod cli;
pub mod application;
pub mod domain;
pub mod data;
pub mod ml;
pub mod infra;

pub use application::mtf_model::{MtfModel, MtfModelBuilder};
