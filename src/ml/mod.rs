// ============================================================
// Layer 5 — ML Layer
// ============================================================
// The model-side values the facade derives or selects before
// handing everything to the runtime:
//
//   mesh.rs      — TPU mesh shape, layout rules, batch sizing
//   schedules.rs — learning rate schedules (Noam by default)
//   decode.rs    — process-wide decode parameters and the
//                  scoped override used by `predict`
//
// No tensors live here; the runtime owns all model math.

/// Mesh shape, layout rules and global batch size
pub mod mesh;

/// Learning rate schedules
pub mod schedules;

/// Beam size / temperature with scoped overrides
pub mod decode;
