// ============================================================
// Layer 2 — Application
// ============================================================
// Orchestrates the other layers to train, evaluate and decode.
//
// Rules for this layer:
//   - No model math here (that's the runtime behind Estimator)
//   - No printing here (that's Layer 1)
//   - No direct file or process access (that's Layer 4 and 6)
//   - Only workflow coordination

/// The model facade and its builder
pub mod mtf_model;
