// ============================================================
// Layer 5 — Decode Parameters
// ============================================================
// Process-wide decoding knobs (beam size, temperature) read by
// the runtime when it decodes. `predict` overrides them for the
// duration of one call through a `DecodeScope`; dropping the
// scope puts the previous values back, including when the call
// returns an error or unwinds.
//
// parking_lot locks do not poison, so a panic inside a scope
// still leaves the parameters readable and restored.

use parking_lot::{const_rwlock, RwLock};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeParams {
    /// Number of beams; 1 means no beam search
    pub beam_size:   usize,
    /// 0.0 is argmax, 1.0 samples from the model distribution.
    /// Must be 0.0 when `beam_size > 1`; the runtime enforces this.
    pub temperature: f64,
}

impl DecodeParams {
    pub const DEFAULT: DecodeParams = DecodeParams { beam_size: 1, temperature: 0.0 };
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

static CURRENT: RwLock<DecodeParams> = const_rwlock(DecodeParams::DEFAULT);

/// The decode parameters in effect right now.
pub fn current() -> DecodeParams {
    *CURRENT.read()
}

/// Guard that holds a decode parameter override until dropped.
#[must_use = "the override is reverted as soon as the scope is dropped"]
#[derive(Debug)]
pub struct DecodeScope {
    previous: DecodeParams,
}

impl DecodeScope {
    pub fn enter(params: DecodeParams) -> Self {
        let previous = std::mem::replace(&mut *CURRENT.write(), params);
        tracing::debug!(
            "decode scope entered: beam_size={} temperature={} (was {:?})",
            params.beam_size,
            params.temperature,
            previous
        );
        Self { previous }
    }
}

impl Drop for DecodeScope {
    fn drop(&mut self) {
        *CURRENT.write() = self.previous;
        tracing::debug!("decode scope exited, restored {:?}", self.previous);
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(decode_params)]
    fn test_scope_overrides_then_restores() {
        let before = current();
        {
            let _scope = DecodeScope::enter(DecodeParams { beam_size: 4, temperature: 0.0 });
            assert_eq!(current().beam_size, 4);
        }
        assert_eq!(current(), before);
    }

    #[test]
    #[serial(decode_params)]
    fn test_nested_scopes_unwind_in_order() {
        let before = current();
        let outer = DecodeScope::enter(DecodeParams { beam_size: 2, temperature: 0.0 });
        {
            let _inner = DecodeScope::enter(DecodeParams { beam_size: 1, temperature: 0.7 });
            assert_eq!(current().temperature, 0.7);
        }
        assert_eq!(current(), DecodeParams { beam_size: 2, temperature: 0.0 });
        drop(outer);
        assert_eq!(current(), before);
    }

    #[test]
    #[serial(decode_params)]
    fn test_scope_restores_after_panic() {
        let before = current();
        let result = std::panic::catch_unwind(|| {
            let _scope = DecodeScope::enter(DecodeParams { beam_size: 8, temperature: 0.0 });
            panic!("decode blew up");
        });
        assert!(result.is_err());
        assert_eq!(current(), before);
    }
}
