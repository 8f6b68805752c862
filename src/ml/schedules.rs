// ============================================================
// Layer 5 — Learning Rate Schedules
// ============================================================
// The schedules a config file can name. A schedule is a pure
// function of (step, total_train_steps). Before training, the
// process estimator evaluates it every `iterations_per_loop`
// steps and hands the runtime the resulting table, so custom
// schedules reach the runtime the same way the built-in ones do.

use std::sync::Arc;

use crate::domain::config::{ConstantConfig, NoamConfig, ScheduleConfig};
use crate::domain::traits::LearningRateSchedule;

/// rsqrt(max(step, warmup)), decayed linearly to zero over the
/// final `linear_decay_fraction` of training.
#[derive(Debug, Clone, Default)]
pub struct NoamSchedule {
    config: NoamConfig,
}

impl NoamSchedule {
    pub fn new(config: NoamConfig) -> Self {
        Self { config }
    }
}

impl LearningRateSchedule for NoamSchedule {
    fn learning_rate(&self, step: u64, total_train_steps: u64) -> f64 {
        let cfg      = &self.config;
        let step_num = step.saturating_sub(cfg.offset) as f64;
        let mut lr   = 1.0 / step_num.max(cfg.warmup_steps as f64).max(1.0).sqrt();

        if cfg.linear_decay_fraction > 0.0 && total_train_steps > 0 {
            let total = total_train_steps as f64;
            let decay = (total - step_num) / (total * cfg.linear_decay_fraction);
            lr *= decay.clamp(0.0, 1.0);
        }
        lr * cfg.multiplier
    }
}

#[derive(Debug, Clone)]
pub struct ConstantSchedule {
    config: ConstantConfig,
}

impl LearningRateSchedule for ConstantSchedule {
    fn learning_rate(&self, _step: u64, _total_train_steps: u64) -> f64 {
        self.config.learning_rate
    }
}

pub fn from_config(config: &ScheduleConfig) -> Arc<dyn LearningRateSchedule> {
    match config {
        ScheduleConfig::Noam(c)     => Arc::new(NoamSchedule::new(c.clone())),
        ScheduleConfig::Constant(c) => Arc::new(ConstantSchedule { config: c.clone() }),
    }
}

/// The schedule used when none is configured.
pub fn default_schedule() -> Arc<dyn LearningRateSchedule> {
    Arc::new(NoamSchedule::default())
}
