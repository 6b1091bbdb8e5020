//! Learning-rate schedule: linear warmup followed by a decay policy.
//!
//! `rate_for(step)` is a pure function of the step and the parameters fixed
//! at construction. [`ScheduleState`] only adds the step counter the
//! orchestrator advances once per optimizer step.

use crate::config::{ExperimentConfig, LrPolicy};
use crate::error::TrainError;

/// Post-warmup decay with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum DecayPolicy {
    /// Rate stays at `base_lr`.
    Constant,
    /// Half-cosine from `base_lr` at the end of warmup to `min_lr` at `total_steps`.
    Cosine { total_steps: usize, min_lr: f64 },
    /// `base_lr * gamma^(milestones <= epoch)` with `epoch = step / steps_per_epoch`.
    Staged {
        milestones: Vec<usize>,
        gamma: f64,
        steps_per_epoch: usize,
    },
}

/// Immutable schedule parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LrScheduler {
    pub base_lr: f64,
    pub warmup_factor: f64,
    pub warmup_iters: usize,
    pub policy: DecayPolicy,
}

impl LrScheduler {
    /// Build from `train.*`. `steps_per_epoch` converts epochs (max_epoch,
    /// stepsize) into optimizer steps.
    pub fn from_config(config: &ExperimentConfig, steps_per_epoch: usize) -> Result<Self, TrainError> {
        if steps_per_epoch == 0 {
            return Err(TrainError::config("steps_per_epoch must be > 0"));
        }
        let t = &config.train;
        let policy = match t.lr_scheduler {
            None => DecayPolicy::Constant,
            Some(LrPolicy::Cosine) => DecayPolicy::Cosine {
                total_steps: t.max_epoch * steps_per_epoch,
                min_lr: t.min_lr,
            },
            Some(LrPolicy::Staged) => DecayPolicy::Staged {
                milestones: t.stepsize.clone(),
                gamma: t.gamma,
                steps_per_epoch,
            },
        };
        Ok(LrScheduler {
            base_lr: t.lr,
            warmup_factor: t.warmup_factor,
            warmup_iters: t.warmup_iters,
            policy,
        })
    }

    /// Learning rate for a 0-based optimizer step.
    ///
    /// - Warmup (`step < warmup_iters`): linear from `base_lr * warmup_factor`
    ///   to `base_lr`.
    /// - Then the decay policy.
    pub fn rate_for(&self, step: usize) -> f64 {
        if self.warmup_iters > 0 && step < self.warmup_iters {
            let progress = step as f64 / self.warmup_iters as f64;
            return self.base_lr * (self.warmup_factor + (1.0 - self.warmup_factor) * progress);
        }
        match &self.policy {
            DecayPolicy::Constant => self.base_lr,
            DecayPolicy::Cosine { total_steps, min_lr } => {
                let decay_steps = total_steps.saturating_sub(self.warmup_iters).max(1);
                let progress = step.saturating_sub(self.warmup_iters) as f64 / decay_steps as f64;
                let progress = progress.min(1.0);
                let lr = self.base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                lr.max(*min_lr)
            }
            DecayPolicy::Staged {
                milestones,
                gamma,
                steps_per_epoch,
            } => {
                let epoch = step / steps_per_epoch;
                let crossed = milestones.iter().filter(|&&m| m <= epoch).count();
                self.base_lr * gamma.powi(crossed as i32)
            }
        }
    }

    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        let decay = match &self.policy {
            DecayPolicy::Constant => "constant".to_string(),
            DecayPolicy::Cosine { total_steps, min_lr } => {
                format!("cosine(total_steps={total_steps}, min_lr={min_lr:.1e})")
            }
            DecayPolicy::Staged {
                milestones, gamma, ..
            } => format!("staged(milestones={milestones:?}, gamma={gamma})"),
        };
        format!(
            "base_lr={:.2e} warmup={}x{} then {decay}",
            self.base_lr, self.warmup_iters, self.warmup_factor
        )
    }
}

/// Scheduler plus the step counter of the run.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    scheduler: LrScheduler,
    step: usize,
}

impl ScheduleState {
    pub fn new(scheduler: LrScheduler, start_step: usize) -> Self {
        Self {
            scheduler,
            step: start_step,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    /// Rate for the current step.
    pub fn current_rate(&self) -> f64 {
        self.scheduler.rate_for(self.step)
    }

    /// Record one optimizer step.
    pub fn advance(&mut self) {
        self.step += 1;
    }
}
