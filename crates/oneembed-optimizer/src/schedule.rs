//! Learning-rate schedules.
//!
//! A schedule maps the global training step to a learning rate. The step is
//! an explicit input; [`ScheduleState`] owns the process-wide counter and
//! advances it exactly once per update batch.

use std::sync::atomic::{AtomicU64, Ordering};

use oneembed_core::LearningRateScheduleOptions;

/// A learning rate schedule function.
pub trait LearningRateFunction: Send + Sync + std::fmt::Debug {
    /// Returns the learning rate at the given `global_step`.
    fn value(&self, global_step: u64) -> f32;
}

/// Polynomial decay learning rate schedule.
///
/// Mirrors TF v1 `tf.compat.v1.train.polynomial_decay`.
#[derive(Debug, Clone, PartialEq)]
pub struct PolynomialDecay {
    pub initial_learning_rate: f32,
    pub decay_steps: u64,
    pub end_learning_rate: f32,
    pub power: f32,
    pub cycle: bool,
}

impl PolynomialDecay {
    /// Creates a new polynomial decay schedule.
    pub fn new(initial_learning_rate: f32, decay_steps: u64) -> Self {
        Self {
            initial_learning_rate,
            decay_steps,
            end_learning_rate: 0.0,
            power: 1.0,
            cycle: false,
        }
    }

    pub fn with_end_learning_rate(mut self, end_learning_rate: f32) -> Self {
        self.end_learning_rate = end_learning_rate;
        self
    }

    pub fn with_power(mut self, power: f32) -> Self {
        self.power = power;
        self
    }

    pub fn with_cycle(mut self, cycle: bool) -> Self {
        self.cycle = cycle;
        self
    }
}

impl LearningRateFunction for PolynomialDecay {
    fn value(&self, global_step: u64) -> f32 {
        let decay_steps = self.decay_steps.max(1);
        let gs = global_step;
        // if cycle:
        //   decay_steps = decay_steps * ceil(gs / decay_steps)
        // else:
        //   gs = min(gs, decay_steps)
        let (gs, decay_steps) = if self.cycle {
            let div = gs.div_ceil(decay_steps).max(1);
            (gs, decay_steps.saturating_mul(div))
        } else {
            (gs.min(decay_steps), decay_steps)
        };
        let step = gs as f64;
        let ds = decay_steps as f64;
        let frac = (1.0 - step / ds).clamp(0.0, 1.0);
        let span = f64::from(self.initial_learning_rate) - f64::from(self.end_learning_rate);
        (span * frac.powf(f64::from(self.power)) + f64::from(self.end_learning_rate)) as f32
    }
}

/// Linear warmup ramp.
///
/// Over steps `[0, warmup_steps)` the multiplier rises linearly from
/// `start_multiplier` toward 1; from `warmup_steps` on it is exactly 1.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearWarmup {
    pub warmup_steps: u64,
    pub start_multiplier: f32,
}

impl LinearWarmup {
    pub fn new(warmup_steps: u64, start_multiplier: f32) -> Self {
        Self {
            warmup_steps,
            start_multiplier,
        }
    }

    /// Returns `true` while `global_step` is inside the ramp.
    pub fn is_warming_up(&self, global_step: u64) -> bool {
        global_step < self.warmup_steps
    }

    /// Multiplier applied to the base rate at `global_step`.
    pub fn multiplier(&self, global_step: u64) -> f32 {
        if !self.is_warming_up(global_step) {
            return 1.0;
        }
        let progress = global_step as f64 / self.warmup_steps as f64;
        let start = f64::from(self.start_multiplier);
        (start + (1.0 - start) * progress) as f32
    }
}

/// Warmup followed by optional decay.
///
/// Decay starts when warmup ends: the decay curve is evaluated at
/// `global_step - warmup_steps`.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningRateSchedule {
    base_learning_rate: f32,
    warmup: Option<LinearWarmup>,
    decay: Option<PolynomialDecay>,
}

impl LearningRateSchedule {
    /// A constant learning rate.
    pub fn constant(base_learning_rate: f32) -> Self {
        Self {
            base_learning_rate,
            warmup: None,
            decay: None,
        }
    }

    /// Builds the schedule described by the options blob.
    pub fn from_options(options: &LearningRateScheduleOptions) -> Self {
        let base = options.learning_rate;
        let warmup = options
            .warmup
            .as_ref()
            .filter(|w| w.warmup_batches > 0)
            .map(|w| LinearWarmup::new(w.warmup_batches, w.start_multiplier));
        let decay = options.learning_rate_decay.as_ref().map(|d| {
            PolynomialDecay::new(base, d.decay_batches)
                .with_end_learning_rate(d.end_learning_rate)
                .with_power(d.power)
                .with_cycle(d.cycle)
        });
        Self {
            base_learning_rate: base,
            warmup,
            decay,
        }
    }

    pub fn with_warmup(mut self, warmup: LinearWarmup) -> Self {
        self.warmup = Some(warmup);
        self
    }

    pub fn with_decay(mut self, decay: PolynomialDecay) -> Self {
        self.decay = Some(decay);
        self
    }

    pub fn base_learning_rate(&self) -> f32 {
        self.base_learning_rate
    }

    fn warmup_steps(&self) -> u64 {
        self.warmup.as_ref().map_or(0, |w| w.warmup_steps)
    }
}

impl LearningRateFunction for LearningRateSchedule {
    fn value(&self, global_step: u64) -> f32 {
        if let Some(warmup) = self.warmup.as_ref().filter(|w| w.is_warming_up(global_step)) {
            return self.base_learning_rate * warmup.multiplier(global_step);
        }
        match &self.decay {
            Some(decay) => decay.value(global_step - self.warmup_steps()),
            None => self.base_learning_rate,
        }
    }
}

/// Process-wide training step counter.
///
/// Starts at 0 (or the step restored from a persisted table) and only moves
/// forward.
#[derive(Debug, Default)]
pub struct ScheduleState {
    step: AtomicU64,
}

impl ScheduleState {
    /// Creates a counter starting at `step`.
    pub fn starting_at(step: u64) -> Self {
        Self {
            step: AtomicU64::new(step),
        }
    }

    /// Returns the step the next update batch will use.
    pub fn current(&self) -> u64 {
        self.step.load(Ordering::Acquire)
    }

    /// Claims the current step for one update batch and advances the counter.
    pub fn advance(&self) -> u64 {
        self.step.fetch_add(1, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oneembed_core::{DecayKind, DecayOptions, WarmupKind, WarmupOptions};

    fn stock_schedule() -> LearningRateSchedule {
        LearningRateSchedule::from_options(&LearningRateScheduleOptions {
            learning_rate: 24.0,
            learning_rate_decay: Some(DecayOptions {
                kind: DecayKind::Polynomial,
                decay_batches: 27772,
                end_learning_rate: 0.0,
                power: 2.0,
                cycle: false,
            }),
            warmup: Some(WarmupOptions {
                kind: WarmupKind::Linear,
                warmup_batches: 2750,
                start_multiplier: 0.0,
            }),
        })
    }

    #[test]
    fn test_polynomial_decay_basic() {
        let lr_fn = PolynomialDecay::new(0.01, 10).with_end_learning_rate(0.11);
        assert!((lr_fn.value(1) - 0.02).abs() < 1e-6);
        assert!((lr_fn.value(2) - 0.03).abs() < 1e-6);
        assert!((lr_fn.value(10) - 0.11).abs() < 1e-6);
        assert!((lr_fn.value(100) - 0.11).abs() < 1e-6);
    }

    #[test]
    fn test_polynomial_decay_cycle_restarts() {
        let lr_fn = PolynomialDecay::new(1.0, 10).with_cycle(true);
        // Step 15 decays over a 20-step window.
        assert!((lr_fn.value(15) - 0.25).abs() < 1e-6);
        assert!(lr_fn.value(11) > lr_fn.value(10));
    }

    #[test]
    fn test_warmup_starts_at_zero_and_reaches_base() {
        let schedule = stock_schedule();
        assert_eq!(schedule.value(0), 0.0);
        assert!((schedule.value(1375) - 12.0).abs() < 1e-3);
        assert_eq!(schedule.value(2750), 24.0);
    }

    #[test]
    fn test_decay_is_monotone_after_warmup() {
        let schedule = stock_schedule();
        let mut previous = schedule.value(2750);
        for step in (2751..=2750 + 27772).step_by(97) {
            let lr = schedule.value(step);
            assert!(lr <= previous, "step {step}: {lr} > {previous}");
            previous = lr;
        }
        assert_eq!(schedule.value(2750 + 27772), 0.0);
        assert_eq!(schedule.value(1_000_000), 0.0);
    }

    #[test]
    fn test_warmup_multiplier_nonzero_start() {
        let warmup = LinearWarmup::new(10, 0.5);
        assert_eq!(warmup.multiplier(0), 0.5);
        assert!((warmup.multiplier(5) - 0.75).abs() < 1e-6);
        assert_eq!(warmup.multiplier(10), 1.0);
    }

    #[test]
    fn test_constant_schedule() {
        let schedule = LearningRateSchedule::constant(0.5);
        assert_eq!(schedule.value(0), 0.5);
        assert_eq!(schedule.value(u64::MAX), 0.5);
    }

    #[test]
    fn test_schedule_state_advances_once_per_call() {
        let state = ScheduleState::starting_at(3);
        assert_eq!(state.advance(), 3);
        assert_eq!(state.advance(), 4);
        assert_eq!(state.current(), 5);
    }
}
