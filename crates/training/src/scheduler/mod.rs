use std::f64::consts::PI;

use candle_core::backprop::GradStore;

use crate::{
    config::SchedulerKwargs,
    error::Result,
    optimizer::{Optimizer, OptimizerKind, OptimizerState},
    TrainingError,
};

pub trait LRScheduler: Send {
    /// Advances one step and returns the rate to use for it.
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn steps(&self) -> usize;
    /// Fast-forwards to a step count taken from saved state.
    fn restore(&mut self, steps: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    InverseSquareRoot,
    Cosine,
    Linear,
    Constant,
}

impl SchedulerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "inverse" => Some(Self::InverseSquareRoot),
            "cosine" => Some(Self::Cosine),
            "linear" => Some(Self::Linear),
            "constant" => Some(Self::Constant),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::InverseSquareRoot => "inverse",
            Self::Cosine => "cosine",
            Self::Linear => "linear",
            Self::Constant => "constant",
        }
    }

    /// Decaying schedules need to know where the decay ends.
    pub fn requires_total_steps(self) -> bool {
        matches!(self, Self::Cosine | Self::Linear)
    }
}

/// Linear warmup to `max_lr` followed by the decay of `kind`.
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    kind: SchedulerKind,
    max_lr: f64,
    min_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
    current_lr: f64,
}

impl WarmupSchedule {
    pub fn new(kind: SchedulerKind, kwargs: &SchedulerKwargs, base_lr: f64) -> Result<Self> {
        let max_lr = kwargs.max_lr.unwrap_or(base_lr);
        if max_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires max_lr > 0",
            ));
        }
        if kwargs.min_lr < 0.0 || kwargs.min_lr > max_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, max_lr]",
            ));
        }
        let total_steps = match (kind.requires_total_steps(), kwargs.total_steps) {
            (true, None) => {
                return Err(TrainingError::initialization(format!(
                    "the {} scheduler requires total_steps",
                    kind.name()
                )))
            }
            (_, total) => total.unwrap_or(0),
        };
        Ok(Self {
            kind,
            max_lr,
            min_lr: kwargs.min_lr,
            warmup_steps: kwargs.warmup_steps,
            total_steps,
            step: 0,
            current_lr: if kwargs.warmup_steps > 0 { 0.0 } else { max_lr },
        })
    }

    fn initial_lr(&self) -> f64 {
        if self.warmup_steps > 0 {
            0.0
        } else {
            self.max_lr
        }
    }

    /// Rate for the `step`-th update, counted from one.
    fn compute_lr(&self, step: usize) -> f64 {
        let step = step.max(1);
        if self.warmup_steps > 0 && step <= self.warmup_steps {
            return self.max_lr * step as f64 / self.warmup_steps as f64;
        }

        match self.kind {
            SchedulerKind::Constant => self.max_lr,
            SchedulerKind::InverseSquareRoot => {
                self.max_lr * (self.warmup_steps.max(1) as f64 / step as f64).sqrt()
            }
            SchedulerKind::Cosine => {
                let progress = self.decay_progress(step);
                self.min_lr + (self.max_lr - self.min_lr) * 0.5 * (1.0 + f64::cos(PI * progress))
            }
            SchedulerKind::Linear => {
                let progress = self.decay_progress(step);
                self.min_lr + (self.max_lr - self.min_lr) * (1.0 - progress)
            }
        }
    }

    fn decay_progress(&self, step: usize) -> f64 {
        if self.total_steps <= self.warmup_steps {
            return 1.0;
        }
        let effective = step.saturating_sub(self.warmup_steps) as f64;
        let span = (self.total_steps - self.warmup_steps) as f64;
        (effective / span).clamp(0.0, 1.0)
    }
}

impl LRScheduler for WarmupSchedule {
    fn step(&mut self) -> f64 {
        self.step = self.step.saturating_add(1);
        self.current_lr = self.compute_lr(self.step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn steps(&self) -> usize {
        self.step
    }

    fn restore(&mut self, steps: usize) {
        self.step = steps;
        self.current_lr = if steps > 0 {
            self.compute_lr(steps)
        } else {
            self.initial_lr()
        };
    }
}

/// An optimizer whose learning rate is set by a schedule before each step.
pub struct ScheduledOptimizer {
    inner: Box<dyn Optimizer>,
    scheduler: Box<dyn LRScheduler>,
}

impl ScheduledOptimizer {
    pub fn new(inner: Box<dyn Optimizer>, scheduler: Box<dyn LRScheduler>) -> Self {
        Self { inner, scheduler }
    }
}

impl Optimizer for ScheduledOptimizer {
    fn kind(&self) -> OptimizerKind {
        self.inner.kind()
    }

    /// The schedule only advances when the wrapped optimizer actually
    /// updated; a failed or gradient-less step leaves both untouched.
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let inner_steps = self.inner.steps();
        let scheduler_steps = self.scheduler.steps();
        let previous_lr = self.inner.learning_rate();

        let lr = self.scheduler.step();
        self.inner.set_learning_rate(lr);
        let outcome = self.inner.step(grads);
        if outcome.is_err() || self.inner.steps() == inner_steps {
            self.scheduler.restore(scheduler_steps);
            self.inner.set_learning_rate(previous_lr);
        }
        outcome
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    fn steps(&self) -> usize {
        self.inner.steps()
    }

    fn state(&self) -> Result<OptimizerState> {
        let mut state = self.inner.state()?;
        state.scheduler_step = Some(self.scheduler.steps());
        Ok(state)
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        let scheduler_step = state.scheduler_step.ok_or_else(|| {
            TrainingError::state_mismatch("optimizer state carries no scheduler progress")
        })?;
        self.inner.load_state(state)?;
        self.scheduler.restore(scheduler_step);
        Ok(())
    }
}
