use serde::{Deserialize, Serialize};

use crate::config::{TrainingConfig, ValidStrategy};

/// Cadence and early-stopping bookkeeping of validation runs.
#[derive(Debug, Clone)]
pub struct ValidationController {
    valid_steps: usize,
    strategy: ValidStrategy,
    stopping_steps: Option<usize>,
    trigger_count: usize,
    stopping_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoppingState {
    pub stopping_count: usize,
    pub stopped: bool,
}

impl ValidationController {
    pub fn new(valid_steps: usize, strategy: ValidStrategy, stopping_steps: Option<usize>) -> Self {
        Self {
            valid_steps,
            strategy,
            stopping_steps: stopping_steps.filter(|steps| *steps > 0),
            trigger_count: 0,
            stopping_count: 0,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(
            config.valid_steps,
            config.valid_strategy,
            config.stopping_steps,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.valid_steps > 0
    }

    /// Registers one cadence tick of `mode` and reports whether a validation
    /// run is due. Ticks of the other cadence are ignored entirely.
    pub fn should_validate(&mut self, mode: ValidStrategy) -> bool {
        if !self.is_enabled() || mode != self.strategy {
            return false;
        }
        self.trigger_count += 1;
        self.trigger_count % self.valid_steps == 0
    }

    /// Folds one validation outcome into the stopping streak and returns
    /// whether training should stop.
    pub fn record(&mut self, is_best: bool) -> StoppingState {
        let Some(threshold) = self.stopping_steps else {
            return StoppingState {
                stopping_count: self.stopping_count,
                stopped: false,
            };
        };
        if is_best {
            self.stopping_count = 0;
        } else {
            self.stopping_count += 1;
        }
        StoppingState {
            stopping_count: self.stopping_count,
            stopped: self.stopping_count > threshold,
        }
    }

    pub fn trigger_count(&self) -> usize {
        self.trigger_count
    }

    pub fn stopping_count(&self) -> usize {
        self.stopping_count
    }

    pub fn restore(&mut self, trigger_count: usize, stopping_count: usize) {
        self.trigger_count = trigger_count;
        self.stopping_count = stopping_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_valid_steps_never_triggers() {
        let mut controller = ValidationController::new(0, ValidStrategy::Epoch, Some(2));
        for _ in 0..10 {
            assert!(!controller.should_validate(ValidStrategy::Epoch));
            assert!(!controller.should_validate(ValidStrategy::Step));
        }
        assert_eq!(controller.trigger_count(), 0);
    }

    #[test]
    fn triggers_every_nth_tick_of_matching_cadence() {
        let mut controller = ValidationController::new(3, ValidStrategy::Step, None);
        let fired: Vec<bool> = (0..7)
            .map(|_| {
                assert!(!controller.should_validate(ValidStrategy::Epoch));
                controller.should_validate(ValidStrategy::Step)
            })
            .collect();
        assert_eq!(fired, vec![false, false, true, false, false, true, false]);
    }

    #[test]
    fn streak_resets_on_best_and_stops_past_threshold() {
        let mut controller = ValidationController::new(1, ValidStrategy::Epoch, Some(2));
        let outcomes = [true, false, false, true, false, false, false];
        let states: Vec<StoppingState> =
            outcomes.iter().map(|best| controller.record(*best)).collect();
        let counts: Vec<usize> = states.iter().map(|s| s.stopping_count).collect();
        assert_eq!(counts, vec![0, 1, 2, 0, 1, 2, 3]);
        let stops: Vec<bool> = states.iter().map(|s| s.stopped).collect();
        assert_eq!(stops, vec![false, false, false, false, false, false, true]);
    }

    #[test]
    fn no_threshold_means_no_stopping() {
        let mut controller = ValidationController::new(1, ValidStrategy::Epoch, Some(0));
        for _ in 0..5 {
            assert!(!controller.record(false).stopped);
        }
        assert_eq!(controller.stopping_count(), 0);
    }
}
