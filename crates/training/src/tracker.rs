//! Epoch-scoped loss and metric bookkeeping.
//!
//! Scopes form a stack: a validation epoch opened while a training epoch is
//! still running is pushed on top of it and popping it hands the training
//! accumulators back untouched.

use std::{collections::BTreeMap, fmt, time::Instant};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{context::RunContext, error::Result, TrainingError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    pub train_step: usize,
    pub train_epoch: usize,
    pub valid_epoch: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochMode {
    Train,
    Valid,
}

impl EpochMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EpochMode::Train => "train",
            EpochMode::Valid => "valid",
        }
    }
}

impl fmt::Display for EpochMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub mode: EpochMode,
    pub epoch: usize,
    pub timestamp: Timestamp,
    pub loss: Option<f64>,
    #[serde(deserialize_with = "deserialize_metric_map")]
    pub metrics: BTreeMap<String, f64>,
    pub is_best: bool,
    #[serde(default)]
    pub elapsed_secs: f64,
}

impl EpochSummary {
    /// Metrics plus the epoch loss under the `loss` key.
    pub fn as_dict(&self) -> BTreeMap<String, f64> {
        let mut dict = self.metrics.clone();
        if let Some(loss) = self.loss {
            dict.entry("loss".to_string()).or_insert(loss);
        }
        dict
    }

    pub fn as_str(&self) -> String {
        let mut line = format!(
            "{} epoch {} [time: {:.2}s, step: {}]",
            self.mode, self.epoch, self.elapsed_secs, self.timestamp.train_step
        );
        for (name, value) in self.as_dict() {
            line.push_str(&format!(" {name}: {value:.4}"));
        }
        if self.is_best {
            line.push_str(" <== best");
        }
        line
    }
}

impl fmt::Display for EpochSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Serializable part of the tracker carried inside checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerState {
    pub axes: Timestamp,
    pub best_valid_score: Option<f64>,
    pub best_valid_timestamp: Timestamp,
}

#[derive(Debug)]
struct EpochScope {
    mode: EpochMode,
    epoch: usize,
    started: Instant,
    steps: usize,
    loss_sum: f64,
    loss_count: usize,
    metrics: BTreeMap<String, f64>,
}

impl EpochScope {
    fn new(mode: EpochMode, epoch: usize) -> Self {
        Self {
            mode,
            epoch,
            started: Instant::now(),
            steps: 0,
            loss_sum: 0.0,
            loss_count: 0,
            metrics: BTreeMap::new(),
        }
    }

    fn loss(&self) -> Option<f64> {
        (self.loss_count > 0).then(|| self.loss_sum / self.loss_count as f64)
    }
}

pub struct SummaryTracker {
    ctx: RunContext,
    axes: Timestamp,
    scopes: Vec<EpochScope>,
    metrics_for_best_model: Vec<String>,
    best_valid_score: f64,
    best_valid_timestamp: Timestamp,
    is_best_valid: bool,
    train_started: bool,
}

impl SummaryTracker {
    pub fn new(metrics_for_best_model: Vec<String>, ctx: RunContext) -> Self {
        Self {
            ctx,
            axes: Timestamp::default(),
            scopes: Vec::new(),
            metrics_for_best_model,
            best_valid_score: f64::NEG_INFINITY,
            best_valid_timestamp: Timestamp::default(),
            is_best_valid: false,
            train_started: false,
        }
    }

    /// Opens an epoch scope on top of whatever is currently open.
    ///
    /// Training epochs are numbered from zero; validation epochs from one, so
    /// the valid epoch doubles as a checkpoint serial.
    pub fn new_epoch(&mut self, mode: EpochMode) {
        let epoch = match mode {
            EpochMode::Train => {
                if self.train_started {
                    self.axes.train_epoch += 1;
                }
                self.train_started = true;
                self.axes.train_epoch
            }
            EpochMode::Valid => {
                self.axes.valid_epoch += 1;
                self.axes.valid_epoch
            }
        };
        self.scopes.push(EpochScope::new(mode, epoch));
    }

    pub fn new_step(&mut self) -> Result<()> {
        let scope = self.current_mut()?;
        scope.steps += 1;
        if scope.mode == EpochMode::Train {
            self.axes.train_step += 1;
        }
        Ok(())
    }

    pub fn append_loss(&mut self, value: f64) -> Result<()> {
        let scope = self.current_mut()?;
        scope.loss_sum += value;
        scope.loss_count += 1;
        Ok(())
    }

    pub fn set_metrics_results(&mut self, results: BTreeMap<String, f64>) -> Result<()> {
        self.current_mut()?.metrics.extend(results);
        Ok(())
    }

    pub fn epoch_loss(&self) -> Option<f64> {
        self.scopes.last().and_then(EpochScope::loss)
    }

    pub fn epoch_dict(&self) -> BTreeMap<String, f64> {
        let Some(scope) = self.scopes.last() else {
            return BTreeMap::new();
        };
        let mut dict = scope.metrics.clone();
        if let Some(loss) = scope.loss() {
            dict.entry("loss".to_string()).or_insert(loss);
        }
        dict
    }

    pub fn current_mode(&self) -> Option<EpochMode> {
        self.scopes.last().map(|scope| scope.mode)
    }

    /// Pops the innermost scope into a summary. Closing a validation scope
    /// also decides whether it beat the best score so far.
    pub fn end_epoch(&mut self) -> Result<EpochSummary> {
        let dict = self.epoch_dict();
        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| TrainingError::runtime("no epoch scope is open"))?;

        let is_best = match scope.mode {
            EpochMode::Train => false,
            EpochMode::Valid => {
                let score = self.score(&dict);
                let is_best = score > self.best_valid_score;
                if is_best {
                    self.best_valid_score = score;
                    self.best_valid_timestamp = self.axes;
                }
                self.is_best_valid = is_best;
                is_best
            }
        };

        Ok(EpochSummary {
            mode: scope.mode,
            epoch: scope.epoch,
            timestamp: self.axes,
            loss: scope.loss(),
            metrics: scope.metrics,
            is_best,
            elapsed_secs: scope.started.elapsed().as_secs_f64(),
        })
    }

    pub fn is_best_valid(&self) -> bool {
        self.is_best_valid
    }

    /// `None` until a validation has produced a finite score.
    pub fn best_valid_score(&self) -> Option<f64> {
        self.best_valid_score.is_finite().then_some(self.best_valid_score)
    }

    pub fn best_valid_timestamp(&self) -> Timestamp {
        self.best_valid_timestamp
    }

    pub fn axes(&self) -> Timestamp {
        self.axes
    }

    pub fn state(&self) -> TrackerState {
        TrackerState {
            axes: self.axes,
            best_valid_score: self.best_valid_score(),
            best_valid_timestamp: self.best_valid_timestamp,
        }
    }

    pub fn restore(&mut self, state: TrackerState) {
        self.axes = state.axes;
        self.best_valid_score = state.best_valid_score.unwrap_or(f64::NEG_INFINITY);
        self.best_valid_timestamp = state.best_valid_timestamp;
        self.is_best_valid = false;
        self.train_started = true;
        self.scopes.clear();
    }

    /// Sum of the selection metrics, with loss counted negatively so that
    /// higher is always better.
    fn score(&self, dict: &BTreeMap<String, f64>) -> f64 {
        let mut score = 0.0;
        for metric in &self.metrics_for_best_model {
            match dict.get(metric) {
                Some(value) if metric == "loss" => score -= value,
                Some(value) => score += value,
                None => self.ctx.logger().warn(format!(
                    "metric '{metric}' used for model selection was not produced by validation"
                )),
            }
        }
        score
    }

    fn current_mut(&mut self) -> Result<&mut EpochScope> {
        self.scopes
            .last_mut()
            .ok_or_else(|| TrainingError::runtime("no epoch scope is open"))
    }
}

/// Non-finite metric values are written as `null` by serde_json.
fn deserialize_metric_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Option<f64>> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, value)| (name, value.unwrap_or(f64::NAN)))
        .collect())
}
