#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    path::Path,
    rc::Rc,
};

use candle_core::{Device, Tensor, Var};
use training::{
    config::{ExperimentSettings, LoggingConfig, OptimizerConfig},
    evaluation::{DialogueBatch, Evaluator, MetricMap, DB_PLACEHOLDER},
    ConfigOverride, Coordinator, ExperimentConfig, InMemoryLoader, Model, Result,
};

/// Experiment config writing into `dir`, with `key=value` overrides.
pub fn config(dir: &Path, overrides: &[&str]) -> ExperimentConfig {
    let base = ExperimentConfig {
        experiment: ExperimentSettings {
            saved_dir: dir.to_path_buf(),
            ..ExperimentSettings::new("toy", "unit")
        },
        optimizer: OptimizerConfig {
            name: "adam".into(),
            learning_rate: 0.05,
            ..OptimizerConfig::default()
        },
        training: Default::default(),
        evaluation: Default::default(),
        logging: LoggingConfig {
            show_progress: false,
            ..LoggingConfig::default()
        },
    };
    let overrides: Vec<ConfigOverride> = overrides
        .iter()
        .map(|raw| raw.parse().expect("override parses"))
        .collect();
    base.with_overrides(&overrides).expect("overrides apply")
}

#[derive(Debug, Clone)]
pub struct Points {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
}

/// Batches of points on `y = 2x + 1`, `per_batch` points each.
pub fn line_loader(batches: usize, per_batch: usize) -> InMemoryLoader<Points> {
    let data = (0..batches)
        .map(|batch| {
            let x: Vec<f32> = (0..per_batch)
                .map(|i| (batch * per_batch + i) as f32 / 10.0)
                .collect();
            let y = x.iter().map(|x| 2.0 * x + 1.0).collect();
            Points { x, y }
        })
        .collect();
    InMemoryLoader::new(data)
}

/// `y = w * x + b` trained with mean squared error.
pub struct LinearRegressor {
    weight: Var,
    bias: Var,
    training: bool,
}

impl LinearRegressor {
    pub fn new() -> Self {
        Self {
            weight: Var::new(&[0.5f32], &Device::Cpu).expect("weight"),
            bias: Var::new(&[0.0f32], &Device::Cpu).expect("bias"),
            training: true,
        }
    }

    /// Same parameter names as [`LinearRegressor::new`] with a two-wide weight.
    pub fn widened() -> Self {
        Self {
            weight: Var::new(&[0.5f32, 0.5], &Device::Cpu).expect("weight"),
            ..Self::new()
        }
    }

    pub fn weights(&self) -> (f32, f32) {
        let read = |var: &Var| var.as_tensor().to_vec1::<f32>().expect("read")[0];
        (read(&self.weight), read(&self.bias))
    }

    fn predict(&self, x: &[f32]) -> Result<Tensor> {
        let x = Tensor::from_slice(x, (x.len(),), &Device::Cpu)?;
        Ok(x.broadcast_mul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?)
    }
}

impl Model for LinearRegressor {
    type Batch = Points;

    fn name(&self) -> &str {
        "toy"
    }

    fn forward(&self, batch: &Points, _epoch_idx: usize) -> Result<Tensor> {
        let target = Tensor::from_slice(&batch.y, (batch.y.len(),), &Device::Cpu)?;
        Ok(candle_nn::loss::mse(&self.predict(&batch.x)?, &target)?)
    }

    fn generate(&self, batch: &Points) -> Result<Vec<String>> {
        Ok(self
            .predict(&batch.x)?
            .to_vec1::<f32>()?
            .iter()
            .map(|value| format!("{value:.1}"))
            .collect())
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("linear.weight".to_string(), self.weight.clone()),
            ("linear.bias".to_string(), self.bias.clone()),
        ]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Rows of text, one example per row.
#[derive(Debug, Clone)]
pub struct Rows(pub Vec<String>);

impl Rows {
    pub fn new(rows: &[&str]) -> Self {
        Rows(rows.iter().map(|row| row.to_string()).collect())
    }
}

impl DialogueBatch for Rows {
    fn rows(&self) -> usize {
        self.0.len()
    }

    fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        Ok(Rows(rows.iter().map(|row| self.0[*row].clone()).collect()))
    }

    fn splice_placeholder(&mut self, row: usize, span: &str) -> Result<()> {
        self.0[row] = self.0[row].replace(DB_PLACEHOLDER, span);
        Ok(())
    }
}

/// Model whose validation losses follow a fixed schedule and whose
/// generations echo their input rows.
pub struct ScriptedModel {
    weight: Var,
    valid_losses: Vec<f64>,
    valid_calls: Cell<usize>,
    training: bool,
}

impl ScriptedModel {
    pub fn new(valid_losses: &[f64]) -> Self {
        Self {
            weight: Var::new(&[1.0f32, -1.0], &Device::Cpu).expect("weight"),
            valid_losses: valid_losses.to_vec(),
            valid_calls: Cell::new(0),
            training: true,
        }
    }
}

impl Model for ScriptedModel {
    type Batch = Rows;

    fn name(&self) -> &str {
        "toy"
    }

    fn forward(&self, _batch: &Rows, _epoch_idx: usize) -> Result<Tensor> {
        if self.training {
            return Ok(self.weight.as_tensor().sqr()?.sum_all()?);
        }
        let call = self.valid_calls.get();
        self.valid_calls.set(call + 1);
        let loss = self.valid_losses[call.min(self.valid_losses.len() - 1)];
        Ok(Tensor::new(loss as f32, &Device::Cpu)?)
    }

    fn generate(&self, batch: &Rows) -> Result<Vec<String>> {
        Ok(batch.0.clone())
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![("scripted.weight".to_string(), self.weight.clone())]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Loader of single-row batches.
pub fn row_loader(rows: &[&str], references: &[&str]) -> InMemoryLoader<Rows> {
    InMemoryLoader::new(rows.iter().map(|row| Rows::new(&[row])).collect())
        .with_references(references.iter().map(|r| r.to_string()).collect())
}

/// Single writer that simulates `workers` peers for gathers and counts
/// collective calls.
pub struct RecordingCoordinator {
    workers: usize,
    writer: bool,
    pub barriers: Cell<usize>,
    pub gathers: Cell<usize>,
    pub prepared: bool,
}

impl RecordingCoordinator {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            writer: true,
            barriers: Cell::new(0),
            gathers: Cell::new(0),
            prepared: false,
        }
    }

    pub fn follower(workers: usize) -> Self {
        Self {
            writer: false,
            ..Self::new(workers)
        }
    }
}

impl Coordinator for RecordingCoordinator {
    fn is_local_main_process(&self) -> bool {
        self.writer
    }

    fn num_processes(&self) -> usize {
        self.workers
    }

    fn prepare(&mut self, _parameters: &[(String, Var)]) -> Result<()> {
        self.prepared = true;
        Ok(())
    }

    /// Peers report values spread symmetrically around the local one.
    fn gather(&self, value: f64) -> Result<Vec<f64>> {
        self.gathers.set(self.gathers.get() + 1);
        let center = (self.workers as f64 - 1.0) / 2.0;
        Ok((0..self.workers)
            .map(|rank| value + 0.25 * (rank as f64 - center))
            .collect())
    }

    fn wait_for_everyone(&self) -> Result<()> {
        self.barriers.set(self.barriers.get() + 1);
        Ok(())
    }
}

/// Scores exact matches and keeps every corpus it was handed.
#[derive(Clone, Default)]
pub struct RecordingEvaluator {
    pub corpora: Rc<RefCell<Vec<Vec<String>>>>,
}

impl Evaluator for RecordingEvaluator {
    fn evaluate(&self, generated: &[String], references: &[String]) -> Result<MetricMap> {
        self.corpora.borrow_mut().push(generated.to_vec());
        let matches = generated
            .iter()
            .zip(references)
            .filter(|(hypothesis, reference)| hypothesis == reference)
            .count();
        Ok(MetricMap::from([(
            "exact_match".to_string(),
            matches as f64 / references.len().max(1) as f64,
        )]))
    }
}
