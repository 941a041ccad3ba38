use std::{collections::BTreeMap, fmt, path::PathBuf};

use candle_core::{DType, Tensor, Var};

use crate::{
    checkpoint::{self, CheckpointRecord, CheckpointStore, CHECKPOINT_VERSION},
    config::{ExperimentConfig, ValidStrategy},
    context::RunContext,
    coordinator::{Coordinator, GradientAccumulator},
    data::DataLoader,
    error::Result,
    evaluation::{
        persist_generated_text, truncate_to_references, EvalSplit, Evaluator, GenerationStrategy,
        MetricMap, SinglePass,
    },
    model::Model,
    optimizer::{Optimizer, OptimizerBuilder},
    tracker::{EpochMode, EpochSummary, SummaryTracker, Timestamp, TrackerState},
    validation::ValidationController,
    TrainingError,
};

/// Why `fit` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The non-best streak exceeded `stopping_steps`.
    EarlyStopping { non_best: usize },
    MaxSteps { max_steps: usize },
    /// The caller's shutdown signal fired at a group boundary.
    Interrupted,
    /// Every configured epoch ran.
    Exhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EarlyStopping { non_best } => {
                write!(f, "early stopped at {non_best} non-best validation")
            }
            StopReason::MaxSteps { max_steps } => write!(f, "stopped at max_steps {max_steps}"),
            StopReason::Interrupted => f.write_str("interrupted"),
            StopReason::Exhausted => f.write_str("all epochs finished"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub best: Option<EpochSummary>,
    pub reason: StopReason,
    pub epochs_run: usize,
    pub train_losses: Vec<f64>,
}

/// Which weights a test run evaluates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    BestCheckpoint,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalTarget {
    /// Called from validation: the weights in memory are scored as is.
    Validation,
    Test(ModelSource),
}

pub struct Trainer<M: Model, C: Coordinator> {
    config: ExperimentConfig,
    ctx: RunContext,
    model: M,
    coordinator: C,
    evaluator: Box<dyn Evaluator>,
    generation: Box<dyn GenerationStrategy<M>>,
    parameters: Vec<(String, Var)>,
    optimizer: Box<dyn Optimizer>,
    grad_clip: Option<f64>,
    tracker: SummaryTracker,
    controller: ValidationController,
    checkpoints: CheckpointStore,
    fingerprint: String,
    start_epoch: usize,
    valid_results: BTreeMap<usize, EpochSummary>,
}

impl<M: Model, C: Coordinator> Trainer<M, C> {
    pub fn new(
        config: ExperimentConfig,
        ctx: RunContext,
        model: M,
        mut coordinator: C,
        evaluator: Box<dyn Evaluator>,
    ) -> Result<Self> {
        config.validate()?;

        let parameters = model.parameters();
        if parameters.is_empty() {
            return Err(TrainingError::initialization(format!(
                "model {} exposes no trainable parameters",
                model.name()
            )));
        }
        coordinator.prepare(&parameters)?;

        let (optimizer, grad_clip) =
            OptimizerBuilder::new(&config.optimizer).build(parameters.clone(), &ctx)?;
        let tracker = SummaryTracker::new(
            config.evaluation.metrics_for_best_model.clone(),
            ctx.clone(),
        );
        let controller = ValidationController::from_config(&config.training);
        let checkpoints = CheckpointStore::from_config(&config, ctx.clone());
        let fingerprint = config.fingerprint()?;

        Ok(Self {
            config,
            ctx,
            model,
            coordinator,
            evaluator,
            generation: Box::new(SinglePass),
            parameters,
            optimizer,
            grad_clip,
            tracker,
            controller,
            checkpoints,
            fingerprint,
            start_epoch: 0,
            valid_results: BTreeMap::new(),
        })
    }

    pub fn with_generation_strategy(mut self, strategy: Box<dyn GenerationStrategy<M>>) -> Self {
        self.generation = strategy;
        self
    }

    pub fn fit(
        &mut self,
        train: &dyn DataLoader<M::Batch>,
        valid: Option<&dyn DataLoader<M::Batch>>,
    ) -> Result<FitOutcome> {
        self.fit_with_shutdown(train, valid, || false)
    }

    /// Trains until the epochs run out, `max_steps` is reached, early
    /// stopping fires or `should_stop` returns true. The signal is only polled
    /// once an accumulation group has been applied.
    pub fn fit_with_shutdown<F>(
        &mut self,
        train: &dyn DataLoader<M::Batch>,
        valid: Option<&dyn DataLoader<M::Batch>>,
        mut should_stop: F,
    ) -> Result<FitOutcome>
    where
        F: FnMut() -> bool,
    {
        if train.is_empty() {
            return Err(TrainingError::configuration(
                "training loader yields no batches",
            ));
        }

        self.ctx.logger().info("start training");
        self.coordinator.wait_for_everyone()?;

        let epoch_limit = self.config.training.epoch_limit();
        let mut reason = StopReason::Exhausted;
        let mut epochs_run = 0usize;
        let mut train_losses = Vec::new();
        let mut epoch_idx = self.start_epoch;

        loop {
            if epoch_limit.is_some_and(|limit| epoch_idx >= limit) {
                break;
            }
            if let Some(max_steps) = self.max_steps_reached() {
                reason = StopReason::MaxSteps { max_steps };
                break;
            }

            self.model.set_training(true);
            self.tracker.new_epoch(EpochMode::Train);
            let outcome = self.train_epoch(train, valid, epoch_idx, &mut should_stop);
            let summary = self.tracker.end_epoch();
            let stop = outcome?;
            let summary = summary?;

            self.ctx.logger().info(&summary);
            self.ctx.logger().record_epoch(&summary);
            if let Some(loss) = summary.loss {
                train_losses.push(loss);
            }
            epochs_run += 1;

            let stop = match stop {
                Some(StopReason::Interrupted) => stop,
                earlier => self.valid(valid, ValidStrategy::Epoch)?.or(earlier),
            };
            if let Some(stop) = stop {
                reason = stop;
                break;
            }
            epoch_idx += 1;
        }

        self.ctx.logger().info(format!("training finished: {reason}"));
        if self.is_writer() {
            if let Ok(checkpoint::BestResolution::Present { serial, path }) =
                self.checkpoints.resolve_best()
            {
                self.ctx.logger().info(format!(
                    "best checkpoint {} -> serial {serial}",
                    path.display()
                ));
            }
        }
        let best = self.best_valid_result().cloned();
        match &best {
            Some(best) => self.ctx.logger().info(format!(
                "best validation result at train epoch {}: {best}",
                best.timestamp.train_epoch
            )),
            None => self.ctx.logger().info("no validation result recorded"),
        }
        self.ctx.logger().flush();

        Ok(FitOutcome {
            best,
            reason,
            epochs_run,
            train_losses,
        })
    }

    fn train_epoch<F>(
        &mut self,
        train: &dyn DataLoader<M::Batch>,
        valid: Option<&dyn DataLoader<M::Batch>>,
        epoch_idx: usize,
        should_stop: &mut F,
    ) -> Result<Option<StopReason>>
    where
        F: FnMut() -> bool,
    {
        let accumulation_steps = self.config.training.accumulation_steps.max(1);
        let scale = 1.0 / accumulation_steps as f64;
        let groups = train.len().div_ceil(accumulation_steps);
        let bar = self
            .ctx
            .logger()
            .progress(groups, format!("train {epoch_idx:4}"));
        let mut accumulator = GradientAccumulator::new();

        let mut stop = None;
        for (index, batch) in train.batches().enumerate() {
            let batch = batch?;
            if index % accumulation_steps == 0 {
                if let Some(max_steps) = self.max_steps_reached() {
                    stop = Some(StopReason::MaxSteps { max_steps });
                    break;
                }
                self.tracker.new_step()?;
            }

            let loss = self.model.forward(&batch, epoch_idx)?;
            self.tracker.append_loss(scalar(&loss)?)?;
            let grads = self.coordinator.backward(&loss.affine(scale, 0.0)?)?;
            accumulator.accumulate(&self.parameters, grads)?;

            if (index + 1) % accumulation_steps == 0 {
                bar.inc(1);
                stop = self.finish_group(&mut accumulator, valid, should_stop)?;
                if stop.is_some() {
                    break;
                }
            }
        }
        if stop.is_none() && !accumulator.is_empty() {
            bar.inc(1);
            stop = self.finish_group(&mut accumulator, valid, should_stop)?;
        }
        bar.finish_and_clear();
        Ok(stop)
    }

    /// Applies one accumulated group: clip, step, then the step-cadence
    /// validation.
    fn finish_group<F>(
        &mut self,
        accumulator: &mut GradientAccumulator,
        valid: Option<&dyn DataLoader<M::Batch>>,
        should_stop: &mut F,
    ) -> Result<Option<StopReason>>
    where
        F: FnMut() -> bool,
    {
        if let Some(mut grads) = accumulator.take() {
            if let Some(max_norm) = self.grad_clip {
                let norm = self
                    .coordinator
                    .clip_grad_norm(&mut grads, &self.parameters, max_norm)?;
                self.ctx
                    .logger()
                    .debug(format!("gradient norm {norm:.4} (clip {max_norm})"));
            }
            self.optimizer.step(&grads)?;
        }

        if let Some(stop) = self.valid(valid, ValidStrategy::Step)? {
            return Ok(Some(stop));
        }
        Ok(should_stop().then_some(StopReason::Interrupted))
    }

    fn max_steps_reached(&self) -> Option<usize> {
        self.config
            .training
            .max_steps
            .filter(|max_steps| self.tracker.axes().train_step >= *max_steps)
    }

    /// One cadence tick of validation. Runs a validation epoch when due,
    /// saves a checkpoint from the writer and synchronizes all workers.
    fn valid(
        &mut self,
        valid: Option<&dyn DataLoader<M::Batch>>,
        mode: ValidStrategy,
    ) -> Result<Option<StopReason>> {
        let Some(valid) = valid else {
            return Ok(None);
        };
        if !self.controller.should_validate(mode) {
            return Ok(None);
        }

        self.tracker.new_epoch(EpochMode::Valid);
        let outcome = self.run_validation(valid);
        let summary = self.tracker.end_epoch();
        outcome?;
        let summary = summary?;

        self.ctx.logger().info(&summary);
        self.ctx.logger().record_epoch(&summary);
        self.valid_results
            .insert(summary.timestamp.valid_epoch, summary.clone());
        let stopping = self.controller.record(summary.is_best);

        if self.is_writer() {
            self.save_checkpoint(&summary)?;
        }
        self.coordinator.wait_for_everyone()?;

        Ok(stopping.stopped.then_some(StopReason::EarlyStopping {
            non_best: stopping.stopping_count,
        }))
    }

    fn run_validation(&mut self, valid: &dyn DataLoader<M::Batch>) -> Result<()> {
        let metrics = if self.config.selects_by_loss() {
            let was_training = self.model.is_training();
            self.model.set_training(false);
            let loss = self.validation_loss(valid);
            self.model.set_training(was_training);
            BTreeMap::from([("loss".to_string(), loss?)])
        } else {
            self.evaluate_loaded(valid, EvalSplit::Valid)?
        };
        self.tracker.set_metrics_results(metrics)
    }

    /// Mean validation loss, each batch averaged over all workers in rank
    /// order so that every worker computes the same value.
    fn validation_loss(&mut self, valid: &dyn DataLoader<M::Batch>) -> Result<f64> {
        if valid.is_empty() {
            return Err(TrainingError::runtime("validation loader yields no batches"));
        }
        let epoch_idx = self.tracker.axes().train_epoch;
        let bar = self.ctx.logger().progress(
            valid.len(),
            format!("valid {:4}", self.tracker.axes().valid_epoch),
        );

        let mut total = 0.0;
        let mut batches = 0usize;
        for batch in valid.batches() {
            let batch = batch?;
            self.tracker.new_step()?;
            let loss = scalar(&self.model.forward(&batch, epoch_idx)?)?;
            let gathered = self.coordinator.gather(loss)?;
            if gathered.is_empty() {
                return Err(TrainingError::runtime("loss gather returned no values"));
            }
            let mean = gathered.iter().sum::<f64>() / gathered.len() as f64;
            self.tracker.append_loss(mean)?;
            total += mean;
            batches += 1;
            bar.inc(1);
        }
        bar.finish_and_clear();

        if batches == 0 {
            return Err(TrainingError::runtime("validation loader yields no batches"));
        }
        Ok(total / batches as f64)
    }

    /// Generates over `loader` and scores the corpus.
    ///
    /// A test run first loads weights from `source`; when that file does not
    /// exist the failure is logged and `None` is returned.
    pub fn evaluate(
        &mut self,
        loader: &dyn DataLoader<M::Batch>,
        target: EvalTarget,
    ) -> Result<Option<MetricMap>> {
        let source = match target {
            EvalTarget::Validation => return self.evaluate_loaded(loader, EvalSplit::Valid).map(Some),
            EvalTarget::Test(source) => source,
        };

        let path = match source {
            ModelSource::BestCheckpoint => self.checkpoints.best_path(),
            ModelSource::File(path) => path,
        };
        let Some(record) = checkpoint::load_from(&path, &self.ctx)? else {
            self.ctx.logger().error(format!(
                "failed to evaluate model: {} not found (set experiment.load_experiment to choose a file)",
                path.display()
            ));
            return Ok(None);
        };
        self.ctx.logger().info(format!(
            "loading model parameters from {}",
            path.display()
        ));
        self.model.load_state_dict(&record.model_state)?;
        self.coordinator.wait_for_everyone()?;

        self.evaluate_loaded(loader, EvalSplit::Test).map(Some)
    }

    fn evaluate_loaded(
        &mut self,
        loader: &dyn DataLoader<M::Batch>,
        split: EvalSplit,
    ) -> Result<MetricMap> {
        let configured = self.config.evaluation.generation;
        if self.generation.mode() != configured {
            return Err(TrainingError::configuration(format!(
                "evaluation.generation is {configured:?} but the installed strategy is {:?}",
                self.generation.mode()
            )));
        }

        let was_training = self.model.is_training();
        self.model.set_training(false);
        let corpus = self.generate_corpus(loader, split);
        self.model.set_training(was_training);
        let mut corpus = corpus?;

        let references = loader.references();
        if references.is_empty() {
            self.ctx
                .logger()
                .warn(format!("{} split carries no references", split.as_str()));
        }
        truncate_to_references(&mut corpus, references.len());
        let post_processing = self.config.evaluation.post_processing;
        let corpus: Vec<String> = corpus
            .iter()
            .map(|generated| post_processing.apply(generated))
            .collect();

        match split {
            EvalSplit::Test if self.is_writer() => {
                let path = self
                    .checkpoints
                    .directory()
                    .join(format!("{}.txt", self.config.experiment.filename()));
                persist_generated_text(&path, &corpus)?;
                self.ctx
                    .logger()
                    .info(format!("generated text saved to {}", path.display()));
            }
            EvalSplit::Test => {}
            EvalSplit::Valid => self.ctx.logger().debug(format!(
                "valid-{} generated {} lines",
                self.controller.trigger_count(),
                corpus.len()
            )),
        }

        self.evaluator.evaluate(&corpus, references)
    }

    fn generate_corpus(
        &mut self,
        loader: &dyn DataLoader<M::Batch>,
        split: EvalSplit,
    ) -> Result<Vec<String>> {
        self.generation.begin(split)?;
        let bar = self.ctx.logger().progress(loader.len(), "generating");
        let mut corpus = Vec::new();
        for batch in loader.batches() {
            let batch = batch?;
            corpus.extend(self.generation.generate_batch(&self.model, &batch)?);
            bar.inc(1);
        }
        bar.finish_and_clear();
        Ok(corpus)
    }

    fn save_checkpoint(&self, summary: &EpochSummary) -> Result<()> {
        let axes = self.tracker.axes();
        let record = CheckpointRecord {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: checkpoint::unix_timestamp(),
            config_sha256: self.fingerprint.clone(),
            model_state: self.model.state_dict()?,
            optimizer_state: self.optimizer.state()?,
            stopping_count: self.controller.stopping_count(),
            valid_trigger_count: self.controller.trigger_count(),
            best_valid_score: self.tracker.best_valid_score(),
            best_valid_timestamp: self.tracker.best_valid_timestamp(),
            epoch: axes.train_epoch,
            timestamp: axes,
            config: self.config.clone(),
            summary: summary.clone(),
            valid_results: self.valid_results.clone(),
        };
        let best_serial = self
            .tracker
            .best_valid_score()
            .map(|_| self.tracker.best_valid_timestamp().valid_epoch);
        self.checkpoints.save(&record, axes.valid_epoch, best_serial)?;
        Ok(())
    }

    /// Restores model, optimizer and bookkeeping from a checkpoint so that
    /// `fit` continues with the next epoch. A missing file is logged and
    /// reported as `false`.
    pub fn resume_checkpoint(&mut self, path: impl Into<PathBuf>) -> Result<bool> {
        let path = path.into();
        self.ctx
            .logger()
            .info(format!("resuming checkpoint from {}", path.display()));
        let Some(record) = checkpoint::load_from(&path, &self.ctx)? else {
            self.ctx.logger().warn(format!(
                "checkpoint file {} not found, resuming stopped",
                path.display()
            ));
            return Ok(false);
        };

        if let Err(err) = self.ctx.device().set_seed(record.config.experiment.seed) {
            self.ctx
                .logger()
                .debug(format!("device rng was not reseeded: {err}"));
        }
        if record.config_sha256 != self.fingerprint {
            self.ctx
                .logger()
                .debug("configuration changed since the checkpoint was written");
        }

        if record.config.experiment.model_name != self.config.experiment.model_name {
            self.ctx.logger().warn(
                "architecture configuration differs from the checkpoint, loading its state may fail",
            );
        }
        self.model.load_state_dict(&record.model_state)?;

        if !record
            .config
            .optimizer
            .name
            .eq_ignore_ascii_case(&self.config.optimizer.name)
        {
            self.ctx.logger().warn(
                "optimizer configuration differs from the checkpoint, loading its state may fail",
            );
        }
        self.optimizer.load_state(record.optimizer_state)?;

        self.start_epoch = record.epoch + 1;
        self.tracker.restore(TrackerState {
            axes: record.timestamp,
            best_valid_score: record.best_valid_score,
            best_valid_timestamp: record.best_valid_timestamp,
        });
        self.controller
            .restore(record.valid_trigger_count, record.stopping_count);
        self.valid_results = record.valid_results;

        self.ctx.logger().info(format!(
            "checkpoint loaded, resume training from epoch {}",
            self.start_epoch
        ));
        Ok(true)
    }

    fn is_writer(&self) -> bool {
        self.ctx.is_writer() && self.coordinator.is_local_main_process()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.tracker.axes()
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn stopping_count(&self) -> usize {
        self.controller.stopping_count()
    }

    pub fn best_valid_score(&self) -> Option<f64> {
        self.tracker.best_valid_score()
    }

    pub fn valid_results(&self) -> &BTreeMap<usize, EpochSummary> {
        &self.valid_results
    }

    pub fn best_valid_result(&self) -> Option<&EpochSummary> {
        self.tracker.best_valid_score()?;
        self.valid_results
            .get(&self.tracker.best_valid_timestamp().valid_epoch)
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }
}

fn scalar(loss: &Tensor) -> Result<f64> {
    Ok(loss.to_dtype(DType::F64)?.sum_all()?.to_vec0::<f64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reasons_read_as_log_lines() {
        assert_eq!(
            StopReason::EarlyStopping { non_best: 3 }.to_string(),
            "early stopped at 3 non-best validation"
        );
        assert_eq!(
            StopReason::MaxSteps { max_steps: 10 }.to_string(),
            "stopped at max_steps 10"
        );
    }
}
