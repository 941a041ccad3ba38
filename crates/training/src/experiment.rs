use crate::{
    config::ExperimentConfig,
    context::RunContext,
    coordinator::Coordinator,
    data::DataLoader,
    error::Result,
    evaluation::{Evaluator, GenerationStrategy, MetricMap},
    model::Model,
    tracker::EpochSummary,
    trainer::{EvalTarget, FitOutcome, ModelSource, Trainer},
    TrainingError,
};

/// Results of one experiment run.
#[derive(Debug, Clone, Default)]
pub struct ExperimentOutcome {
    pub fit: Option<FitOutcome>,
    pub valid_result: Option<EpochSummary>,
    pub test_result: Option<MetricMap>,
}

/// Drives train, validation and test phases as the `[experiment]` flags ask.
pub struct Experiment<M: Model, C: Coordinator> {
    config: ExperimentConfig,
    ctx: RunContext,
    trainer: Trainer<M, C>,
}

impl<M: Model, C: Coordinator> Experiment<M, C> {
    pub fn new(
        config: ExperimentConfig,
        ctx: RunContext,
        model: M,
        coordinator: C,
        evaluator: Box<dyn Evaluator>,
    ) -> Result<Self> {
        if let Err(err) = ctx.device().set_seed(config.experiment.seed) {
            ctx.logger()
                .debug(format!("device rng was not seeded: {err}"));
        }
        ctx.logger().info(format!(
            "experiment {} on {} (model {})",
            config.experiment.filename(),
            config.experiment.dataset,
            model.name()
        ));
        let trainer = Trainer::new(config.clone(), ctx.clone(), model, coordinator, evaluator)?;
        Ok(Self {
            config,
            ctx,
            trainer,
        })
    }

    pub fn with_generation_strategy(mut self, strategy: Box<dyn GenerationStrategy<M>>) -> Self {
        self.trainer = self.trainer.with_generation_strategy(strategy);
        self
    }

    pub fn trainer(&self) -> &Trainer<M, C> {
        &self.trainer
    }

    pub fn trainer_mut(&mut self) -> &mut Trainer<M, C> {
        &mut self.trainer
    }

    pub fn run(
        &mut self,
        train: Option<&dyn DataLoader<M::Batch>>,
        valid: Option<&dyn DataLoader<M::Batch>>,
        test: Option<&dyn DataLoader<M::Batch>>,
    ) -> Result<ExperimentOutcome> {
        let settings = &self.config.experiment;
        if settings.do_valid && !settings.do_train {
            return Err(TrainingError::configuration(
                "cannot execute validation without training",
            ));
        }

        let mut outcome = ExperimentOutcome::default();

        if settings.do_train {
            let train = train.ok_or_else(|| {
                TrainingError::configuration("do_train is set but no training loader was given")
            })?;
            if let Some(path) = settings.load_experiment.clone() {
                self.trainer.resume_checkpoint(path)?;
            }
            let valid = if settings.do_valid { valid } else { None };
            let fit = self.trainer.fit(train, valid)?;
            outcome.valid_result = fit.best.clone();
            if let Some(best) = &outcome.valid_result {
                self.ctx.logger().info(format!("valid result: {best}"));
            }
            outcome.fit = Some(fit);
        }

        if settings.do_test {
            let test = test.ok_or_else(|| {
                TrainingError::configuration("do_test is set but no test loader was given")
            })?;
            let source = match settings.load_experiment.clone() {
                Some(path) => ModelSource::File(path),
                None => ModelSource::BestCheckpoint,
            };
            outcome.test_result = self.trainer.evaluate(test, EvalTarget::Test(source))?;
            if let Some(metrics) = &outcome.test_result {
                for (name, value) in metrics {
                    self.ctx.logger().info(format!("{name}: {value}"));
                }
            }
        }

        self.ctx.logger().flush();
        Ok(outcome)
    }
}
