pub mod checkpoint;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod experiment;
pub mod logging;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod tracker;
pub mod trainer;
pub mod validation;

pub use checkpoint::{BestResolution, CheckpointRecord, CheckpointStore};
pub use config::{ConfigOverride, ExperimentConfig};
pub use context::RunContext;
pub use coordinator::{Coordinator, LocalCoordinator};
pub use data::{DataLoader, InMemoryLoader};
pub use error::{Result, TrainingError};
pub use evaluation::{Evaluator, ExactMatchEvaluator, GenerationStrategy, MetricMap};
pub use experiment::{Experiment, ExperimentOutcome};
pub use logging::{Logger, LoggingSettings};
pub use model::{Model, StateDict};
pub use optimizer::{Optimizer, OptimizerBuilder, OptimizerKind, OptimizerState};
pub use scheduler::{LRScheduler, SchedulerKind};
pub use tracker::{EpochSummary, SummaryTracker, Timestamp};
pub use trainer::{EvalTarget, FitOutcome, ModelSource, StopReason, Trainer};
