use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::{error::Result, scheduler::SchedulerKind, TrainingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub experiment: ExperimentSettings,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExperimentConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::from_path_unvalidated(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and resolves relative paths without validating, so that
    /// callers can apply overrides first.
    pub fn from_path_unvalidated(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: ExperimentConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.experiment.model_name.trim().is_empty() {
            errors.push("experiment.model_name must not be empty".to_string());
        }

        if self.experiment.dataset.trim().is_empty() {
            errors.push("experiment.dataset must not be empty".to_string());
        }

        if let Some(filename) = &self.experiment.filename {
            if filename.trim().is_empty() || filename.contains(['/', '\\']) {
                errors.push("experiment.filename must be a non-empty file stem".to_string());
            }
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        for (section, kwargs) in [
            ("optimizer.kwargs", &self.optimizer.kwargs),
            ("optimizer.adafactor_kwargs", &self.optimizer.adafactor_kwargs),
        ] {
            kwargs.collect_errors(section, &mut errors);
        }

        if let Some(clip) = self.optimizer.grad_clip {
            if clip <= 0.0 {
                errors.push("optimizer.grad_clip must be greater than 0 when set".to_string());
            }
        }

        let scheduler = &self.optimizer.scheduler_kwargs;
        if let Some(max_lr) = scheduler.max_lr {
            if max_lr <= 0.0 {
                errors.push("optimizer.scheduler_kwargs.max_lr must be greater than 0".to_string());
            }
            if max_lr < scheduler.min_lr {
                errors.push(
                    "optimizer.scheduler_kwargs.max_lr must be >= optimizer.scheduler_kwargs.min_lr"
                        .to_string(),
                );
            }
        }

        if scheduler.min_lr < 0.0 {
            errors.push("optimizer.scheduler_kwargs.min_lr must be >= 0".to_string());
        }

        if let Some(total) = scheduler.total_steps {
            if total == 0 {
                errors.push(
                    "optimizer.scheduler_kwargs.total_steps must be greater than 0".to_string(),
                );
            }
            if scheduler.warmup_steps > total {
                errors.push(
                    "optimizer.scheduler_kwargs.warmup_steps cannot exceed total_steps".to_string(),
                );
            }
        }

        if let Some(kind) = self
            .optimizer
            .scheduler
            .as_deref()
            .and_then(SchedulerKind::from_name)
        {
            if kind.requires_total_steps() && scheduler.total_steps.is_none() {
                errors.push(format!(
                    "optimizer.scheduler_kwargs.total_steps is required by the '{}' scheduler",
                    kind.name()
                ));
            }
        }

        if self.training.accumulation_steps == 0 {
            errors.push("training.accumulation_steps must be greater than 0".to_string());
        }

        match self.training.max_steps {
            Some(0) => errors.push("training.max_steps must be greater than 0".to_string()),
            Some(_) => {}
            None if self.training.epochs == 0 => {
                errors.push("training.epochs must be greater than 0".to_string());
            }
            None => {}
        }

        if self.evaluation.metrics_for_best_model.is_empty() {
            errors.push("evaluation.metrics_for_best_model must not be empty".to_string());
        }

        for metric in &self.evaluation.metrics_for_best_model {
            if metric != "loss" && !self.evaluation.metrics.iter().any(|name| name == metric) {
                errors.push(format!(
                    "evaluation.metrics_for_best_model entry '{}' is not listed in evaluation.metrics",
                    metric
                ));
            }
        }

        if self.logging.tensorboard_flush_every_n == 0 {
            errors.push("logging.tensorboard_flush_every_n must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// SHA-256 over the canonical JSON rendering of the whole config.
    pub fn fingerprint(&self) -> Result<String> {
        let json = serde_json::to_vec(self)
            .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
        Ok(hex_encode(Sha256::digest(json)))
    }

    /// Directory holding every checkpoint of this experiment.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.experiment.saved_dir.join(self.experiment.filename())
    }

    pub fn selects_by_loss(&self) -> bool {
        self.evaluation
            .metrics_for_best_model
            .iter()
            .any(|metric| metric == "loss")
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.experiment.saved_dir, base);
        if let Some(path) = self.experiment.load_experiment.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.logging.tensorboard_dir.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSettings {
    pub model_name: String,
    pub dataset: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default = "default_saved_dir")]
    pub saved_dir: PathBuf,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub load_experiment: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub do_train: bool,
    #[serde(default = "default_true")]
    pub do_valid: bool,
    #[serde(default = "default_true")]
    pub do_test: bool,
}

impl ExperimentSettings {
    pub fn new(model_name: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            dataset: dataset.into(),
            filename: None,
            saved_dir: default_saved_dir(),
            seed: default_seed(),
            load_experiment: None,
            do_train: true,
            do_valid: true,
            do_test: true,
        }
    }

    pub fn filename(&self) -> String {
        match &self.filename {
            Some(name) => name.clone(),
            None => format!("{}-{}", self.model_name, self.dataset),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_optimizer_name")]
    pub name: String,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub kwargs: OptimizerKwargs,
    #[serde(default)]
    pub adafactor_kwargs: OptimizerKwargs,
    #[serde(default)]
    pub grad_clip: Option<f64>,
    #[serde(default)]
    pub scheduler: Option<String>,
    #[serde(default)]
    pub scheduler_kwargs: SchedulerKwargs,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: default_optimizer_name(),
            learning_rate: default_learning_rate(),
            kwargs: OptimizerKwargs::default(),
            adafactor_kwargs: OptimizerKwargs::default(),
            grad_clip: None,
            scheduler: None,
            scheduler_kwargs: SchedulerKwargs::default(),
        }
    }
}

/// Hyperparameters shared by the optimizer family. Unset entries fall back
/// to the per-optimizer defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerKwargs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight_decay: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta1: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beta2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub momentum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f64>,
}

impl OptimizerKwargs {
    /// Entries set on `overlay` win over the ones in `self`.
    pub fn merged_with(&self, overlay: &OptimizerKwargs) -> OptimizerKwargs {
        OptimizerKwargs {
            weight_decay: overlay.weight_decay.or(self.weight_decay),
            beta1: overlay.beta1.or(self.beta1),
            beta2: overlay.beta2.or(self.beta2),
            eps: overlay.eps.or(self.eps),
            momentum: overlay.momentum.or(self.momentum),
            alpha: overlay.alpha.or(self.alpha),
        }
    }

    fn collect_errors(&self, section: &str, errors: &mut Vec<String>) {
        if let Some(decay) = self.weight_decay {
            if decay < 0.0 {
                errors.push(format!("{section}.weight_decay must be >= 0"));
            }
        }
        for (name, value) in [("beta1", self.beta1), ("beta2", self.beta2), ("alpha", self.alpha)]
        {
            if let Some(value) = value {
                if !(0.0 < value && value < 1.0) {
                    errors.push(format!("{section}.{name} must be in (0, 1)"));
                }
            }
        }
        if let Some(eps) = self.eps {
            if eps <= 0.0 {
                errors.push(format!("{section}.eps must be greater than 0"));
            }
        }
        if let Some(momentum) = self.momentum {
            if !(0.0..1.0).contains(&momentum) {
                errors.push(format!("{section}.momentum must be in [0, 1)"));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerKwargs {
    #[serde(default)]
    pub max_lr: Option<f64>,
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default)]
    pub total_steps: Option<usize>,
    #[serde(default)]
    pub min_lr: f64,
}

impl Default for SchedulerKwargs {
    fn default() -> Self {
        Self {
            max_lr: None,
            warmup_steps: 0,
            total_steps: None,
            min_lr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub max_steps: Option<usize>,
    #[serde(default = "default_accumulation_steps")]
    pub accumulation_steps: usize,
    #[serde(default = "default_valid_steps")]
    pub valid_steps: usize,
    #[serde(default)]
    pub valid_strategy: ValidStrategy,
    #[serde(default)]
    pub stopping_steps: Option<usize>,
    #[serde(default = "default_max_save")]
    pub max_save: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            max_steps: None,
            accumulation_steps: default_accumulation_steps(),
            valid_steps: default_valid_steps(),
            valid_strategy: ValidStrategy::default(),
            stopping_steps: None,
            max_save: default_max_save(),
        }
    }
}

impl TrainingConfig {
    /// A step budget lifts the epoch bound entirely.
    pub fn epoch_limit(&self) -> Option<usize> {
        match self.max_steps {
            Some(_) => None,
            None => Some(self.epochs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidStrategy {
    Epoch,
    Step,
}

impl Default for ValidStrategy {
    fn default() -> Self {
        Self::Epoch
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub metrics: Vec<String>,
    #[serde(default = "default_metrics_for_best_model")]
    pub metrics_for_best_model: Vec<String>,
    #[serde(default)]
    pub post_processing: PostProcessing,
    #[serde(default)]
    pub generation: GenerationMode,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            metrics: Vec::new(),
            metrics_for_best_model: default_metrics_for_best_model(),
            post_processing: PostProcessing::default(),
            generation: GenerationMode::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostProcessing {
    None,
    Paraphrase,
}

impl Default for PostProcessing {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    SinglePass,
    StagedDialogue,
}

impl Default for GenerationMode {
    fn default() -> Self {
        Self::SinglePass
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub show_progress: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            show_progress: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_flush_every(),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_saved_dir() -> PathBuf {
    PathBuf::from("saved")
}

fn default_seed() -> u64 {
    2020
}

fn default_true() -> bool {
    true
}

fn default_optimizer_name() -> String {
    "adamw".to_string()
}

fn default_learning_rate() -> f64 {
    1e-4
}

fn default_epochs() -> usize {
    50
}

fn default_accumulation_steps() -> usize {
    1
}

fn default_valid_steps() -> usize {
    1
}

fn default_max_save() -> usize {
    2
}

fn default_metrics_for_best_model() -> Vec<String> {
    vec!["loss".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_flush_every() -> usize {
    10
}

/// A `key.path=value` assignment applied on top of a loaded config.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl ExperimentConfig {
    /// Applies dot-path overrides through a JSON round trip. The result is
    /// not validated.
    pub fn with_overrides(self, overrides: &[ConfigOverride]) -> Result<Self> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut value = serde_json::to_value(self)?;
        for entry in overrides {
            let segments: Vec<&str> = entry.path.split('.').collect();
            if segments.iter().any(|segment| segment.is_empty()) {
                return Err(TrainingError::ConfigFormat(format!(
                    "invalid override path '{}'",
                    entry.path
                )));
            }
            assign_at_path(&mut value, &segments, parse_override_value(&entry.value))?;
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn assign_at_path(target: &mut Value, segments: &[&str], new_value: Value) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        *target = new_value;
        return Ok(());
    };
    let mut current = target;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(TrainingError::ConfigFormat(format!(
                "override path segment '{segment}' points into a non-table value"
            )));
        };
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    let Value::Object(map) = current else {
        return Err(TrainingError::ConfigFormat(format!(
            "override key '{last}' points into a non-table value"
        )));
    };
    map.insert(last.to_string(), new_value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ExperimentConfig {
        toml::from_str(
            r#"
            [experiment]
            model_name = "bart"
            dataset = "samsum"
            "#,
        )
        .expect("minimal config parses")
    }

    #[test]
    fn defaults_follow_documented_values() {
        let config = minimal();
        assert_eq!(config.optimizer.name, "adamw");
        assert_eq!(config.training.max_save, 2);
        assert_eq!(config.training.accumulation_steps, 1);
        assert_eq!(config.training.valid_strategy, ValidStrategy::Epoch);
        assert_eq!(config.evaluation.metrics_for_best_model, vec!["loss"]);
        assert_eq!(config.experiment.filename(), "bart-samsum");
        assert_eq!(
            config.checkpoint_dir(),
            PathBuf::from("saved").join("bart-samsum")
        );
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn max_steps_lifts_epoch_limit() {
        let mut config = minimal();
        assert_eq!(config.training.epoch_limit(), Some(50));
        config.training.max_steps = Some(10);
        config.training.epochs = 0;
        assert_eq!(config.training.epoch_limit(), None);
        config.validate().expect("epochs are ignored under a step budget");
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = minimal();
        config.optimizer.learning_rate = 0.0;
        config.training.accumulation_steps = 0;
        config.optimizer.kwargs.beta1 = Some(1.5);
        config.evaluation.metrics_for_best_model = vec!["bleu-4".into()];

        let err = config.validate().expect_err("config is invalid");
        match err {
            TrainingError::Validation(messages) => {
                assert_eq!(messages.len(), 4, "{messages:?}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn cosine_scheduler_needs_total_steps() {
        let mut config = minimal();
        config.optimizer.scheduler = Some("cosine".into());
        assert!(config.validate().is_err());
        config.optimizer.scheduler_kwargs.total_steps = Some(100);
        config.validate().expect("total steps provided");

        config.optimizer.scheduler = Some("unheard-of".into());
        config.optimizer.scheduler_kwargs.total_steps = None;
        config.validate().expect("unknown schedulers are ignored");
    }

    #[test]
    fn adafactor_kwargs_overlay_base_kwargs() {
        let base = OptimizerKwargs {
            weight_decay: Some(0.01),
            eps: Some(1e-8),
            ..OptimizerKwargs::default()
        };
        let overlay = OptimizerKwargs {
            eps: Some(1e-30),
            ..OptimizerKwargs::default()
        };
        let merged = base.merged_with(&overlay);
        assert_eq!(merged.weight_decay, Some(0.01));
        assert_eq!(merged.eps, Some(1e-30));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let config = minimal();
        let mut changed = config.clone();
        changed.training.max_save = 5;
        assert_eq!(config.fingerprint().unwrap(), minimal().fingerprint().unwrap());
        assert_ne!(config.fingerprint().unwrap(), changed.fingerprint().unwrap());
    }

    #[test]
    fn relative_paths_resolve_against_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
            [experiment]
            model_name = "t5"
            dataset = "squad"
            saved_dir = "out"
            load_experiment = "out/t5-squad/t5-squad.pth"
            "#,
        )
        .unwrap();

        let config = ExperimentConfig::from_path(&path).unwrap();
        assert_eq!(config.experiment.saved_dir, dir.path().join("out"));
        assert_eq!(
            config.experiment.load_experiment.as_deref(),
            Some(dir.path().join("out/t5-squad/t5-squad.pth").as_path())
        );
    }

    #[test]
    fn overrides_assign_typed_values_by_dot_path() {
        let overrides: Vec<ConfigOverride> = [
            "training.max_save=5",
            "optimizer.grad_clip=0.5",
            "optimizer.scheduler=inverse",
            "experiment.do_test=false",
            "evaluation.metrics=[\"bleu-4\"]",
        ]
        .iter()
        .map(|raw| raw.parse().unwrap())
        .collect();

        let config = minimal().with_overrides(&overrides).unwrap();
        assert_eq!(config.training.max_save, 5);
        assert_eq!(config.optimizer.grad_clip, Some(0.5));
        assert_eq!(config.optimizer.scheduler.as_deref(), Some("inverse"));
        assert!(!config.experiment.do_test);
        assert_eq!(config.evaluation.metrics, vec!["bleu-4"]);
    }

    #[test]
    fn malformed_overrides_are_rejected() {
        assert!("training.max_save".parse::<ConfigOverride>().is_err());
        assert!("=3".parse::<ConfigOverride>().is_err());
        let bad = vec!["training..max_save=3".parse::<ConfigOverride>().unwrap()];
        assert!(minimal().with_overrides(&bad).is_err());
        let wrong_type = vec!["training.max_save=many".parse::<ConfigOverride>().unwrap()];
        assert!(minimal().with_overrides(&wrong_type).is_err());
    }
}
