use std::collections::{BTreeMap, HashMap};

mod rules;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    config::{OptimizerConfig, OptimizerKwargs},
    context::RunContext,
    error::Result,
    model::deserialize_values,
    scheduler::{SchedulerKind, ScheduledOptimizer, WarmupSchedule},
    TrainingError,
};

use rules::{Buffers, UpdateContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    #[serde(rename = "adamw")]
    AdamW,
    Sgd,
    Adagrad,
    #[serde(rename = "rmsprop")]
    RmsProp,
    Adafactor,
}

impl OptimizerKind {
    pub const DEFAULT: OptimizerKind = OptimizerKind::AdamW;

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "adam" => Some(Self::Adam),
            "adamw" => Some(Self::AdamW),
            "sgd" => Some(Self::Sgd),
            "adagrad" => Some(Self::Adagrad),
            "rmsprop" => Some(Self::RmsProp),
            "adafactor" => Some(Self::Adafactor),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Adam => "adam",
            Self::AdamW => "adamw",
            Self::Sgd => "sgd",
            Self::Adagrad => "adagrad",
            Self::RmsProp => "rmsprop",
            Self::Adafactor => "adafactor",
        }
    }

    /// Adafactor already bounds its updates by their RMS and is run without
    /// global-norm clipping.
    pub fn supports_grad_clip(self) -> bool {
        !matches!(self, Self::Adafactor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub weight_decay: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub momentum: f64,
    pub alpha: f64,
}

impl Hyperparameters {
    pub fn defaults(kind: OptimizerKind) -> Self {
        let base = Self {
            weight_decay: 0.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            momentum: 0.0,
            alpha: 0.99,
        };
        match kind {
            OptimizerKind::AdamW => Self {
                weight_decay: 0.01,
                ..base
            },
            OptimizerKind::Adagrad => Self { eps: 1e-10, ..base },
            OptimizerKind::Adafactor => Self {
                beta1: 0.0,
                eps: 1e-30,
                ..base
            },
            _ => base,
        }
    }

    pub fn resolve(kind: OptimizerKind, kwargs: &OptimizerKwargs) -> Self {
        let defaults = Self::defaults(kind);
        Self {
            weight_decay: kwargs.weight_decay.unwrap_or(defaults.weight_decay),
            beta1: kwargs.beta1.unwrap_or(defaults.beta1),
            beta2: kwargs.beta2.unwrap_or(defaults.beta2),
            eps: kwargs.eps.unwrap_or(defaults.eps),
            momentum: kwargs.momentum.unwrap_or(defaults.momentum),
            alpha: kwargs.alpha.unwrap_or(defaults.alpha),
        }
    }
}

pub trait Optimizer: Send {
    fn kind(&self) -> OptimizerKind;

    /// Applies one update from the accumulated gradients. Parameters
    /// without a gradient are left untouched.
    fn step(&mut self, grads: &GradStore) -> Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn steps(&self) -> usize;

    fn state(&self) -> Result<OptimizerState>;

    fn load_state(&mut self, state: OptimizerState) -> Result<()>;
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    kind: OptimizerKind,
    hyperparameters: Hyperparameters,
    learning_rate: f64,
    step: usize,
    slots: Vec<ParameterSlot>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    buffers: Buffers,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        kind: OptimizerKind,
        hyperparameters: Hyperparameters,
        learning_rate: f64,
    ) -> Result<Self> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut slots = Vec::with_capacity(named_parameters.len());
        for (name, param) in named_parameters {
            let tensor = param.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let buffers =
                rules::init_buffers(kind, &hyperparameters, tensor.dims(), tensor.device())?;
            slots.push(ParameterSlot {
                name,
                param,
                buffers,
            });
        }

        Ok(Self {
            kind,
            hyperparameters,
            learning_rate,
            step: 0,
            slots,
        })
    }

    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyperparameters
    }
}

impl Optimizer for TrainerOptimizer {
    fn kind(&self) -> OptimizerKind {
        self.kind
    }

    /// Every slot's next value and buffers are computed before any of them
    /// is written, so a failing update leaves the optimizer as it was.
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let has_grads = self
            .slots
            .iter()
            .any(|slot| grads.get(slot.param.as_tensor()).is_some());
        if !has_grads {
            return Ok(());
        }

        let ctx = UpdateContext {
            learning_rate: self.learning_rate,
            step: self.step + 1,
        };
        let mut updates = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.iter().enumerate() {
            let tensor = slot.param.as_tensor();
            let Some(grad) = grads.get(tensor) else {
                continue;
            };
            let dtype = tensor.dtype();
            let current = tensor.to_dtype(DType::F32)?;
            let grad = grad.to_dtype(DType::F32)?;
            let mut buffers = slot.buffers.clone();
            let next = rules::apply(
                self.kind,
                &self.hyperparameters,
                &ctx,
                &current,
                &grad,
                &mut buffers,
            )?;
            let next = if dtype == DType::F32 {
                next
            } else {
                next.to_dtype(dtype)?
            };
            if next.dims() != tensor.dims() {
                return Err(TrainingError::runtime(format!(
                    "update for '{}' has shape {:?}, expected {:?}",
                    slot.name,
                    next.dims(),
                    tensor.dims()
                )));
            }
            updates.push((index, next, buffers));
        }

        for (index, next, buffers) in updates {
            let slot = &mut self.slots[index];
            slot.param.set(&next)?;
            slot.buffers = buffers;
        }
        self.step = ctx.step;
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn steps(&self) -> usize {
        self.step
    }

    fn state(&self) -> Result<OptimizerState> {
        let mut slots = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let mut buffers = BTreeMap::new();
            for (name, tensor) in &slot.buffers {
                buffers.insert(name.clone(), flatten_to_vec(tensor)?);
            }
            slots.push(SlotState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                buffers,
            });
        }

        Ok(OptimizerState {
            kind: self.kind,
            step: self.step,
            learning_rate: self.learning_rate,
            scheduler_step: None,
            slots,
        })
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<()> {
        if state.kind != self.kind {
            return Err(TrainingError::state_mismatch(format!(
                "optimizer state was saved by {} but the optimizer is {}",
                state.kind.name(),
                self.kind.name()
            )));
        }

        let mut by_name: HashMap<_, _> = state
            .slots
            .into_iter()
            .map(|slot| (slot.name.clone(), slot))
            .collect();

        let mut restored = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::state_mismatch(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;
            if slot.param.as_tensor().dims() != saved.shape.as_slice() {
                return Err(TrainingError::state_mismatch(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            if saved.buffers.len() != slot.buffers.len() {
                return Err(TrainingError::state_mismatch(format!(
                    "optimizer state for '{}' has buffers {:?}",
                    slot.name,
                    saved.buffers.keys().collect::<Vec<_>>()
                )));
            }

            let mut buffers = Buffers::new();
            for (name, template) in &slot.buffers {
                let values = saved.buffers.get(name).ok_or_else(|| {
                    TrainingError::state_mismatch(format!(
                        "optimizer state for '{}' lacks buffer '{}'",
                        slot.name, name
                    ))
                })?;
                if values.len() != template.elem_count() {
                    return Err(TrainingError::state_mismatch(format!(
                        "optimizer buffer '{}' of '{}' has {} values, expected {}",
                        name,
                        slot.name,
                        values.len(),
                        template.elem_count()
                    )));
                }
                let tensor = Tensor::from_vec(values.clone(), template.dims(), template.device())?;
                buffers.insert(name.clone(), tensor);
            }
            restored.push(buffers);
        }

        if !by_name.is_empty() {
            return Err(TrainingError::state_mismatch(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        for (slot, buffers) in self.slots.iter_mut().zip(restored) {
            slot.buffers = buffers;
        }
        self.step = state.step;
        self.learning_rate = state.learning_rate;
        Ok(())
    }
}

fn flatten_to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub kind: OptimizerKind,
    pub step: usize,
    pub learning_rate: f64,
    #[serde(default)]
    pub scheduler_step: Option<usize>,
    pub slots: Vec<SlotState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotState {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(deserialize_with = "deserialize_buffers")]
    pub buffers: BTreeMap<String, Vec<f32>>,
}

fn deserialize_buffers<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, Vec<f32>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Values(#[serde(deserialize_with = "deserialize_values")] Vec<f32>);

    let raw: BTreeMap<String, Values> = BTreeMap::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|(name, values)| (name, values.0)).collect())
}

/// What a config resolves to, before any parameter exists.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerPlan {
    pub requested: String,
    pub kind: OptimizerKind,
    pub fell_back: bool,
    pub hyperparameters: Hyperparameters,
    pub learning_rate: f64,
    pub scheduler: Option<SchedulerKind>,
    pub grad_clip: Option<f64>,
    /// Clipping was requested but the optimizer does not take it.
    pub clip_disabled: bool,
}

pub struct OptimizerBuilder<'a> {
    config: &'a OptimizerConfig,
}

impl<'a> OptimizerBuilder<'a> {
    pub fn new(config: &'a OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn plan(&self) -> OptimizerPlan {
        let requested = self.config.name.clone();
        let (kind, fell_back) = match OptimizerKind::from_name(&requested) {
            Some(kind) => (kind, false),
            None => (OptimizerKind::DEFAULT, true),
        };

        let kwargs = match kind {
            OptimizerKind::Adafactor => self.config.kwargs.merged_with(&self.config.adafactor_kwargs),
            _ => self.config.kwargs.clone(),
        };

        let clip_disabled = !kind.supports_grad_clip() && self.config.grad_clip.is_some();
        let grad_clip = if kind.supports_grad_clip() {
            self.config.grad_clip
        } else {
            None
        };

        OptimizerPlan {
            requested,
            kind,
            fell_back,
            hyperparameters: Hyperparameters::resolve(kind, &kwargs),
            learning_rate: self.config.learning_rate,
            scheduler: self
                .config
                .scheduler
                .as_deref()
                .and_then(SchedulerKind::from_name),
            grad_clip,
            clip_disabled,
        }
    }

    /// Instantiates the optimizer over `parameters`, wrapped in its
    /// scheduler when one is configured. Returns the effective clip norm.
    pub fn build(
        &self,
        parameters: Vec<(String, Var)>,
        ctx: &RunContext,
    ) -> Result<(Box<dyn Optimizer>, Option<f64>)> {
        let plan = self.plan();
        let logger = ctx.logger();

        if plan.fell_back {
            logger.warn(format!(
                "optimizer '{}' is not supported, falling back to {}",
                plan.requested,
                plan.kind.name()
            ));
        }
        if plan.clip_disabled {
            logger.warn(format!(
                "gradient clipping is disabled because {} is incompatible with it",
                plan.kind.name()
            ));
        }

        let base = TrainerOptimizer::new(
            parameters,
            plan.kind,
            plan.hyperparameters,
            plan.learning_rate,
        )?;

        let optimizer: Box<dyn Optimizer> = match plan.scheduler {
            Some(kind) => {
                logger.debug(format!("using scheduler {}", kind.name()));
                let schedule =
                    WarmupSchedule::new(kind, &self.config.scheduler_kwargs, plan.learning_rate)?;
                Box::new(ScheduledOptimizer::new(Box::new(base), Box::new(schedule)))
            }
            None => Box::new(base),
        };

        Ok((optimizer, plan.grad_clip))
    }
}
