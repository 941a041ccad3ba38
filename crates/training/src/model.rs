use std::collections::BTreeMap;

use candle_core::{DType, Tensor, Var};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{error::Result, TrainingError};

/// The trainable model as seen by the trainer.
pub trait Model {
    type Batch;

    fn name(&self) -> &str;

    /// Scalar training loss for one micro-batch.
    fn forward(&self, batch: &Self::Batch, epoch_idx: usize) -> Result<Tensor>;

    /// One decoded string per example of the batch.
    fn generate(&self, batch: &Self::Batch) -> Result<Vec<String>>;

    fn parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn state_dict(&self) -> Result<StateDict> {
        StateDict::capture(&self.parameters())
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        state.apply(&self.parameters())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    #[serde(deserialize_with = "deserialize_values")]
    pub values: Vec<f32>,
}

impl TensorData {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            values: tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?,
        })
    }

    pub fn to_tensor(&self, like: &Tensor) -> Result<Tensor> {
        let tensor = Tensor::from_vec(self.values.clone(), self.shape.as_slice(), like.device())?;
        Ok(tensor.to_dtype(like.dtype())?)
    }
}

/// Named parameter values, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    tensors: BTreeMap<String, TensorData>,
}

impl StateDict {
    pub fn capture(parameters: &[(String, Var)]) -> Result<Self> {
        if parameters.is_empty() {
            return Err(TrainingError::runtime(
                "model contains no parameters to checkpoint",
            ));
        }
        let mut tensors = BTreeMap::new();
        for (name, var) in parameters {
            tensors.insert(name.clone(), TensorData::from_tensor(var.as_tensor())?);
        }
        Ok(Self { tensors })
    }

    /// Writes every stored tensor into the matching parameter. Missing,
    /// unused and reshaped parameters are all rejected before anything is set.
    pub fn apply(&self, parameters: &[(String, Var)]) -> Result<()> {
        let mut pending = Vec::with_capacity(parameters.len());
        for (name, var) in parameters {
            let data = self.tensors.get(name).ok_or_else(|| {
                TrainingError::state_mismatch(format!("checkpoint missing parameter {name}"))
            })?;
            if data.shape.as_slice() != var.as_tensor().dims() {
                return Err(TrainingError::state_mismatch(format!(
                    "parameter {name} has shape {:?} in checkpoint but {:?} in model",
                    data.shape,
                    var.as_tensor().dims()
                )));
            }
            pending.push((var, data));
        }

        if self.tensors.len() != parameters.len() {
            let extra = self
                .tensors
                .keys()
                .filter(|name| !parameters.iter().any(|(known, _)| known == *name))
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            return Err(TrainingError::state_mismatch(format!(
                "checkpoint contains unused parameters: {extra}"
            )));
        }

        for (var, data) in pending {
            var.set(&data.to_tensor(var.as_tensor())?)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }
}

/// serde_json writes non-finite floats as `null`; they read back as NaN so
/// that a diverged run still leaves a loadable checkpoint.
pub(crate) fn deserialize_values<'de, D>(deserializer: D) -> std::result::Result<Vec<f32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Option<f32>> = Vec::deserialize(deserializer)?;
    Ok(raw.into_iter().map(|value| value.unwrap_or(f32::NAN)).collect())
}
