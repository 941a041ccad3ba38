use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::error::Result;

/// Collective operations of a data-parallel run. Every worker calls these in
/// the same order; the single-process implementation is [`LocalCoordinator`].
pub trait Coordinator {
    fn is_local_main_process(&self) -> bool;

    fn num_processes(&self) -> usize {
        1
    }

    /// Called once before training with the model's parameters.
    fn prepare(&mut self, _parameters: &[(String, Var)]) -> Result<()> {
        Ok(())
    }

    fn backward(&self, loss: &Tensor) -> Result<GradStore> {
        Ok(loss.backward()?)
    }

    /// Rescales gradients in place so that their global norm is at most
    /// `max_norm`, returning the norm measured before clipping.
    fn clip_grad_norm(
        &self,
        grads: &mut GradStore,
        parameters: &[(String, Var)],
        max_norm: f64,
    ) -> Result<f64> {
        clip_global_norm(grads, parameters, max_norm)
    }

    /// All workers' values, in rank order.
    fn gather(&self, value: f64) -> Result<Vec<f64>>;

    fn wait_for_everyone(&self) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalCoordinator;

impl Coordinator for LocalCoordinator {
    fn is_local_main_process(&self) -> bool {
        true
    }

    fn gather(&self, value: f64) -> Result<Vec<f64>> {
        Ok(vec![value])
    }

    fn wait_for_everyone(&self) -> Result<()> {
        Ok(())
    }
}

/// Sums micro-batch gradients over one accumulation group.
#[derive(Default)]
pub struct GradientAccumulator {
    grads: Option<GradStore>,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one micro-batch into the group. Gradients of tensors that are
    /// not parameters are ignored after the first micro-batch.
    pub fn accumulate(&mut self, parameters: &[(String, Var)], mut incoming: GradStore) -> Result<()> {
        let Some(accum) = self.grads.as_mut() else {
            self.grads = Some(incoming);
            return Ok(());
        };
        for (_, var) in parameters {
            let tensor = var.as_tensor();
            if let Some(grad) = incoming.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad)?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_none()
    }

    /// Hands the group's gradients out and resets for the next group.
    pub fn take(&mut self) -> Option<GradStore> {
        self.grads.take()
    }
}

pub fn global_norm(grads: &GradStore, parameters: &[(String, Var)]) -> Result<f64> {
    let mut sum_squares = 0.0f64;
    for (_, var) in parameters {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_squares += grad
                .to_dtype(DType::F32)?
                .sqr()?
                .sum_all()?
                .to_vec0::<f32>()? as f64;
        }
    }
    Ok(sum_squares.sqrt())
}

pub fn clip_global_norm(
    grads: &mut GradStore,
    parameters: &[(String, Var)],
    max_norm: f64,
) -> Result<f64> {
    let total_norm = global_norm(grads, parameters)?;
    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for (_, var) in parameters {
            let tensor = var.as_tensor();
            if let Some(grad) = grads.remove(tensor) {
                grads.insert(tensor, (grad * clip_coef)?);
            }
        }
    }
    Ok(total_norm)
}
