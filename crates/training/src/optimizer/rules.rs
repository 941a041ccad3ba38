//! Per-parameter update rules. Every rule works on `f32` copies of the
//! parameter and gradient and returns the next parameter value.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};

use super::{Hyperparameters, OptimizerKind};
use crate::error::Result;

const ADAFACTOR_DECAY_RATE: f64 = -0.8;
const ADAFACTOR_CLIP_THRESHOLD: f64 = 1.0;

pub(crate) type Buffers = BTreeMap<String, Tensor>;

/// Zeroed state buffers for a parameter of the given shape.
pub(crate) fn init_buffers(
    kind: OptimizerKind,
    hp: &Hyperparameters,
    shape: &[usize],
    device: &Device,
) -> Result<Buffers> {
    let zeros = |dims: &[usize]| Tensor::zeros(dims, DType::F32, device);
    let mut buffers = Buffers::new();
    match kind {
        OptimizerKind::Adam | OptimizerKind::AdamW => {
            buffers.insert("exp_avg".into(), zeros(shape)?);
            buffers.insert("exp_avg_sq".into(), zeros(shape)?);
        }
        OptimizerKind::Sgd => {
            if hp.momentum > 0.0 {
                buffers.insert("momentum_buffer".into(), zeros(shape)?);
            }
        }
        OptimizerKind::Adagrad => {
            buffers.insert("sum".into(), zeros(shape)?);
        }
        OptimizerKind::RmsProp => {
            buffers.insert("square_avg".into(), zeros(shape)?);
            if hp.momentum > 0.0 {
                buffers.insert("momentum_buffer".into(), zeros(shape)?);
            }
        }
        OptimizerKind::Adafactor => {
            if let [rows, cols] = shape {
                buffers.insert("exp_avg_sq_row".into(), zeros(&[*rows])?);
                buffers.insert("exp_avg_sq_col".into(), zeros(&[*cols])?);
            } else {
                buffers.insert("exp_avg_sq".into(), zeros(shape)?);
            }
            if hp.beta1 > 0.0 {
                buffers.insert("exp_avg".into(), zeros(shape)?);
            }
        }
    }
    Ok(buffers)
}

pub(crate) struct UpdateContext {
    pub learning_rate: f64,
    /// One-based index of the step being taken.
    pub step: usize,
}

pub(crate) fn apply(
    kind: OptimizerKind,
    hp: &Hyperparameters,
    ctx: &UpdateContext,
    param: &Tensor,
    grad: &Tensor,
    buffers: &mut Buffers,
) -> Result<Tensor> {
    match kind {
        OptimizerKind::Adam => adam(hp, ctx, param, grad, buffers, false),
        OptimizerKind::AdamW => adam(hp, ctx, param, grad, buffers, true),
        OptimizerKind::Sgd => sgd(hp, ctx, param, grad, buffers),
        OptimizerKind::Adagrad => adagrad(hp, ctx, param, grad, buffers),
        OptimizerKind::RmsProp => rmsprop(hp, ctx, param, grad, buffers),
        OptimizerKind::Adafactor => adafactor(hp, ctx, param, grad, buffers),
    }
}

fn with_coupled_decay(hp: &Hyperparameters, param: &Tensor, grad: &Tensor) -> Result<Tensor> {
    if hp.weight_decay == 0.0 {
        return Ok(grad.clone());
    }
    Ok(grad.add(&param.affine(hp.weight_decay, 0.0)?)?)
}

fn read_buffer(buffers: &Buffers, name: &str) -> Result<Tensor> {
    buffers.get(name).cloned().ok_or_else(|| {
        crate::TrainingError::state_mismatch(format!("optimizer buffer '{name}' is missing"))
    })
}

fn adam(
    hp: &Hyperparameters,
    ctx: &UpdateContext,
    param: &Tensor,
    grad: &Tensor,
    buffers: &mut Buffers,
    decoupled: bool,
) -> Result<Tensor> {
    let grad = if decoupled {
        grad.clone()
    } else {
        with_coupled_decay(hp, param, grad)?
    };

    let exp_avg = read_buffer(buffers, "exp_avg")?
        .affine(hp.beta1, 0.0)?
        .add(&grad.affine(1.0 - hp.beta1, 0.0)?)?;
    let exp_avg_sq = read_buffer(buffers, "exp_avg_sq")?
        .affine(hp.beta2, 0.0)?
        .add(&grad.sqr()?.affine(1.0 - hp.beta2, 0.0)?)?;

    let bias_correction1 = 1.0 - hp.beta1.powi(ctx.step as i32);
    let bias_correction2 = 1.0 - hp.beta2.powi(ctx.step as i32);
    let m_hat = exp_avg.affine(1.0 / bias_correction1, 0.0)?;
    let denom = exp_avg_sq
        .affine(1.0 / bias_correction2, 0.0)?
        .sqrt()?
        .affine(1.0, hp.eps)?;
    let update = m_hat.div(&denom)?.affine(ctx.learning_rate, 0.0)?;

    let base = if decoupled && hp.weight_decay != 0.0 {
        param.affine(1.0 - ctx.learning_rate * hp.weight_decay, 0.0)?
    } else {
        param.clone()
    };

    buffers.insert("exp_avg".into(), exp_avg);
    buffers.insert("exp_avg_sq".into(), exp_avg_sq);
    Ok(base.sub(&update)?)
}

fn sgd(
    hp: &Hyperparameters,
    ctx: &UpdateContext,
    param: &Tensor,
    grad: &Tensor,
    buffers: &mut Buffers,
) -> Result<Tensor> {
    let mut direction = with_coupled_decay(hp, param, grad)?;
    if hp.momentum > 0.0 {
        let buffer = read_buffer(buffers, "momentum_buffer")?
            .affine(hp.momentum, 0.0)?
            .add(&direction)?;
        direction = buffer.clone();
        buffers.insert("momentum_buffer".into(), buffer);
    }
    Ok(param.sub(&direction.affine(ctx.learning_rate, 0.0)?)?)
}

fn adagrad(
    hp: &Hyperparameters,
    ctx: &UpdateContext,
    param: &Tensor,
    grad: &Tensor,
    buffers: &mut Buffers,
) -> Result<Tensor> {
    let grad = with_coupled_decay(hp, param, grad)?;
    let sum = read_buffer(buffers, "sum")?.add(&grad.sqr()?)?;
    let update = grad
        .div(&sum.sqrt()?.affine(1.0, hp.eps)?)?
        .affine(ctx.learning_rate, 0.0)?;
    buffers.insert("sum".into(), sum);
    Ok(param.sub(&update)?)
}

fn rmsprop(
    hp: &Hyperparameters,
    ctx: &UpdateContext,
    param: &Tensor,
    grad: &Tensor,
    buffers: &mut Buffers,
) -> Result<Tensor> {
    let grad = with_coupled_decay(hp, param, grad)?;
    let square_avg = read_buffer(buffers, "square_avg")?
        .affine(hp.alpha, 0.0)?
        .add(&grad.sqr()?.affine(1.0 - hp.alpha, 0.0)?)?;
    let mut direction = grad.div(&square_avg.sqrt()?.affine(1.0, hp.eps)?)?;
    if hp.momentum > 0.0 {
        let buffer = read_buffer(buffers, "momentum_buffer")?
            .affine(hp.momentum, 0.0)?
            .add(&direction)?;
        direction = buffer.clone();
        buffers.insert("momentum_buffer".into(), buffer);
    }
    buffers.insert("square_avg".into(), square_avg);
    Ok(param.sub(&direction.affine(ctx.learning_rate, 0.0)?)?)
}

/// Adafactor with an explicit learning rate: second moments of matrices are
/// kept as row and column means, updates are clipped by their RMS.
fn adafactor(
    hp: &Hyperparameters,
    ctx: &UpdateContext,
    param: &Tensor,
    grad: &Tensor,
    buffers: &mut Buffers,
) -> Result<Tensor> {
    let beta2t = 1.0 - (ctx.step as f64).powf(ADAFACTOR_DECAY_RATE);
    let squared = grad.sqr()?.affine(1.0, hp.eps)?;

    let mut update = if buffers.contains_key("exp_avg_sq_row") {
        let row = read_buffer(buffers, "exp_avg_sq_row")?
            .affine(beta2t, 0.0)?
            .add(&squared.mean(1)?.affine(1.0 - beta2t, 0.0)?)?;
        let col = read_buffer(buffers, "exp_avg_sq_col")?
            .affine(beta2t, 0.0)?
            .add(&squared.mean(0)?.affine(1.0 - beta2t, 0.0)?)?;
        let row_factor = row
            .broadcast_div(&row.mean_keepdim(0)?)?
            .sqrt()?
            .recip()?
            .unsqueeze(1)?;
        let col_factor = col.sqrt()?.recip()?.unsqueeze(0)?;
        let update = grad.broadcast_mul(&row_factor)?.broadcast_mul(&col_factor)?;
        buffers.insert("exp_avg_sq_row".into(), row);
        buffers.insert("exp_avg_sq_col".into(), col);
        update
    } else {
        let exp_avg_sq = read_buffer(buffers, "exp_avg_sq")?
            .affine(beta2t, 0.0)?
            .add(&squared.affine(1.0 - beta2t, 0.0)?)?;
        let update = grad.mul(&exp_avg_sq.sqrt()?.recip()?)?;
        buffers.insert("exp_avg_sq".into(), exp_avg_sq);
        update
    };

    let rms = update.sqr()?.mean_all()?.to_vec0::<f32>()? as f64;
    let scale = (rms.sqrt() / ADAFACTOR_CLIP_THRESHOLD).max(1.0);
    update = update.affine(ctx.learning_rate / scale, 0.0)?;

    if hp.beta1 > 0.0 {
        let exp_avg = read_buffer(buffers, "exp_avg")?
            .affine(hp.beta1, 0.0)?
            .add(&update.affine(1.0 - hp.beta1, 0.0)?)?;
        update = exp_avg.clone();
        buffers.insert("exp_avg".into(), exp_avg);
    }

    let base = if hp.weight_decay != 0.0 {
        param.affine(1.0 - hp.weight_decay * ctx.learning_rate, 0.0)?
    } else {
        param.clone()
    };
    Ok(base.sub(&update)?)
}
