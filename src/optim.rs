//! Adam with L2 weight decay and a step-decay learning rate schedule.
//!
//! Unlike `candle_nn::AdamW`, every moment buffer is addressable by the name
//! of its parameter so the optimizer state can be written to and restored
//! from a checkpoint.

use candle_core::{Tensor, Var, backprop::GradStore};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// Coefficient of the L2 penalty added to every gradient.
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-4,
        }
    }
}

/// Scalar optimizer state stored in checkpoint metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub step: u64,
    pub params: AdamParams,
}

struct Slot {
    name: String,
    param: Var,
    m: Var,
    v: Var,
}

pub struct Adam {
    slots: Vec<Slot>,
    params: AdamParams,
    step: u64,
}

impl Adam {
    /// Track every variable of `varmap`, in name order.
    pub fn new(varmap: &VarMap, params: AdamParams) -> Result<Self> {
        let vars = varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut named: Vec<(&String, &Var)> = vars.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));

        let mut slots = Vec::with_capacity(named.len());
        for (name, var) in named {
            let (shape, dtype, device) = (var.shape(), var.dtype(), var.device());
            slots.push(Slot {
                name: name.clone(),
                param: var.clone(),
                m: Var::zeros(shape, dtype, device)?,
                v: Var::zeros(shape, dtype, device)?,
            });
        }
        Ok(Self {
            slots,
            params,
            step: 0,
        })
    }

    /// Apply one update from an aggregated gradient store. Parameters
    /// without a gradient are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let AdamParams {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let t = self.step.min(i32::MAX as u64) as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        for slot in &self.slots {
            let Some(grad) = grads.get(&slot.param) else {
                continue;
            };
            let theta = slot.param.as_tensor();
            let grad = if weight_decay != 0.0 {
                grad.add(&theta.affine(weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };

            let m = slot
                .m
                .as_tensor()
                .affine(beta1, 0.0)?
                .add(&grad.affine(1.0 - beta1, 0.0)?)?;
            let v = slot
                .v
                .as_tensor()
                .affine(beta2, 0.0)?
                .add(&grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;

            let m_hat = m.affine(1.0 / bias1, 0.0)?;
            let v_hat = v.affine(1.0 / bias2, 0.0)?;
            let update = m_hat.div(&v_hat.sqrt()?.affine(1.0, eps)?)?.affine(lr, 0.0)?;

            slot.param.set(&theta.sub(&update)?)?;
            slot.m.set(&m)?;
            slot.v.set(&v)?;
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            step: self.step,
            params: self.params,
        }
    }

    pub fn set_state(&mut self, state: AdamState) {
        self.step = state.step;
        self.params = state.params;
    }

    /// `(parameter name, first moment, second moment)` for every slot.
    pub fn moments(&self) -> impl Iterator<Item = (&str, &Var, &Var)> {
        self.slots.iter().map(|s| (s.name.as_str(), &s.m, &s.v))
    }

    /// Detached copies of the moment buffers, named `adam.m.<param>` and
    /// `adam.v.<param>`.
    pub fn moment_tensors(&self) -> Result<Vec<(String, Tensor)>> {
        let mut out = Vec::with_capacity(self.slots.len() * 2);
        for slot in &self.slots {
            out.push((format!("adam.m.{}", slot.name), slot.m.as_tensor().copy()?));
            out.push((format!("adam.v.{}", slot.name), slot.v.as_tensor().copy()?));
        }
        Ok(out)
    }
}

/// Learning rate after `epoch` epochs when it is multiplied by `gamma`
/// every `step_epochs` epochs.
pub fn step_decay(base: f64, gamma: f64, step_epochs: usize, epoch: usize) -> f64 {
    if step_epochs == 0 {
        return base;
    }
    base * gamma.powi((epoch / step_epochs) as i32)
}
