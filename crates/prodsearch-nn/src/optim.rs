//! Adagrad optimizer for candle `Var`s.
//!
//! ```text
//! g     = grad + weight_decay * θ
//! sum  += g²
//! lr_t  = lr / (1 + (t - 1) * lr_decay)
//! θ    -= lr_t * g / (sqrt(sum) + eps)
//! ```
//!
//! Implements [`candle_nn::Optimizer`], so `backward_step(&loss)` runs
//! backprop and the update in one call.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use serde::{Deserialize, Serialize};

/// Adagrad hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdagradConfig {
    /// Base learning rate (default: 0.1).
    pub lr: f64,
    /// Learning-rate decay per step (default: 0).
    pub lr_decay: f64,
    /// L2 penalty added to the gradient (default: 0).
    pub weight_decay: f64,
    /// Initial accumulator value (default: 0).
    pub initial_accumulator: f64,
    /// Denominator term (default: 1e-10).
    pub eps: f64,
}

impl Default for AdagradConfig {
    fn default() -> Self {
        Self {
            lr: 0.1,
            lr_decay: 0.0,
            weight_decay: 0.0,
            initial_accumulator: 0.0,
            eps: 1e-10,
        }
    }
}

impl AdagradConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_lr_decay(mut self, lr_decay: f64) -> Self {
        self.lr_decay = lr_decay;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

/// A tracked parameter with its squared-gradient accumulator.
struct TrackedParam {
    var: Var,
    sum: Tensor,
}

/// Adagrad over a fixed set of variables.
pub struct Adagrad {
    config: AdagradConfig,
    params: Vec<TrackedParam>,
    step: usize,
}

impl Adagrad {
    /// Number of updates applied so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Learning rate used by the next step.
    pub fn current_lr(&self) -> f64 {
        self.config.lr / (1.0 + self.step as f64 * self.config.lr_decay)
    }
}

impl candle_nn::Optimizer for Adagrad {
    type Config = AdagradConfig;

    fn new(vars: Vec<Var>, config: AdagradConfig) -> Result<Self> {
        let params = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let sum = var.ones_like()?.affine(config.initial_accumulator, 0.0)?;
                Ok(TrackedParam { var, sum })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let lr = self.current_lr();
        self.step += 1;

        for param in &mut self.params {
            // No gradient: variable not used by this loss.
            let Some(grad) = grads.get(param.var.as_tensor()) else {
                continue;
            };
            let theta = param.var.as_tensor().detach();
            let grad = if self.config.weight_decay != 0.0 {
                (grad + theta.affine(self.config.weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };

            param.sum = (&param.sum + grad.sqr()?)?.detach();
            let denom = (param.sum.sqrt()? + self.config.eps)?;
            let update = (grad.broadcast_div(&denom)? * lr)?;
            param.var.set(&(theta - update)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}
