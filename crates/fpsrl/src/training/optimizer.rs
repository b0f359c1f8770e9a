//! Adam with gradient clipping and a linear learning-rate schedule.

use crate::policy::{Agent, HasVarStore};
use crate::Result;
use tch::{nn, nn::OptimizerConfig, Kind, Tensor};

/// Adam epsilon
pub const ADAM_EPS: f64 = 1e-5;

/// Optimizer over an agent's trainable parameters.
pub struct PpoOptimizer {
    inner: nn::Optimizer,
    variables: Vec<Tensor>,
    base_lr: f64,
    lr: f64,
}

impl PpoOptimizer {
    pub fn new(agent: &mut Agent, learning_rate: f64) -> Result<Self> {
        let variables = agent.trainable_variables();
        let inner = nn::Adam {
            eps: ADAM_EPS,
            ..Default::default()
        }
        .build(agent.var_store_mut(), learning_rate)?;
        Ok(Self {
            inner,
            variables,
            base_lr: learning_rate,
            lr: learning_rate,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
        self.inner.set_lr(lr);
    }

    /// Linear decay to zero: `lr = (1 - update / num_updates) * base`,
    /// `update` counted from 0.
    pub fn anneal(&mut self, update: usize, num_updates: usize) {
        let frac = 1.0 - update as f64 / num_updates.max(1) as f64;
        self.set_lr(frac * self.base_lr);
    }

    /// Backpropagate `loss`, clip the global gradient norm and step.
    /// Returns the norm before clipping.
    pub fn backward_step(&mut self, loss: &Tensor, max_grad_norm: f64) -> f64 {
        self.inner.zero_grad();
        loss.backward();
        let norm = self.clip_grad_norm(max_grad_norm);
        self.inner.step();
        norm
    }

    /// Scale gradients so their global L2 norm is at most `max_norm`.
    pub fn clip_grad_norm(&mut self, max_norm: f64) -> f64 {
        let mut global_norm = 0.0f64;
        for var in &self.variables {
            let grad = var.grad();
            if grad.defined() {
                global_norm += grad
                    .pow_tensor_scalar(2.0)
                    .sum(Kind::Float)
                    .double_value(&[]);
            }
        }
        global_norm = global_norm.sqrt();

        if global_norm > max_norm {
            let clip_coef = max_norm / (global_norm + 1e-6);
            for var in &self.variables {
                let mut grad = var.grad();
                if grad.defined() {
                    let _ = grad.g_mul_scalar_(clip_coef);
                }
            }
        }
        global_norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AgentConfig;
    use tch::Device;

    fn agent() -> Agent {
        Agent::new(AgentConfig::new([3, 36, 36], 3), Device::Cpu).unwrap()
    }

    #[test]
    fn test_linear_anneal() {
        let mut agent = agent();
        let mut opt = PpoOptimizer::new(&mut agent, 1e-3).unwrap();
        opt.anneal(0, 4);
        assert_eq!(opt.learning_rate(), 1e-3);
        opt.anneal(2, 4);
        assert!((opt.learning_rate() - 5e-4).abs() < 1e-12);
        opt.anneal(3, 4);
        assert!((opt.learning_rate() - 2.5e-4).abs() < 1e-12);
    }

    #[test]
    fn test_clipping_bounds_gradient_norm() {
        let mut agent = agent();
        let mut opt = PpoOptimizer::new(&mut agent, 1e-3).unwrap();
        let obs = Tensor::rand([4, 3, 36, 36], (Kind::Float, Device::Cpu)) * 255.0;
        let loss = agent.value(&obs).sum(Kind::Float) * 1000.0;

        opt.inner.zero_grad();
        loss.backward();
        let before = opt.clip_grad_norm(0.5);
        assert!(before > 0.5);

        let after: f64 = opt
            .variables
            .iter()
            .map(|v| v.grad())
            .filter(|g| g.defined())
            .map(|g| g.pow_tensor_scalar(2.0).sum(Kind::Float).double_value(&[]))
            .sum::<f64>()
            .sqrt();
        assert!(after <= 0.5 + 1e-4);
    }

    #[test]
    fn test_clipping_rescales_every_gradient_in_place() {
        let mut agent = agent();
        let mut opt = PpoOptimizer::new(&mut agent, 1e-3).unwrap();
        let obs = Tensor::rand([4, 3, 36, 36], (Kind::Float, Device::Cpu)) * 255.0;
        let loss = agent.value(&obs).sum(Kind::Float) * 1000.0;

        opt.inner.zero_grad();
        loss.backward();
        let raw: Vec<Tensor> = opt
            .variables
            .iter()
            .map(|v| v.grad())
            .filter(|g| g.defined())
            .map(|g| g.copy())
            .collect();
        let norm = opt.clip_grad_norm(0.5);
        let coef = 0.5 / (norm + 1e-6);

        let clipped: Vec<Tensor> = opt.variables.iter().map(|v| v.grad()).filter(|g| g.defined()).collect();
        assert_eq!(raw.len(), clipped.len());
        for (before, after) in raw.iter().zip(&clipped) {
            assert!(after.allclose(&(before * coef), 1e-4, 1e-6, false));
        }
    }

    #[test]
    fn test_step_changes_parameters() {
        let mut agent = agent();
        let mut opt = PpoOptimizer::new(&mut agent, 1e-2).unwrap();
        let before: Vec<Tensor> = agent.trainable_variables().iter().map(|v| v.copy()).collect();
        let obs = Tensor::rand([2, 3, 36, 36], (Kind::Float, Device::Cpu)) * 255.0;
        let loss = agent.value(&obs).pow_tensor_scalar(2.0).mean(Kind::Float);
        opt.backward_step(&loss, 0.5);
        let changed = before
            .iter()
            .zip(agent.trainable_variables())
            .any(|(a, b)| !a.equal(&b));
        assert!(changed);
    }
}
