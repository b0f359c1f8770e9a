//! One PPO update over a collected rollout.

use super::buffer::FlatBatch;
use super::hooks::TrainingHook;
use super::optimizer::PpoOptimizer;
use super::ppo::{approx_kl, clip_fraction, clipped_policy_loss, explained_variance, normalize_advantages, value_loss};
use super::TrainerConfig;
use crate::policy::Agent;
use crate::{FpsError, Result};
use std::collections::HashMap;
use tch::{Kind, Tensor};

/// Metrics of one update; losses are those of the last minibatch
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateStats {
    pub policy_loss: f64,
    pub value_loss: f64,
    pub entropy: f64,
    pub old_approx_kl: f64,
    pub approx_kl: f64,
    pub clipfrac: f64,
    pub explained_variance: Option<f64>,
    pub grad_norm: f64,
    pub learning_rate: f64,
    pub epochs: usize,
    pub early_stopped: bool,
}

impl UpdateStats {
    /// `losses/*` and `charts/learning_rate` entries
    pub fn metrics(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("losses/policy_loss".to_string(), self.policy_loss),
            ("losses/value_loss".to_string(), self.value_loss),
            ("losses/entropy".to_string(), self.entropy),
            ("losses/old_approx_kl".to_string(), self.old_approx_kl),
            ("losses/approx_kl".to_string(), self.approx_kl),
            ("losses/clipfrac".to_string(), self.clipfrac),
            (
                "losses/explained_variance".to_string(),
                self.explained_variance.unwrap_or(f64::NAN),
            ),
            ("losses/grad_norm".to_string(), self.grad_norm),
            ("charts/learning_rate".to_string(), self.learning_rate),
        ])
    }
}

/// Run `update_epochs` epochs of shuffled minibatch PPO over `batch`.
pub fn ppo_update(
    agent: &mut Agent,
    optimizer: &mut PpoOptimizer,
    batch: &FlatBatch,
    config: &TrainerConfig,
    hooks: &mut [Box<dyn TrainingHook>],
) -> Result<UpdateStats> {
    let batch_size = batch.len();
    let minibatch_size = config.minibatch_size() as i64;
    if batch_size == 0 || minibatch_size == 0 || batch_size % minibatch_size != 0 {
        return Err(FpsError::Config(format!(
            "batch of {batch_size} cannot be split into minibatches of {minibatch_size}"
        )));
    }
    let device = batch.actions.device();
    let value_clip = config.clip_vloss.then_some(config.clip_coef);

    let mut stats = UpdateStats {
        learning_rate: optimizer.learning_rate(),
        ..Default::default()
    };
    let mut clipfracs = Vec::new();

    for _ in 0..config.update_epochs {
        let order = Tensor::randperm(batch_size, (Kind::Int64, device));
        for start in (0..batch_size).step_by(minibatch_size as usize) {
            let mb = batch.select(&order.narrow(0, start, minibatch_size));

            let out = agent.act(&mb.observations, Some(&mb.actions));
            let log_ratio = &out.log_prob - &mb.log_probs;
            let ratio = log_ratio.exp();

            let (old_kl, kl) = tch::no_grad(|| approx_kl(&log_ratio.detach()));
            stats.old_approx_kl = old_kl;
            stats.approx_kl = kl;
            clipfracs.push(clip_fraction(&ratio.detach(), config.clip_coef));

            let advantages = if config.norm_adv {
                normalize_advantages(&mb.advantages)
            } else {
                mb.advantages.shallow_clone()
            };

            let pg_loss = clipped_policy_loss(&advantages, &ratio, config.clip_coef);
            let v_loss = value_loss(&out.value, &mb.values, &mb.returns, value_clip);
            let entropy = out.entropy.mean(Kind::Float);
            let mut loss = &pg_loss - config.ent_coef * &entropy + config.vf_coef * &v_loss;
            for hook in hooks.iter_mut() {
                if let Some(penalty) = hook.regularization(agent) {
                    loss = loss + penalty;
                }
            }

            stats.grad_norm = optimizer.backward_step(&loss, config.max_grad_norm);
            for hook in hooks.iter_mut() {
                hook.after_optimizer_step(agent);
            }

            stats.policy_loss = pg_loss.double_value(&[]);
            stats.value_loss = v_loss.double_value(&[]);
            stats.entropy = entropy.double_value(&[]);
        }
        stats.epochs += 1;

        if config.target_kl.is_some_and(|target| stats.approx_kl > target) {
            stats.early_stopped = true;
            tracing::debug!(approx_kl = stats.approx_kl, epochs = stats.epochs, "KL above target, stopping update early");
            break;
        }
    }

    stats.clipfrac = clipfracs.iter().sum::<f64>() / clipfracs.len().max(1) as f64;
    stats.explained_variance = explained_variance(&batch.values, &batch.returns);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AgentConfig;
    use crate::training::ppo::Advantages;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tch::Device;

    fn setup(batch_size: i64) -> (Agent, FlatBatch) {
        tch::manual_seed(0);
        let agent = Agent::new(AgentConfig::new([3, 36, 36], 3), Device::Cpu).unwrap();
        let obs = (Tensor::rand([batch_size, 3, 36, 36], (Kind::Float, Device::Cpu)) * 255.0).to_kind(Kind::Uint8);
        let out = tch::no_grad(|| agent.act(&obs, None));
        let advantages = Advantages {
            advantages: Tensor::randn([batch_size], (Kind::Float, Device::Cpu)),
            returns: Tensor::randn([batch_size], (Kind::Float, Device::Cpu)),
        };
        let batch = FlatBatch {
            observations: obs,
            actions: out.action,
            log_probs: out.log_prob,
            values: out.value,
            advantages: advantages.advantages,
            returns: advantages.returns,
        };
        (agent, batch)
    }

    fn config() -> TrainerConfig {
        TrainerConfig::default().with_rollout(4, 4).with_minibatches(4, 3)
    }

    #[test]
    fn test_first_minibatch_ratio_is_one() {
        let (agent, batch) = setup(16);
        let out = agent.act(&batch.observations, Some(&batch.actions));
        assert!(out.log_prob.allclose(&batch.log_probs, 1e-5, 1e-5, false));
    }

    #[test]
    fn test_update_runs_all_epochs() {
        let (mut agent, batch) = setup(16);
        let mut optimizer = PpoOptimizer::new(&mut agent, 1e-3).unwrap();
        let stats = ppo_update(&mut agent, &mut optimizer, &batch, &config(), &mut []).unwrap();
        assert_eq!(stats.epochs, 3);
        assert!(!stats.early_stopped);
        assert!(stats.approx_kl >= -1e-6);
        assert!((0.0..=1.0).contains(&stats.clipfrac));
        assert!(stats.explained_variance.is_some());
        assert_eq!(stats.metrics().len(), 9);
    }

    #[test]
    fn test_tiny_target_kl_stops_after_first_epoch() {
        let (mut agent, batch) = setup(16);
        let mut optimizer = PpoOptimizer::new(&mut agent, 1e-2).unwrap();
        let config = config().with_target_kl(Some(1e-12));
        let stats = ppo_update(&mut agent, &mut optimizer, &batch, &config, &mut []).unwrap();
        assert_eq!(stats.epochs, 1);
        assert!(stats.early_stopped);
    }

    #[derive(Default)]
    struct Counting {
        penalties: Arc<AtomicUsize>,
        steps: Arc<AtomicUsize>,
    }

    impl TrainingHook for Counting {
        fn regularization(&mut self, _agent: &Agent) -> Option<Tensor> {
            self.penalties.fetch_add(1, Ordering::SeqCst);
            Some(Tensor::from(0.0f32))
        }

        fn after_optimizer_step(&mut self, _agent: &mut Agent) {
            self.steps.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_hooks_run_per_minibatch() {
        let (mut agent, batch) = setup(16);
        let mut optimizer = PpoOptimizer::new(&mut agent, 1e-3).unwrap();
        let hook = Counting::default();
        let (penalties, steps) = (Arc::clone(&hook.penalties), Arc::clone(&hook.steps));
        let mut hooks: Vec<Box<dyn TrainingHook>> = vec![Box::new(hook)];
        ppo_update(&mut agent, &mut optimizer, &batch, &config(), &mut hooks).unwrap();
        // 3 epochs x 4 minibatches
        assert_eq!(penalties.load(Ordering::SeqCst), 12);
        assert_eq!(steps.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn test_rejects_uneven_batch() {
        let (mut agent, batch) = setup(10);
        let mut optimizer = PpoOptimizer::new(&mut agent, 1e-3).unwrap();
        assert!(ppo_update(&mut agent, &mut optimizer, &batch, &config(), &mut []).is_err());
    }
}
