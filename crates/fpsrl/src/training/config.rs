//! Trainer configuration.

use crate::{FpsError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the PPO trainer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    // Run
    /// Experiment name, also the stem of the saved agent
    pub exp_name: String,
    /// Directory the agent is written to
    pub data_dir: String,
    /// Random seed
    pub seed: u64,
    /// Disable cuDNN autotuning for reproducible kernels
    pub deterministic: bool,
    /// Use an accelerator when one is available
    pub cuda: bool,
    /// Write TensorBoard event files
    pub track: bool,
    /// Show a progress bar
    pub progress: bool,

    // Rollout
    /// Environment slots in every training pool
    pub num_envs: usize,
    /// Steps per slot in one rollout
    pub num_steps: usize,
    /// Updates spent on each task
    pub updates_per_task: usize,

    // Advantage estimation
    /// Use GAE; otherwise n-step bootstrapped returns
    pub gae: bool,
    /// Discount factor
    pub gamma: f64,
    /// GAE lambda
    pub gae_lambda: f64,

    // PPO
    /// Learning rate
    pub learning_rate: f64,
    /// Anneal the learning rate linearly to zero
    pub anneal_lr: bool,
    /// Number of minibatches per epoch
    pub num_minibatches: usize,
    /// Number of epochs per update
    pub update_epochs: usize,
    /// Standardize advantages per minibatch
    pub norm_adv: bool,
    /// Surrogate clipping coefficient
    pub clip_coef: f64,
    /// Clip the value loss around the old values
    pub clip_vloss: bool,
    /// Entropy coefficient
    pub ent_coef: f64,
    /// Value function coefficient
    pub vf_coef: f64,
    /// Maximum global gradient norm
    pub max_grad_norm: f64,
    /// Approximate KL above which the remaining epochs are skipped
    pub target_kl: Option<f64>,

    // Evaluation
    /// Evaluate every this many updates
    pub eval_interval: usize,
    /// Completed episodes that end an evaluation
    pub eval_episodes: usize,
    /// Step cap of one evaluation
    pub eval_max_steps: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            exp_name: "ppo_vanilla".to_string(),
            data_dir: "models".to_string(),
            seed: 9,
            deterministic: true,
            cuda: true,
            track: false,
            progress: true,

            num_envs: 32,
            num_steps: 128,
            updates_per_task: 500,

            gae: true,
            gamma: 0.99,
            gae_lambda: 0.95,

            learning_rate: 2.5e-5,
            anneal_lr: true,
            num_minibatches: 32,
            update_epochs: 4,
            norm_adv: true,
            clip_coef: 0.2,
            clip_vloss: false,
            ent_coef: 0.01,
            vf_coef: 0.5,
            max_grad_norm: 0.5,
            target_kl: None,

            eval_interval: 20,
            eval_episodes: 10,
            eval_max_steps: 1250,
        }
    }
}

impl TrainerConfig {
    /// Transitions per update
    pub fn batch_size(&self) -> usize {
        self.num_envs * self.num_steps
    }

    pub fn minibatch_size(&self) -> usize {
        self.batch_size() / self.num_minibatches.max(1)
    }

    /// Total updates over `num_tasks` tasks
    pub fn num_updates(&self, num_tasks: usize) -> usize {
        self.updates_per_task * num_tasks
    }

    /// Reject sizings that cannot produce whole minibatches.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("num_envs", self.num_envs),
            ("num_steps", self.num_steps),
            ("updates_per_task", self.updates_per_task),
            ("num_minibatches", self.num_minibatches),
            ("update_epochs", self.update_epochs),
            ("eval_interval", self.eval_interval),
            ("eval_episodes", self.eval_episodes),
            ("eval_max_steps", self.eval_max_steps),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(FpsError::Config(format!("{name} must be positive")));
        }
        if self.batch_size() % self.num_minibatches != 0 {
            return Err(FpsError::Config(format!(
                "batch size {} ({} envs x {} steps) is not divisible into {} minibatches",
                self.batch_size(),
                self.num_envs,
                self.num_steps,
                self.num_minibatches
            )));
        }
        if !(0.0..=1.0).contains(&self.gamma) || !(0.0..=1.0).contains(&self.gae_lambda) {
            return Err(FpsError::Config("gamma and gae_lambda must lie in [0, 1]".into()));
        }
        if self.learning_rate <= 0.0 || self.clip_coef <= 0.0 || self.max_grad_norm <= 0.0 {
            return Err(FpsError::Config(
                "learning_rate, clip_coef and max_grad_norm must be positive".into(),
            ));
        }
        if self.target_kl.is_some_and(|kl| kl <= 0.0) {
            return Err(FpsError::Config("target_kl must be positive".into()));
        }
        Ok(())
    }

    pub fn with_exp_name(mut self, name: impl Into<String>) -> Self {
        self.exp_name = name.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<String>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_rollout(mut self, num_envs: usize, num_steps: usize) -> Self {
        self.num_envs = num_envs;
        self.num_steps = num_steps;
        self
    }

    pub fn with_updates_per_task(mut self, updates: usize) -> Self {
        self.updates_per_task = updates;
        self
    }

    pub fn with_minibatches(mut self, num_minibatches: usize, update_epochs: usize) -> Self {
        self.num_minibatches = num_minibatches;
        self.update_epochs = update_epochs;
        self
    }

    pub fn with_target_kl(mut self, target_kl: Option<f64>) -> Self {
        self.target_kl = target_kl;
        self
    }

    pub fn with_eval(mut self, interval: usize, episodes: usize, max_steps: usize) -> Self {
        self.eval_interval = interval;
        self.eval_episodes = episodes;
        self.eval_max_steps = max_steps;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Name/value rows for the hyper-parameter table
    pub fn hyperparameters(&self) -> Vec<(String, String)> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
            _ => Vec::new(),
        }
    }
}
