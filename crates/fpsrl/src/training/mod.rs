//! PPO training.
//!
//! Provides:
//! - `RolloutBuffer` / `RolloutCollector` - asynchronous rollout collection
//! - `compute_gae` / `compute_nstep_returns` - advantage estimation
//! - `ppo_update` - clipped-objective optimization over minibatches
//! - `evaluate` / `ScoreMatrix` - evaluation harness and continual metrics
//! - `Trainer` - the multi-task training loop

mod buffer;
mod config;
mod context;
mod episode;
mod eval;
mod hooks;
mod optimizer;
mod ppo;
mod rollout;
mod scores;
mod trainer;
mod update;

pub use buffer::{FlatBatch, RolloutBuffer};
pub use config::TrainerConfig;
pub use context::TrainContext;
pub use episode::{EpisodeStats, EpisodeSummary, EpisodeTracker};
pub use eval::{evaluate, frames_to_tensor, success_score, EvalConfig, EvalReport, SUCCESS_OFFSET, SUCCESS_SCALE};
pub use hooks::TrainingHook;
pub use optimizer::PpoOptimizer;
pub use ppo::{
    approx_kl, clip_fraction, clipped_policy_loss, compute_gae, compute_nstep_returns, explained_variance,
    normalize_advantages, value_loss, Advantages,
};
pub use rollout::{observations_to_tensor, RolloutCollector, RolloutOutput};
pub use scores::{ContinualMetrics, ScoreMatrix, PAPER_SCALE};
pub use trainer::{Task, TrainSummary, Trainer};
pub use update::{ppo_update, UpdateStats};
