//! Evaluation harness.
//!
//! Runs the agent with gradients disabled and the backbone in inference
//! mode on a held-out pool until enough episodes finish or the step cap is
//! reached. The agent is only read.

use super::episode::{EpisodeStats, EpisodeSummary, EpisodeTracker};
use super::rollout::observations_to_tensor;
use super::TrainerConfig;
use crate::policy::Agent;
use crate::vector::AsyncEnvPool;
use crate::Result;
use ndarray::{ArrayD, Axis, Slice};
use serde::Serialize;
use tch::{Device, Tensor};

/// Kill count at which the success score starts rising
pub const SUCCESS_OFFSET: f64 = 3.5;
/// Kill range mapped onto `[0, 1]`
pub const SUCCESS_SCALE: f64 = 26.5;

/// Normalized success of a mean kill count, clamped to `[0, 1]`
pub fn success_score(kills: f64) -> f64 {
    ((kills - SUCCESS_OFFSET) / SUCCESS_SCALE).clamp(0.0, 1.0)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvalConfig {
    /// Polls before giving up
    pub max_steps: usize,
    /// Finished episodes that end the evaluation
    pub episodes: usize,
    /// Keep slot 0's frames until its first episode ends
    pub record_frames: bool,
    pub seed: Option<u64>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            max_steps: 1250,
            episodes: 10,
            record_frames: false,
            seed: None,
        }
    }
}

impl EvalConfig {
    pub fn from_trainer(config: &TrainerConfig) -> Self {
        Self {
            max_steps: config.eval_max_steps,
            episodes: config.eval_episodes,
            record_frames: false,
            seed: Some(config.seed),
        }
    }

    pub fn with_frames(mut self, record: bool) -> Self {
        self.record_frames = record;
        self
    }
}

/// Aggregated result of one evaluation
#[derive(Clone, Debug, Default, Serialize)]
pub struct EvalReport {
    pub episodes: usize,
    pub steps: usize,
    pub mean_return: Option<f64>,
    pub mean_length: Option<f64>,
    pub mean_kills: Option<f64>,
    pub success: Option<f64>,
    /// Newest RGB frame `[3, H, W]` of slot 0 per delivery
    #[serde(skip)]
    pub frames: Vec<ArrayD<f32>>,
}

impl EvalReport {
    fn from_episodes(episodes: &[EpisodeStats], steps: usize, frames: Vec<ArrayD<f32>>) -> Self {
        let summary = EpisodeSummary::from_episodes(episodes);
        Self {
            episodes: summary.episodes,
            steps,
            mean_return: summary.mean_return,
            mean_length: summary.mean_length,
            success: summary.mean_kills.map(success_score),
            mean_kills: summary.mean_kills,
            frames,
        }
    }
}

/// Evaluate `agent` on `pool`.
pub fn evaluate(agent: &Agent, pool: &mut dyn AsyncEnvPool, config: &EvalConfig) -> Result<EvalReport> {
    let device = agent.device();
    pool.reset_async(config.seed)?;
    let mut tracker = EpisodeTracker::new(pool.num_envs());
    let mut finished = Vec::new();
    let mut frames = Vec::new();
    let mut recording = config.record_frames;
    let mut steps = 0;

    while steps < config.max_steps && finished.len() < config.episodes {
        let batch = pool.poll()?;
        steps += 1;

        for i in 0..batch.len() {
            let slot = batch.env_ids[i];
            let done = batch.terminated[i] || batch.truncated[i];
            if recording && slot == 0 {
                frames.push(newest_frame(&batch.observations, i));
                recording = !done;
            }
            if let Some(stats) = tracker.record(slot, batch.rewards[i], done, &batch.infos[i]) {
                finished.push(stats);
            }
        }

        let observations = observations_to_tensor(&batch.observations, device);
        let out = tch::no_grad(|| agent.act_eval(&observations));
        let actions = Vec::<i64>::try_from(out.action.to_device(Device::Cpu))?;
        pool.submit(&actions, &batch.env_ids)?;
    }

    let report = EvalReport::from_episodes(&finished, steps, frames);
    tracing::debug!(
        episodes = report.episodes,
        steps,
        mean_return = ?report.mean_return,
        mean_kills = ?report.mean_kills,
        "Evaluation finished"
    );
    Ok(report)
}

/// Last three channels of row `i` of a `[k, C, H, W]` batch
fn newest_frame(observations: &ArrayD<f32>, i: usize) -> ArrayD<f32> {
    let obs = observations.index_axis(Axis(0), i);
    let channels = obs.shape()[0];
    obs.slice_axis(Axis(0), Slice::from(channels.saturating_sub(3)..))
        .to_owned()
}

/// Stack recorded frames into `[F, 3, H, W]`
pub fn frames_to_tensor(frames: &[ArrayD<f32>]) -> Option<Tensor> {
    let tensors: Vec<Tensor> = frames
        .iter()
        .map(|f| observations_to_tensor(f, Device::Cpu))
        .collect();
    (!tensors.is_empty()).then(|| Tensor::stack(&tensors, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AgentConfig;
    use crate::vector::serial::tests::Counter;
    use crate::vector::SerialPool;

    fn agent() -> Agent {
        Agent::new(AgentConfig::new([3, 36, 36], 2), Device::Cpu).unwrap()
    }

    #[test]
    fn test_success_score() {
        assert_eq!(success_score(0.0), 0.0);
        assert_eq!(success_score(3.5), 0.0);
        assert!((success_score(16.75) - 0.5).abs() < 1e-12);
        assert_eq!(success_score(100.0), 1.0);
    }

    #[test]
    fn test_stops_after_enough_episodes() {
        let agent = agent();
        let mut pool = SerialPool::from_fn(3, 3, |_| Counter::boxed(4)).unwrap();
        let config = EvalConfig {
            episodes: 5,
            ..Default::default()
        };
        let report = evaluate(&agent, &mut pool, &config).unwrap();
        assert!(report.episodes >= 5);
        assert!(report.steps < config.max_steps);
        // Counter reports its step count as kills
        assert_eq!(report.mean_kills, Some(4.0));
        assert_eq!(report.mean_length, Some(5.0));
        assert_eq!(report.success, Some(success_score(4.0)));
        assert!(report.frames.is_empty());
    }

    #[test]
    fn test_step_cap_without_episodes() {
        let agent = agent();
        let mut pool = SerialPool::from_fn(2, 2, |_| Counter::boxed(1000)).unwrap();
        let config = EvalConfig {
            max_steps: 7,
            ..Default::default()
        };
        let report = evaluate(&agent, &mut pool, &config).unwrap();
        assert_eq!(report.steps, 7);
        assert_eq!(report.episodes, 0);
        assert_eq!(report.mean_return, None);
        assert_eq!(report.success, None);
    }

    #[test]
    fn test_records_first_episode_of_slot_zero() {
        let agent = agent();
        let mut pool = SerialPool::from_fn(2, 2, |_| Counter::boxed(3)).unwrap();
        let config = EvalConfig::default().with_frames(true);
        let report = evaluate(&agent, &mut pool, &config).unwrap();

        // reset observation plus three steps
        assert_eq!(report.frames.len(), 4);
        assert_eq!(report.frames[0].shape(), [3, 36, 36]);
        assert_eq!(report.frames[3][[0, 0, 0]], 3.0);
        let stacked = frames_to_tensor(&report.frames).unwrap();
        assert_eq!(stacked.size(), [4, 3, 36, 36]);
    }

    #[test]
    fn test_evaluation_leaves_parameters_alone() {
        let agent = agent();
        let before: Vec<Tensor> = agent.trainable_variables().iter().map(|v| v.copy()).collect();
        let mut pool = SerialPool::from_fn(2, 2, |_| Counter::boxed(3)).unwrap();
        evaluate(&agent, &mut pool, &EvalConfig::default()).unwrap();
        for (a, b) in before.iter().zip(agent.trainable_variables()) {
            assert!(a.equal(&b));
        }
    }
}
