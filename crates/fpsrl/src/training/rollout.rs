//! Rollout collection over an asynchronous pool.
//!
//! Each poll delivers some subset of slots. Their results are written to the
//! next free step of each slot, the agent acts on exactly those observations
//! and the actions go straight back to the same slots. A slot whose column
//! is already full keeps its result aside instead: that observation is the
//! bootstrap target of this rollout and step 0 of the next one.

use super::buffer::RolloutBuffer;
use super::context::TrainContext;
use super::episode::{EpisodeStats, EpisodeTracker};
use crate::policy::Agent;
use crate::vector::{AsyncEnvPool, PoolBatch};
use crate::{FpsError, Result};
use ndarray::ArrayD;
use tch::{Device, Kind, Tensor};

/// Convert pool observations to an 8-bit pixel tensor on `device`.
pub fn observations_to_tensor(observations: &ArrayD<f32>, device: Device) -> Tensor {
    let shape: Vec<i64> = observations.shape().iter().map(|&d| d as i64).collect();
    let data: Vec<f32> = observations.iter().copied().collect();
    Tensor::from_slice(&data)
        .reshape(shape.as_slice())
        .round()
        .clamp(0.0, 255.0)
        .to_kind(Kind::Uint8)
        .to_device(device)
}

/// A delivered result held back for the next rollout
struct Held {
    observation: Tensor,
    reward: f32,
    done: bool,
}

/// What one rollout produced besides the buffer contents
pub struct RolloutOutput {
    /// Value of the observation following each slot's last step, `[N]`
    pub next_value: Tensor,
    pub episodes: Vec<EpisodeStats>,
    pub polls: usize,
}

/// Drives one pool into a [`RolloutBuffer`], rollout after rollout.
pub struct RolloutCollector {
    held: Vec<Option<Held>>,
    episodes: EpisodeTracker,
}

impl RolloutCollector {
    pub fn new(num_envs: usize) -> Self {
        Self {
            held: (0..num_envs).map(|_| None).collect(),
            episodes: EpisodeTracker::new(num_envs),
        }
    }

    /// Forget held results and running episodes, e.g. after `reset_async`.
    pub fn clear(&mut self) {
        self.held.iter_mut().for_each(|h| *h = None);
        self.episodes.reset();
    }

    pub fn episode_tracker(&self) -> &EpisodeTracker {
        &self.episodes
    }

    /// Fill `buffer` with one rollout.
    ///
    /// The pool must have been reset with `reset_async` before the first
    /// call (and whenever [`RolloutCollector::clear`] was called).
    pub fn collect(
        &mut self,
        agent: &Agent,
        pool: &mut dyn AsyncEnvPool,
        buffer: &mut RolloutBuffer,
        ctx: &mut TrainContext,
    ) -> Result<RolloutOutput> {
        let num_envs = buffer.num_envs();
        if pool.num_envs() != num_envs || self.held.len() != num_envs {
            return Err(FpsError::Config(format!(
                "pool has {} slots, buffer {} and collector {}",
                pool.num_envs(),
                num_envs,
                self.held.len()
            )));
        }
        buffer.reset();
        let mut episodes = Vec::new();

        self.replay_held(agent, pool, buffer)?;

        let mut polls = 0;
        while !(buffer.is_complete() && self.held.iter().all(Option::is_some)) {
            let batch = pool.poll()?;
            polls += 1;
            ctx.global_step += pool.batch_size() as u64;

            for i in 0..batch.len() {
                let done = batch.terminated[i] || batch.truncated[i];
                if let Some(stats) = self.episodes.record(batch.env_ids[i], batch.rewards[i], done, &batch.infos[i]) {
                    episodes.push(stats);
                }
            }
            self.scatter(agent, pool, buffer, &batch, ctx.device)?;
        }

        let next_obs: Vec<Tensor> = self
            .held
            .iter()
            .flatten()
            .map(|h| h.observation.shallow_clone())
            .collect();
        let next_value = tch::no_grad(|| agent.value(&Tensor::stack(&next_obs, 0)));

        buffer.ensure_complete()?;
        Ok(RolloutOutput {
            next_value,
            episodes,
            polls,
        })
    }

    /// Write a delivered batch, act on the writable part and submit.
    fn scatter(
        &mut self,
        agent: &Agent,
        pool: &mut dyn AsyncEnvPool,
        buffer: &mut RolloutBuffer,
        batch: &PoolBatch,
        device: Device,
    ) -> Result<()> {
        let observations = observations_to_tensor(&batch.observations, device);
        let mut rows = Vec::with_capacity(batch.len());
        for (i, &slot) in batch.env_ids.iter().enumerate() {
            if slot >= buffer.num_envs() {
                return Err(FpsError::SlotOutOfRange {
                    slot,
                    num_envs: buffer.num_envs(),
                });
            }
            if buffer.is_full(slot) {
                if self.held[slot].is_some() {
                    return Err(FpsError::EnvError(format!(
                        "slot {slot} delivered twice without an action"
                    )));
                }
                self.held[slot] = Some(Held {
                    observation: observations.get(i as i64),
                    reward: batch.rewards[i],
                    done: batch.terminated[i] || batch.truncated[i],
                });
            } else {
                rows.push(i);
            }
        }
        if rows.is_empty() {
            return Ok(());
        }

        let env_ids: Vec<usize> = rows.iter().map(|&i| batch.env_ids[i]).collect();
        let rewards: Vec<f32> = rows.iter().map(|&i| batch.rewards[i]).collect();
        let dones: Vec<f32> = rows
            .iter()
            .map(|&i| f32::from(u8::from(batch.terminated[i] || batch.truncated[i])))
            .collect();
        let index: Vec<i64> = rows.iter().map(|&i| i as i64).collect();
        let obs = observations.index_select(0, &Tensor::from_slice(&index).to_device(device));

        self.act_and_submit(agent, pool, buffer, &env_ids, &obs, &rewards, &dones)
    }

    /// Held results become step 0 of this rollout.
    fn replay_held(&mut self, agent: &Agent, pool: &mut dyn AsyncEnvPool, buffer: &mut RolloutBuffer) -> Result<()> {
        let held: Vec<(usize, Held)> = self
            .held
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, h)| h.take().map(|h| (slot, h)))
            .collect();
        if held.is_empty() {
            return Ok(());
        }
        let env_ids: Vec<usize> = held.iter().map(|(slot, _)| *slot).collect();
        let rewards: Vec<f32> = held.iter().map(|(_, h)| h.reward).collect();
        let dones: Vec<f32> = held.iter().map(|(_, h)| f32::from(u8::from(h.done))).collect();
        let obs: Vec<Tensor> = held.iter().map(|(_, h)| h.observation.shallow_clone()).collect();
        self.act_and_submit(agent, pool, buffer, &env_ids, &Tensor::stack(&obs, 0), &rewards, &dones)
    }

    #[allow(clippy::too_many_arguments)]
    fn act_and_submit(
        &self,
        agent: &Agent,
        pool: &mut dyn AsyncEnvPool,
        buffer: &mut RolloutBuffer,
        env_ids: &[usize],
        observations: &Tensor,
        rewards: &[f32],
        dones: &[f32],
    ) -> Result<()> {
        let coords = buffer.claim(env_ids)?;
        buffer.store_step(
            &coords,
            observations,
            &Tensor::from_slice(rewards),
            &Tensor::from_slice(dones),
        );

        let out = tch::no_grad(|| agent.act(observations, None));
        buffer.store_policy(&coords, &out.action, &out.log_prob, &out.value);

        let actions = Vec::<i64>::try_from(out.action.to_device(Device::Cpu))?;
        pool.submit(&actions, env_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AgentConfig;
    use crate::vector::serial::tests::Counter;
    use crate::vector::{SerialPool, ThreadedPool};

    fn agent() -> Agent {
        Agent::new(AgentConfig::new([3, 36, 36], 2).with_head(crate::policy::HeadKind::Linear), Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_observations_to_tensor() {
        let obs = ArrayD::from_shape_vec(vec![1, 2, 1, 2], vec![0.0, 12.4, 254.6, 300.0]).unwrap();
        let t = observations_to_tensor(&obs, Device::Cpu);
        assert_eq!(t.kind(), Kind::Uint8);
        assert_eq!(t.size(), [1, 2, 1, 2]);
        assert_eq!(Vec::<u8>::try_from(t.flatten(0, -1)).unwrap(), [0, 12, 255, 255]);
    }

    #[test]
    fn test_shuffled_pool_fills_every_cell() {
        let agent = agent();
        for seed in 0..4 {
            let mut pool = SerialPool::from_fn(5, 3, |_| Counter::boxed(6)).unwrap().with_shuffle(seed);
            pool.reset_async(Some(seed)).unwrap();
            let mut buffer = RolloutBuffer::new(4, 5, [3, 36, 36], Device::Cpu);
            let mut collector = RolloutCollector::new(5);
            let mut ctx = TrainContext::silent(Device::Cpu);

            for _ in 0..3 {
                let before = ctx.global_step;
                let out = collector.collect(&agent, &mut pool, &mut buffer, &mut ctx).unwrap();
                assert!(buffer.write_counts().iter().all(|&w| w == 1));
                assert_eq!(out.next_value.size(), [5]);
                assert_eq!(ctx.global_step - before, out.polls as u64 * 3);
            }
        }
    }

    #[test]
    fn test_columns_follow_each_slot_in_order() {
        // Counter observations are filled with the env's step counter, so a
        // slot's column must read 0, 1, 2, ... until its episode ends.
        let agent = agent();
        let mut pool = SerialPool::from_fn(4, 4, |_| Counter::boxed(100)).unwrap().with_shuffle(7);
        pool.reset_async(None).unwrap();
        let mut buffer = RolloutBuffer::new(6, 4, [3, 36, 36], Device::Cpu);
        let mut collector = RolloutCollector::new(4);
        let mut ctx = TrainContext::silent(Device::Cpu);

        collector.collect(&agent, &mut pool, &mut buffer, &mut ctx).unwrap();
        let pixels = buffer.observations.select(2, 0).select(2, 0).select(2, 0);
        let expected = Tensor::arange(6, (Kind::Uint8, Device::Cpu))
            .unsqueeze(1)
            .expand([6, 4], false);
        assert!(pixels.equal(&expected));

        // the held observation opens the next rollout
        collector.collect(&agent, &mut pool, &mut buffer, &mut ctx).unwrap();
        let first = buffer.observations.get(0).select(1, 0).select(1, 0).select(1, 0);
        assert!(first.equal(&Tensor::full([4], 6i64, (Kind::Uint8, Device::Cpu))));
    }

    #[test]
    fn test_episodes_are_reported() {
        let agent = agent();
        let mut pool = SerialPool::from_fn(2, 2, |_| Counter::boxed(3)).unwrap();
        pool.reset_async(None).unwrap();
        let mut buffer = RolloutBuffer::new(8, 2, [3, 36, 36], Device::Cpu);
        let mut collector = RolloutCollector::new(2);
        let mut ctx = TrainContext::silent(Device::Cpu);

        let out = collector.collect(&agent, &mut pool, &mut buffer, &mut ctx).unwrap();
        assert!(!out.episodes.is_empty());
        for episode in &out.episodes {
            assert_eq!(episode.kills, Some(3.0));
            assert_eq!(episode.length, 4);
        }
        let dones = buffer.dones.sum(Kind::Float).double_value(&[]);
        assert!(dones >= 2.0);
    }

    #[test]
    fn test_threaded_pool_rollout() {
        let agent = agent();
        let mut pool = ThreadedPool::from_fn(6, 2, |_| Counter::boxed(5)).unwrap();
        pool.reset_async(Some(1)).unwrap();
        let mut buffer = RolloutBuffer::new(5, 6, [3, 36, 36], Device::Cpu);
        let mut collector = RolloutCollector::new(6);
        let mut ctx = TrainContext::silent(Device::Cpu);

        for _ in 0..2 {
            collector.collect(&agent, &mut pool, &mut buffer, &mut ctx).unwrap();
            buffer.ensure_complete().unwrap();
        }
        pool.close();
    }

    #[test]
    fn test_mismatched_pool_is_rejected() {
        let agent = agent();
        let mut pool = SerialPool::from_fn(3, 3, |_| Counter::boxed(5)).unwrap();
        pool.reset_async(None).unwrap();
        let mut buffer = RolloutBuffer::new(2, 4, [3, 36, 36], Device::Cpu);
        let mut collector = RolloutCollector::new(4);
        let mut ctx = TrainContext::silent(Device::Cpu);
        assert!(matches!(
            collector.collect(&agent, &mut pool, &mut buffer, &mut ctx),
            Err(FpsError::Config(_))
        ));
    }
}
