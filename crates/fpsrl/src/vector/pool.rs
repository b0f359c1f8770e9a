//! Asynchronous environment pool contract.

use crate::env::{EnvInfo, Environment, StepResult};
use crate::spaces::{Discrete, DynSpace};
use crate::{FpsError, Result};
use ndarray::{ArrayD, Axis};

/// Results delivered by one [`AsyncEnvPool::poll`] call.
///
/// Row `i` of every field belongs to environment slot `env_ids[i]`. The ids
/// are a non-empty subset of the pool's slots in arbitrary order.
#[derive(Clone, Debug)]
pub struct PoolBatch {
    /// Stacked observations `[k, C, H, W]`
    pub observations: ArrayD<f32>,
    pub rewards: Vec<f32>,
    pub terminated: Vec<bool>,
    pub truncated: Vec<bool>,
    pub env_ids: Vec<usize>,
    pub infos: Vec<EnvInfo>,
}

impl PoolBatch {
    /// Number of slots delivered
    pub fn len(&self) -> usize {
        self.env_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.env_ids.is_empty()
    }

    /// Combined done flags (terminated OR truncated)
    #[cfg(test)]
    pub fn dones(&self) -> Vec<bool> {
        self.terminated
            .iter()
            .zip(&self.truncated)
            .map(|(&t, &tr)| t || tr)
            .collect()
    }

    pub(crate) fn from_outcomes(outcomes: Vec<Outcome>) -> Result<Self> {
        let views: Vec<_> = outcomes.iter().map(|o| o.observation.view()).collect();
        let observations = ndarray::stack(Axis(0), &views).map_err(|e| {
            FpsError::EnvError(format!("environments returned mismatched observations: {e}"))
        })?;

        let mut batch = Self {
            observations,
            rewards: Vec::with_capacity(outcomes.len()),
            terminated: Vec::with_capacity(outcomes.len()),
            truncated: Vec::with_capacity(outcomes.len()),
            env_ids: Vec::with_capacity(outcomes.len()),
            infos: Vec::with_capacity(outcomes.len()),
        };
        for o in outcomes {
            batch.rewards.push(o.reward);
            batch.terminated.push(o.terminated);
            batch.truncated.push(o.truncated);
            batch.env_ids.push(o.env_id);
            batch.infos.push(o.info);
        }
        Ok(batch)
    }
}

/// One environment's pending result.
#[derive(Clone, Debug)]
pub(crate) struct Outcome {
    pub env_id: usize,
    pub observation: ArrayD<f32>,
    pub reward: f32,
    pub terminated: bool,
    pub truncated: bool,
    pub info: EnvInfo,
}

impl Outcome {
    pub fn reset(env_id: usize, (observation, info): (ArrayD<f32>, EnvInfo)) -> Self {
        Self {
            env_id,
            observation,
            reward: 0.0,
            terminated: false,
            truncated: false,
            info,
        }
    }

    pub fn step(env_id: usize, result: StepResult) -> Self {
        Self {
            env_id,
            observation: result.observation,
            reward: result.reward,
            terminated: result.terminated,
            truncated: result.truncated,
            info: result.info,
        }
    }
}

/// Advance one environment, resetting it first if its last step ended the
/// episode. A reset is delivered with reward 0 and both flags cleared.
pub(crate) fn advance(env_id: usize, env: &mut dyn Environment, needs_reset: &mut bool, action: i64) -> Outcome {
    if *needs_reset {
        *needs_reset = false;
        Outcome::reset(env_id, env.reset(None))
    } else {
        let result = env.step(action);
        *needs_reset = result.done();
        Outcome::step(env_id, result)
    }
}

/// Tracks which slots hold a delivered observation that still awaits an action.
#[derive(Clone, Debug)]
pub(crate) struct SlotLedger {
    awaiting: Vec<bool>,
    actions: Discrete,
}

impl SlotLedger {
    pub fn new(num_envs: usize, num_actions: usize) -> Self {
        Self {
            awaiting: vec![false; num_envs],
            actions: Discrete::new(num_actions),
        }
    }

    pub fn clear(&mut self) {
        self.awaiting.fill(false);
    }

    pub fn delivered(&mut self, env_ids: &[usize]) {
        for &id in env_ids {
            self.awaiting[id] = true;
        }
    }

    /// Validate a submission and mark its slots as in flight.
    pub fn accept(&mut self, actions: &[i64], env_ids: &[usize]) -> Result<()> {
        if actions.len() != env_ids.len() {
            return Err(FpsError::ShapeMismatch {
                expected: vec![env_ids.len()],
                actual: vec![actions.len()],
            });
        }
        let num_envs = self.awaiting.len();
        for (&id, &action) in env_ids.iter().zip(actions) {
            if id >= num_envs {
                return Err(FpsError::SlotOutOfRange { slot: id, num_envs });
            }
            if !self.awaiting[id] {
                return Err(FpsError::EnvError(format!(
                    "action submitted to slot {id}, which has no outstanding observation"
                )));
            }
            if !self.actions.contains_action(action) {
                return Err(FpsError::EnvError(format!(
                    "action {action} out of range for {} actions",
                    self.actions.n
                )));
            }
        }
        for &id in env_ids {
            self.awaiting[id] = false;
        }
        Ok(())
    }
}

/// Pool of environments that deliver results asynchronously.
///
/// Protocol: `reset_async` once, then alternate `poll` and `submit`. Each
/// `poll` returns results for some subset of slots; actions for exactly those
/// slots are sent back with `submit`, and their next results arrive on a later
/// poll. A slot that finished an episode is reset on its next `submit`.
pub trait AsyncEnvPool: Send {
    fn observation_space(&self) -> DynSpace;

    fn action_space(&self) -> DynSpace;

    fn num_envs(&self) -> usize;

    /// Nominal number of slots delivered per poll
    fn batch_size(&self) -> usize;

    /// Reset every environment, discarding results still in flight.
    /// Environment `i` is seeded with `seed + i`.
    fn reset_async(&mut self, seed: Option<u64>) -> Result<()>;

    /// Wait for at least one ready slot and return up to `batch_size` of them.
    fn poll(&mut self) -> Result<PoolBatch>;

    /// Send actions to the given slots.
    fn submit(&mut self, actions: &[i64], env_ids: &[usize]) -> Result<()>;

    /// Release environments and worker resources.
    fn close(&mut self);
}

impl<P: AsyncEnvPool + ?Sized> AsyncEnvPool for Box<P> {
    fn observation_space(&self) -> DynSpace {
        (**self).observation_space()
    }

    fn action_space(&self) -> DynSpace {
        (**self).action_space()
    }

    fn num_envs(&self) -> usize {
        (**self).num_envs()
    }

    fn batch_size(&self) -> usize {
        (**self).batch_size()
    }

    fn reset_async(&mut self, seed: Option<u64>) -> Result<()> {
        (**self).reset_async(seed)
    }

    fn poll(&mut self) -> Result<PoolBatch> {
        (**self).poll()
    }

    fn submit(&mut self, actions: &[i64], env_ids: &[usize]) -> Result<()> {
        (**self).submit(actions, env_ids)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub(crate) fn check_pool_sizes(num_envs: usize, batch_size: usize) -> Result<()> {
    if num_envs == 0 {
        return Err(FpsError::Config("a pool needs at least one environment".into()));
    }
    if batch_size == 0 || batch_size > num_envs {
        return Err(FpsError::Config(format!(
            "pool batch size {batch_size} must be in 1..={num_envs}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_rejects_unknown_and_idle_slots() {
        let mut ledger = SlotLedger::new(3, 4);
        ledger.delivered(&[2, 0]);

        assert!(matches!(
            ledger.accept(&[1], &[5]),
            Err(FpsError::SlotOutOfRange { slot: 5, num_envs: 3 })
        ));
        assert!(ledger.accept(&[1], &[1]).is_err());
        assert!(ledger.accept(&[9], &[0]).is_err());
        assert!(ledger.accept(&[4], &[0]).is_err());
        assert!(ledger.accept(&[-1], &[0]).is_err());
        assert!(ledger.accept(&[1, 3], &[2, 0]).is_ok());
        // Already in flight
        assert!(ledger.accept(&[1], &[2]).is_err());
    }

    #[test]
    fn test_batch_from_outcomes_keeps_order() {
        let outcomes = vec![
            Outcome::reset(2, (ArrayD::from_elem(vec![1, 2, 2], 2.0), EnvInfo::new())),
            Outcome::reset(0, (ArrayD::from_elem(vec![1, 2, 2], 0.0), EnvInfo::new())),
        ];
        let batch = PoolBatch::from_outcomes(outcomes).unwrap();
        assert_eq!(batch.env_ids, vec![2, 0]);
        assert_eq!(batch.observations.shape(), &[2, 1, 2, 2]);
        assert_eq!(batch.observations[[0, 0, 0, 0]], 2.0);
        assert_eq!(batch.dones(), vec![false, false]);
    }
}
