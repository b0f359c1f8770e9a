//! Serial (in-process) environment pool.
//!
//! Steps environments on the calling thread as soon as their actions are
//! submitted. Delivery order can be shuffled with a seeded RNG, which makes
//! the out-of-order protocol reproducible in tests.

use super::pool::{advance, check_pool_sizes, AsyncEnvPool, Outcome, PoolBatch, SlotLedger};
use crate::env::Environment;
use crate::spaces::DynSpace;
use crate::{FpsError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Serial pool over boxed environments
pub struct SerialPool {
    envs: Vec<Box<dyn Environment>>,
    needs_reset: Vec<bool>,
    ready: Vec<Outcome>,
    ledger: SlotLedger,
    batch_size: usize,
    obs_space: DynSpace,
    action_space: DynSpace,
    shuffle: Option<StdRng>,
}

impl SerialPool {
    /// Create a pool from already constructed environments
    pub fn new(envs: Vec<Box<dyn Environment>>, batch_size: usize) -> Result<Self> {
        check_pool_sizes(envs.len(), batch_size)?;
        let obs_space = envs[0].observation_space();
        let action_space = envs[0].action_space();
        let num_actions = action_space.num_actions()?;

        Ok(Self {
            needs_reset: vec![false; envs.len()],
            ready: Vec::with_capacity(envs.len()),
            ledger: SlotLedger::new(envs.len(), num_actions),
            envs,
            batch_size,
            obs_space,
            action_space,
            shuffle: None,
        })
    }

    /// Create `num_envs` environments with a factory taking the slot index
    pub fn from_fn<F>(num_envs: usize, batch_size: usize, env_creator: F) -> Result<Self>
    where
        F: Fn(usize) -> Box<dyn Environment>,
    {
        Self::new((0..num_envs).map(env_creator).collect(), batch_size)
    }

    /// Deliver ready slots in a random order and in random group sizes
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = Some(StdRng::seed_from_u64(seed));
        self
    }
}

impl AsyncEnvPool for SerialPool {
    fn observation_space(&self) -> DynSpace {
        self.obs_space.clone()
    }

    fn action_space(&self) -> DynSpace {
        self.action_space.clone()
    }

    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn reset_async(&mut self, seed: Option<u64>) -> Result<()> {
        self.ready.clear();
        self.ledger.clear();
        for (i, env) in self.envs.iter_mut().enumerate() {
            let env_seed = seed.map(|s| s + i as u64);
            self.ready.push(Outcome::reset(i, env.reset(env_seed)));
            self.needs_reset[i] = false;
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<PoolBatch> {
        if self.ready.is_empty() {
            return Err(FpsError::EnvError(
                "poll on a serial pool with no submitted actions".to_string(),
            ));
        }

        let limit = self.batch_size.min(self.ready.len());
        let take = match self.shuffle.as_mut() {
            Some(rng) => {
                self.ready.shuffle(rng);
                rng.gen_range(1..=limit)
            }
            None => limit,
        };

        let outcomes: Vec<Outcome> = self.ready.drain(..take).collect();
        let batch = PoolBatch::from_outcomes(outcomes)?;
        self.ledger.delivered(&batch.env_ids);
        Ok(batch)
    }

    fn submit(&mut self, actions: &[i64], env_ids: &[usize]) -> Result<()> {
        self.ledger.accept(actions, env_ids)?;
        for (&id, &action) in env_ids.iter().zip(actions) {
            let outcome = advance(id, self.envs[id].as_mut(), &mut self.needs_reset[id], action);
            self.ready.push(outcome);
        }
        Ok(())
    }

    fn close(&mut self) {
        for env in &mut self.envs {
            env.close();
        }
        self.ready.clear();
    }
}
