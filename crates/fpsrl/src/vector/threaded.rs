//! Threaded environment pool.
//!
//! Each environment lives on its own worker thread. Commands go out on a
//! per-worker channel and results come back on one shared channel, so slots
//! are delivered in whatever order they finish.

use super::pool::{advance, check_pool_sizes, AsyncEnvPool, Outcome, PoolBatch, SlotLedger};
use crate::env::Environment;
use crate::spaces::DynSpace;
use crate::{FpsError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use rayon::prelude::*;
use std::thread::JoinHandle;

enum Command {
    Reset { seed: Option<u64>, generation: u64 },
    Step { action: i64, generation: u64 },
    Close,
}

struct Worker {
    cmd_tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

/// Thread-per-environment pool with out-of-order delivery
pub struct ThreadedPool {
    workers: Vec<Worker>,
    res_rx: Receiver<(u64, Outcome)>,
    generation: u64,
    ledger: SlotLedger,
    batch_size: usize,
    obs_space: DynSpace,
    action_space: DynSpace,
}

impl ThreadedPool {
    /// Create `num_envs` environments in parallel and start one worker each
    pub fn from_fn<F>(num_envs: usize, batch_size: usize, env_creator: F) -> Result<Self>
    where
        F: Fn(usize) -> Box<dyn Environment> + Send + Sync,
    {
        check_pool_sizes(num_envs, batch_size)?;
        let envs: Vec<_> = (0..num_envs).into_par_iter().map(&env_creator).collect();
        Self::new(envs, batch_size)
    }

    /// Start one worker per environment
    pub fn new(envs: Vec<Box<dyn Environment>>, batch_size: usize) -> Result<Self> {
        check_pool_sizes(envs.len(), batch_size)?;
        let obs_space = envs[0].observation_space();
        let action_space = envs[0].action_space();
        let num_actions = action_space.num_actions()?;
        let num_envs = envs.len();

        let (res_tx, res_rx) = unbounded();
        let workers = envs
            .into_iter()
            .enumerate()
            .map(|(env_id, env)| spawn_worker(env_id, env, res_tx.clone()))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(num_envs, batch_size, "Started threaded environment pool");

        Ok(Self {
            workers,
            res_rx,
            generation: 0,
            ledger: SlotLedger::new(num_envs, num_actions),
            batch_size,
            obs_space,
            action_space,
        })
    }

    fn send(&self, env_id: usize, cmd: Command) -> Result<()> {
        self.workers[env_id]
            .cmd_tx
            .send(cmd)
            .map_err(|_| FpsError::EnvError(format!("environment worker {env_id} has exited")))
    }
}

fn spawn_worker(
    env_id: usize,
    mut env: Box<dyn Environment>,
    res_tx: Sender<(u64, Outcome)>,
) -> Result<Worker> {
    let (cmd_tx, cmd_rx) = unbounded::<Command>();
    let handle = std::thread::Builder::new()
        .name(format!("env-{env_id}"))
        .spawn(move || {
            let mut needs_reset = false;
            while let Ok(cmd) = cmd_rx.recv() {
                let (generation, outcome) = match cmd {
                    Command::Reset { seed, generation } => {
                        needs_reset = false;
                        (generation, Outcome::reset(env_id, env.reset(seed)))
                    }
                    Command::Step { action, generation } => {
                        (generation, advance(env_id, env.as_mut(), &mut needs_reset, action))
                    }
                    Command::Close => {
                        env.close();
                        break;
                    }
                };
                if res_tx.send((generation, outcome)).is_err() {
                    break;
                }
            }
        })?;
    Ok(Worker {
        cmd_tx,
        handle: Some(handle),
    })
}

impl AsyncEnvPool for ThreadedPool {
    fn observation_space(&self) -> DynSpace {
        self.obs_space.clone()
    }

    fn action_space(&self) -> DynSpace {
        self.action_space.clone()
    }

    fn num_envs(&self) -> usize {
        self.workers.len()
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn reset_async(&mut self, seed: Option<u64>) -> Result<()> {
        self.generation += 1;
        self.ledger.clear();
        for env_id in 0..self.workers.len() {
            self.send(
                env_id,
                Command::Reset {
                    seed: seed.map(|s| s + env_id as u64),
                    generation: self.generation,
                },
            )?;
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<PoolBatch> {
        let disconnected = || FpsError::EnvError("all environment workers have exited".into());
        let mut outcomes = Vec::with_capacity(self.batch_size);

        // Block for the first current-generation result, then drain what is ready.
        while outcomes.is_empty() {
            let (generation, outcome) = self.res_rx.recv().map_err(|_| disconnected())?;
            if generation == self.generation {
                outcomes.push(outcome);
            }
        }
        while outcomes.len() < self.batch_size {
            match self.res_rx.try_recv() {
                Ok((generation, outcome)) if generation == self.generation => outcomes.push(outcome),
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Err(disconnected()),
            }
        }

        let batch = PoolBatch::from_outcomes(outcomes)?;
        self.ledger.delivered(&batch.env_ids);
        Ok(batch)
    }

    fn submit(&mut self, actions: &[i64], env_ids: &[usize]) -> Result<()> {
        self.ledger.accept(actions, env_ids)?;
        for (&env_id, &action) in env_ids.iter().zip(actions) {
            self.send(
                env_id,
                Command::Step {
                    action,
                    generation: self.generation,
                },
            )?;
        }
        Ok(())
    }

    fn close(&mut self) {
        for worker in &self.workers {
            let _ = worker.cmd_tx.send(Command::Close);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ThreadedPool {
    fn drop(&mut self) {
        self.close();
    }
}
