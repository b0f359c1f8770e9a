//! Time-major rollout storage addressed by environment slot.
//!
//! Results arrive from the pool in arbitrary slot subsets, so every slot
//! keeps its own write cursor. [`RolloutBuffer::claim`] hands out the next
//! free step of each delivered slot; a rollout is complete when every
//! `(step, slot)` cell has been claimed exactly once.

use super::ppo::Advantages;
use crate::{FpsError, Result};
use tch::{Device, Kind, Tensor};

/// A `(step, slot)` cell of the buffer
pub type Coord = (usize, usize);

/// Storage for one rollout, `[T, N, ...]`.
///
/// Observations are kept as 8-bit pixels.
pub struct RolloutBuffer {
    pub observations: Tensor,
    pub actions: Tensor,
    pub log_probs: Tensor,
    pub rewards: Tensor,
    pub dones: Tensor,
    pub values: Tensor,
    num_steps: usize,
    num_envs: usize,
    cursors: Vec<usize>,
    writes: Vec<u8>,
    device: Device,
}

/// Flattened rollout ready for minibatching, `[T * N, ...]`
pub struct FlatBatch {
    pub observations: Tensor,
    pub actions: Tensor,
    pub log_probs: Tensor,
    pub values: Tensor,
    pub advantages: Tensor,
    pub returns: Tensor,
}

impl FlatBatch {
    pub fn len(&self) -> i64 {
        self.actions.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows selected by `indices` (int64, on the batch device)
    pub fn select(&self, indices: &Tensor) -> FlatBatch {
        FlatBatch {
            observations: self.observations.index_select(0, indices),
            actions: self.actions.index_select(0, indices),
            log_probs: self.log_probs.index_select(0, indices),
            values: self.values.index_select(0, indices),
            advantages: self.advantages.index_select(0, indices),
            returns: self.returns.index_select(0, indices),
        }
    }
}

impl RolloutBuffer {
    pub fn new(num_steps: usize, num_envs: usize, obs_shape: [i64; 3], device: Device) -> Self {
        let (t, n) = (num_steps as i64, num_envs as i64);
        let [c, h, w] = obs_shape;
        let float = (Kind::Float, device);
        Self {
            observations: Tensor::zeros([t, n, c, h, w], (Kind::Uint8, device)),
            actions: Tensor::zeros([t, n], (Kind::Int64, device)),
            log_probs: Tensor::zeros([t, n], float),
            rewards: Tensor::zeros([t, n], float),
            dones: Tensor::zeros([t, n], float),
            values: Tensor::zeros([t, n], float),
            num_steps,
            num_envs,
            cursors: vec![0; num_envs],
            writes: vec![0; num_steps * num_envs],
            device,
        }
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn num_envs(&self) -> usize {
        self.num_envs
    }

    /// Start a new rollout. Stored tensors are overwritten, not cleared.
    pub fn reset(&mut self) {
        self.cursors.fill(0);
        self.writes.fill(0);
    }

    /// Every step of `slot` has been claimed
    pub fn is_full(&self, slot: usize) -> bool {
        self.cursors.get(slot).is_some_and(|&c| c >= self.num_steps)
    }

    pub fn is_complete(&self) -> bool {
        self.cursors.iter().all(|&c| c >= self.num_steps)
    }

    /// Next free cell of every slot in `env_ids`, advancing their cursors.
    ///
    /// Fails on out-of-range or repeated slots and on slots whose column is
    /// already full; nothing is claimed on failure.
    pub fn claim(&mut self, env_ids: &[usize]) -> Result<Vec<Coord>> {
        for (i, &slot) in env_ids.iter().enumerate() {
            if slot >= self.num_envs {
                return Err(FpsError::SlotOutOfRange {
                    slot,
                    num_envs: self.num_envs,
                });
            }
            if env_ids[..i].contains(&slot) {
                return Err(FpsError::DuplicateSlot(slot));
            }
            if self.is_full(slot) {
                return Err(FpsError::Config(format!(
                    "slot {slot} already holds {} steps",
                    self.num_steps
                )));
            }
        }
        Ok(env_ids
            .iter()
            .map(|&slot| {
                let step = self.cursors[slot];
                self.cursors[slot] += 1;
                self.writes[step * self.num_envs + slot] += 1;
                (step, slot)
            })
            .collect())
    }

    fn flat_index(&self, coords: &[Coord]) -> Tensor {
        let idx: Vec<i64> = coords
            .iter()
            .map(|&(step, slot)| (step * self.num_envs + slot) as i64)
            .collect();
        Tensor::from_slice(&idx).to_device(self.device)
    }

    /// Write pool results into claimed cells.
    ///
    /// `observations` is `[k, C, H, W]`, `rewards` and `dones` are `[k]`,
    /// in the order of `coords`.
    pub fn store_step(&mut self, coords: &[Coord], observations: &Tensor, rewards: &Tensor, dones: &Tensor) {
        let idx = self.flat_index(coords);
        scatter(&mut self.observations, &idx, observations);
        scatter(&mut self.rewards, &idx, rewards);
        scatter(&mut self.dones, &idx, dones);
    }

    /// Write the policy's outputs for claimed cells.
    pub fn store_policy(&mut self, coords: &[Coord], actions: &Tensor, log_probs: &Tensor, values: &Tensor) {
        let idx = self.flat_index(coords);
        scatter(&mut self.actions, &idx, actions);
        scatter(&mut self.log_probs, &idx, log_probs);
        scatter(&mut self.values, &idx, values);
    }

    /// Fail unless every cell was written exactly once.
    pub fn ensure_complete(&self) -> Result<()> {
        let written = self.writes.iter().filter(|&&w| w == 1).count();
        let expected = self.writes.len();
        if written == expected && self.is_complete() {
            Ok(())
        } else {
            Err(FpsError::IncompleteRollout { written, expected })
        }
    }

    /// Write count of every cell, `[T][N]` row-major
    pub fn write_counts(&self) -> &[u8] {
        &self.writes
    }

    /// Flatten steps and slots into one batch axis.
    pub fn flatten(&self, advantages: &Advantages) -> FlatBatch {
        let obs = self.observations.size();
        FlatBatch {
            observations: self.observations.reshape([-1, obs[2], obs[3], obs[4]]),
            actions: self.actions.reshape([-1]),
            log_probs: self.log_probs.reshape([-1]),
            values: self.values.reshape([-1]),
            advantages: advantages.advantages.reshape([-1]),
            returns: advantages.returns.reshape([-1]),
        }
    }
}

/// `dst.view(T * N, ...)[idx] = src`
fn scatter(dst: &mut Tensor, idx: &Tensor, src: &Tensor) {
    let size = dst.size();
    let mut flat_shape = vec![size[0] * size[1]];
    flat_shape.extend_from_slice(&size[2..]);
    let mut flat = dst.view(flat_shape.as_slice());
    let src = src.to_device(dst.device()).to_kind(dst.kind());
    let _ = flat.index_copy_(0, idx, &src);
}
