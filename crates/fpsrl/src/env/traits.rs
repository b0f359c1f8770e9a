//! Core environment trait definitions.

use crate::spaces::DynSpace;
use ndarray::ArrayD;

/// Counter key for the cumulative kills of the current episode.
pub const KILLCOUNT_TOTAL: &str = "KILLCOUNT_TOTAL";

/// Information returned from environment steps
#[derive(Clone, Debug, Default)]
pub struct EnvInfo {
    /// Named game counters, e.g. [`KILLCOUNT_TOTAL`]
    pub counters: smallvec::SmallVec<[(&'static str, f32); 4]>,
}

impl EnvInfo {
    /// Create empty info
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a counter
    pub fn with_counter(mut self, key: &'static str, value: f32) -> Self {
        self.counters.push((key, value));
        self
    }

    /// Get a counter by key
    pub fn get(&self, key: &str) -> Option<f32> {
        self.counters
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }
}

/// Result from a single environment step
#[derive(Clone, Debug)]
pub struct StepResult {
    /// Observation after the step, `[C, H, W]` raw pixels
    pub observation: ArrayD<f32>,
    pub reward: f32,
    /// Episode ended inside the game (death, objective, out of ammo)
    pub terminated: bool,
    /// Episode cut by a time limit
    pub truncated: bool,
    pub info: EnvInfo,
}

impl StepResult {
    /// Check if episode is done (terminated or truncated)
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Core trait for first-person environments.
///
/// Observations are image tensors shaped `[channels, height, width]` with raw
/// pixel values in `[0, 255]`. When several frames are stacked the oldest
/// frame comes first, so the last three channels hold the newest RGB frame.
///
/// # Example
///
/// ```rust,ignore
/// use fpsrl::env::{EnvInfo, Environment, StepResult};
/// use fpsrl::spaces::{Box as BoxSpace, Discrete, DynSpace};
///
/// struct Corridor { t: u32 }
///
/// impl Environment for Corridor {
///     fn observation_space(&self) -> DynSpace {
///         DynSpace::Box(BoxSpace::image(3, 32, 32))
///     }
///
///     fn action_space(&self) -> DynSpace {
///         DynSpace::Discrete(Discrete::new(3))
///     }
///
///     fn reset(&mut self, _seed: Option<u64>) -> (ArrayD<f32>, EnvInfo) {
///         self.t = 0;
///         (ArrayD::zeros(IxDyn(&[3, 32, 32])), EnvInfo::new())
///     }
///
///     fn step(&mut self, action: i64) -> StepResult {
///         // ... advance the game
///     }
/// }
/// ```
pub trait Environment: Send {
    /// Get the observation space
    fn observation_space(&self) -> DynSpace;

    /// Get the action space
    fn action_space(&self) -> DynSpace;

    /// Reset the environment to a fresh episode
    fn reset(&mut self, seed: Option<u64>) -> (ArrayD<f32>, EnvInfo);

    /// Advance one step with a discrete action index
    fn step(&mut self, action: i64) -> StepResult;

    /// Optional: text rendering of the current state
    fn render(&self) -> Option<String> {
        None
    }

    /// Optional: Close the environment and free resources
    fn close(&mut self) {}

    /// Check if environment is done and needs reset
    fn is_done(&self) -> bool {
        false
    }
}
