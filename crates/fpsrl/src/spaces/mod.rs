//! Observation and action space types.
//!
//! Image observations are `Box` spaces shaped `[channels, height, width]`;
//! actions are drawn from a `Discrete` set.

mod r#box;
mod discrete;

pub use discrete::Discrete;
pub use r#box::Box;

use crate::{FpsError, Result};

/// Enum for dynamic space types
#[derive(Clone, Debug)]
pub enum DynSpace {
    Discrete(Discrete),
    Box(Box),
}

impl DynSpace {
    /// Get the shape of this space
    pub fn shape(&self) -> Vec<usize> {
        match self {
            DynSpace::Discrete(s) => s.shape().to_vec(),
            DynSpace::Box(s) => s.shape().to_vec(),
        }
    }

    /// Number of discrete actions, failing for continuous spaces.
    pub fn num_actions(&self) -> Result<usize> {
        match self {
            DynSpace::Discrete(s) => Ok(s.n),
            DynSpace::Box(_) => Err(FpsError::Config(
                "only discrete action spaces are supported".to_string(),
            )),
        }
    }

    /// Image shape `[C, H, W]` of an observation space.
    pub fn image_shape(&self) -> Result<[i64; 3]> {
        match self.shape().as_slice() {
            [c, h, w] => Ok([*c as i64, *h as i64, *w as i64]),
            other => Err(FpsError::ShapeMismatch {
                expected: vec![0, 0, 0],
                actual: other.to_vec(),
            }),
        }
    }
}
