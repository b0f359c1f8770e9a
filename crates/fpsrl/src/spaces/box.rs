//! Box observation space

use ndarray::{ArrayD, IxDyn};

/// Box space for bounded values, used for pixel observations
#[derive(Clone, Debug)]
pub struct Box {
    pub low: ArrayD<f32>,
    pub high: ArrayD<f32>,
    shape: Vec<usize>,
}

impl Box {
    /// Create a new box space with given bounds
    pub fn new(low: ArrayD<f32>, high: ArrayD<f32>) -> Self {
        assert_eq!(low.shape(), high.shape(), "Low and high must have same shape");
        let shape = low.shape().to_vec();
        Self { low, high, shape }
    }

    /// Create a box space with uniform bounds
    pub fn uniform(shape: &[usize], low: f32, high: f32) -> Self {
        Self::new(
            ArrayD::from_elem(IxDyn(shape), low),
            ArrayD::from_elem(IxDyn(shape), high),
        )
    }

    /// Raw 8-bit pixels, `[channels, height, width]` in `[0, 255]`.
    pub fn image(channels: usize, height: usize, width: usize) -> Self {
        Self::uniform(&[channels, height, width], 0.0, 255.0)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_bounds() {
        let space = Box::image(12, 8, 8);
        assert_eq!(space.shape(), &[12, 8, 8]);
        assert!(space.low.iter().all(|&v| v == 0.0));
        assert!(space.high.iter().all(|&v| v == 255.0));
    }
}
