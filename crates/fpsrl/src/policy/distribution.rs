//! Categorical action distribution.

use tch::{Kind, Tensor};

/// Categorical distribution over discrete actions, parameterised by logits.
///
/// Everything is computed from `log_softmax` so large logits stay finite.
pub struct Categorical {
    log_probs: Tensor,
}

impl Categorical {
    pub fn from_logits(logits: &Tensor) -> Self {
        Self {
            log_probs: logits.log_softmax(-1, Kind::Float),
        }
    }

    /// Normalised log-probabilities `[B, A]`
    pub fn log_probs(&self) -> &Tensor {
        &self.log_probs
    }

    pub fn probs(&self) -> Tensor {
        self.log_probs.exp()
    }

    /// Sample one action per row `[B]`
    pub fn sample(&self) -> Tensor {
        self.probs().multinomial(1, true).squeeze_dim(-1)
    }

    /// Most likely action per row `[B]`
    pub fn mode(&self) -> Tensor {
        self.log_probs.argmax(-1, false)
    }

    /// Log-probability of `actions` `[B]`
    pub fn log_prob(&self, actions: &Tensor) -> Tensor {
        let indices = actions.to_kind(Kind::Int64).unsqueeze(-1);
        self.log_probs.gather(-1, &indices, false).squeeze_dim(-1)
    }

    /// Entropy per row `[B]`
    pub fn entropy(&self) -> Tensor {
        -(self.probs() * &self.log_probs).sum_dim_intlist(-1, false, Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    #[test]
    fn test_uniform_entropy() {
        let dist = Categorical::from_logits(&Tensor::zeros([2, 4], (Kind::Float, Device::Cpu)));
        let entropy = dist.entropy();
        let expected = (4.0f64).ln();
        for i in 0..2 {
            assert!((entropy.double_value(&[i]) - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_log_prob_stable_for_large_logits() {
        let logits = Tensor::from_slice(&[1000.0f32, 0.0, -1000.0]).reshape([1, 3]);
        let dist = Categorical::from_logits(&logits);
        let lp = dist.log_prob(&Tensor::from_slice(&[2i64]));
        assert!(lp.double_value(&[0]).is_finite());
        assert!((dist.log_prob(&Tensor::from_slice(&[0i64])).double_value(&[0])).abs() < 1e-6);
        assert!(dist.entropy().double_value(&[0]).is_finite());
        assert_eq!(dist.mode().int64_value(&[0]), 0);
    }

    #[test]
    fn test_sample_in_range() {
        let logits = Tensor::randn([64, 5], (Kind::Float, Device::Cpu));
        let actions = Categorical::from_logits(&logits).sample();
        assert_eq!(actions.size(), [64]);
        assert!(actions.min().int64_value(&[]) >= 0);
        assert!(actions.max().int64_value(&[]) < 5);
    }
}
