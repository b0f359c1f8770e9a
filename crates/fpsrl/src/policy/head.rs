//! Actor and critic heads.

use super::config::HeadKind;
use tch::{nn, nn::Module, Tensor};

/// Hidden width of the MLP heads
pub const HEAD_HIDDEN: i64 = 256;

/// Maps features to action logits and a scalar value
#[derive(Debug)]
pub struct PolicyValueHead {
    actor: nn::Sequential,
    critic: nn::Sequential,
}

impl PolicyValueHead {
    pub fn new(path: &nn::Path, kind: HeadKind, feature_dim: i64, num_actions: i64) -> Self {
        Self {
            actor: head_net(&(path / "actor"), kind, feature_dim, num_actions),
            critic: head_net(&(path / "critic"), kind, feature_dim, 1),
        }
    }

    /// `(logits [B, A], value [B])`
    pub fn forward(&self, features: &Tensor) -> (Tensor, Tensor) {
        (self.actor.forward(features), self.value(features))
    }

    pub fn value(&self, features: &Tensor) -> Tensor {
        self.critic.forward(features).squeeze_dim(-1)
    }
}

fn head_net(path: &nn::Path, kind: HeadKind, in_dim: i64, out_dim: i64) -> nn::Sequential {
    match kind {
        HeadKind::Linear => nn::seq().add(nn::linear(path / "out", in_dim, out_dim, Default::default())),
        HeadKind::Mlp => nn::seq()
            .add(nn::linear(path / "hidden", in_dim, HEAD_HIDDEN, Default::default()))
            .add_fn(|x| x.relu())
            .add(nn::linear(path / "out", HEAD_HIDDEN, out_dim, Default::default())),
    }
}
