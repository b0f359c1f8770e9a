//! ResNet-18 backbone.
//!
//! Uses the torchvision-compatible layout from `tch::vision::resnet`, so
//! ImageNet weights exported to a libtorch `.ot` file load by name.

use super::backbone::{average, probe_feature_dim, Backbone, FrameInput};
use super::config::AgentConfig;
use tch::{nn, nn::ModuleT, Tensor};

pub struct ResNet18 {
    input: FrameInput,
    net: nn::FuncT<'static>,
    feature_dim: i64,
}

impl ResNet18 {
    pub fn new(path: &nn::Path, config: &AgentConfig) -> Self {
        let net = tch::vision::resnet::resnet18_no_final_layer(&(path / "net"));
        let mut resnet = Self {
            input: FrameInput::new(path, config, true),
            net,
            feature_dim: 0,
        };
        resnet.feature_dim = probe_feature_dim(&resnet, config, path.device());
        resnet
    }
}

impl Backbone for ResNet18 {
    fn adapt(&self, observations: &Tensor) -> Tensor {
        self.input.adapt(observations)
    }

    fn extract(&self, adapted: &Tensor, train: bool) -> Tensor {
        let features = self
            .input
            .views(adapted)
            .iter()
            .map(|view| self.net.forward_t(view, train))
            .collect();
        average(features)
    }

    fn feature_dim(&self) -> i64 {
        self.feature_dim
    }
}
