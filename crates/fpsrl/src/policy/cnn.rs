use super::backbone::{average, probe_feature_dim, Backbone, FrameInput};
use super::config::AgentConfig;
use tch::{nn, nn::Module, Tensor};

/// Width of the CNN feature vector
pub const CNN_FEATURES: i64 = 256;

/// Nature CNN backbone
///
/// 3 convolutions -> flatten -> Linear(256) -> LayerNorm -> LeakyReLU ->
/// Linear(256) -> LeakyReLU
pub struct NatureCnn {
    input: FrameInput,
    net: nn::Sequential,
    feature_dim: i64,
}

impl NatureCnn {
    pub fn new(path: &nn::Path, config: &AgentConfig) -> Self {
        let in_channels = FrameInput::view_channels(config);
        let (height, width) = config.input_hw();
        let net_path = path / "net";

        let conv = |name: &str, c_in, c_out, k, stride| {
            nn::conv2d(
                &net_path / name,
                c_in,
                c_out,
                k,
                nn::ConvConfig {
                    stride,
                    ..Default::default()
                },
            )
        };

        // Output size of the conv stack
        let calc_conv = |size, kernel, stride| (size - kernel) / stride + 1;
        let h3 = calc_conv(calc_conv(calc_conv(height, 8, 4), 4, 2), 3, 1);
        let w3 = calc_conv(calc_conv(calc_conv(width, 8, 4), 4, 2), 3, 1);

        let net = nn::seq()
            .add(conv("c1", in_channels, 32, 8, 4))
            .add_fn(|x| x.relu())
            .add(conv("c2", 32, 64, 4, 2))
            .add_fn(|x| x.relu())
            .add(conv("c3", 64, 64, 3, 1))
            .add_fn(|x| x.relu())
            .add_fn(|x| x.flatten(1, -1))
            .add(nn::linear(
                &net_path / "fc1",
                64 * h3 * w3,
                CNN_FEATURES,
                Default::default(),
            ))
            .add(nn::layer_norm(
                &net_path / "norm",
                vec![CNN_FEATURES],
                Default::default(),
            ))
            .add_fn(|x| x.leaky_relu())
            .add(nn::linear(
                &net_path / "fc2",
                CNN_FEATURES,
                CNN_FEATURES,
                Default::default(),
            ))
            .add_fn(|x| x.leaky_relu());

        let mut cnn = Self {
            input: FrameInput::new(path, config, false),
            net,
            feature_dim: 0,
        };
        cnn.feature_dim = probe_feature_dim(&cnn, config, path.device());
        cnn
    }
}

impl Backbone for NatureCnn {
    fn adapt(&self, observations: &Tensor) -> Tensor {
        self.input.adapt(observations)
    }

    fn extract(&self, adapted: &Tensor, _train: bool) -> Tensor {
        let features = self
            .input
            .views(adapted)
            .iter()
            .map(|view| self.net.forward(view))
            .collect();
        average(features)
    }

    fn feature_dim(&self) -> i64 {
        self.feature_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::config::FrameMode;
    use tch::{Device, Kind};

    #[test]
    fn test_cnn_single_frame_features() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = AgentConfig::new([12, 64, 64], 4);
        let cnn = NatureCnn::new(&vs.root(), &config);
        assert_eq!(cnn.feature_dim(), CNN_FEATURES);

        let obs = Tensor::rand([5, 12, 64, 64], (Kind::Float, Device::Cpu)) * 255.0;
        let features = cnn.extract(&cnn.adapt(&obs), true);
        assert_eq!(features.size(), [5, CNN_FEATURES]);
    }

    #[test]
    fn test_cnn_conv_adapter_uses_all_channels() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = AgentConfig::new([12, 64, 64], 4).with_frame_mode(FrameMode::ConvAdapter);
        let _cnn = NatureCnn::new(&vs.root(), &config);
        let vars = vs.variables();
        assert_eq!(vars["net.c1.weight"].size(), [32, 12, 8, 8]);
    }

    #[test]
    fn test_single_frame_ignores_older_frames() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = AgentConfig::new([6, 48, 48], 4);
        let cnn = NatureCnn::new(&vs.root(), &config);

        let newest = Tensor::rand([2, 3, 48, 48], (Kind::Float, Device::Cpu)) * 255.0;
        let older = Tensor::zeros([2, 3, 48, 48], (Kind::Float, Device::Cpu));
        let a = Tensor::cat(&[older.shallow_clone(), newest.shallow_clone()], 1);
        let b = Tensor::cat(&[older + 99.0, newest], 1);
        let fa = cnn.extract(&cnn.adapt(&a), false);
        let fb = cnn.extract(&cnn.adapt(&b), false);
        assert!(fa.equal(&fb));
    }
}
