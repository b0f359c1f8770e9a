//! Backbone capability and frame handling shared by every vision network.

use super::cnn::NatureCnn;
use super::config::{AgentConfig, BackboneKind, FrameMode, PRETRAINED_RESOLUTION};
use super::lora::ProjectionFactory;
use super::resnet::ResNet18;
use super::vit::VisionTransformer;
use crate::{FpsError, Result};
use std::path::Path;
use tch::{nn, nn::Module, Device, Kind, Tensor};

/// Feature extractor from raw pixel observations.
///
/// One implementation per [`BackboneKind`], chosen once at construction.
pub trait Backbone: Send {
    /// Parameter-free input transform (optional nearest resize to 224x224)
    fn adapt(&self, observations: &Tensor) -> Tensor;

    /// Features `[B, feature_dim]` from an adapted batch
    fn extract(&self, adapted: &Tensor, train: bool) -> Tensor;

    /// Width of the feature vector, fixed at construction
    fn feature_dim(&self) -> i64;
}

/// Splits stacked observations into what the backbone consumes.
pub(crate) struct FrameInput {
    mode: FrameMode,
    frames: i64,
    resize: bool,
    adapter: Option<nn::Conv2D>,
}

impl FrameInput {
    /// `project_channels` adds the learned 1x1 projection to RGB used by
    /// backbones that only accept three channels in conv-adapter mode.
    pub fn new(path: &nn::Path, config: &AgentConfig, project_channels: bool) -> Self {
        let adapter = (config.frame_mode == FrameMode::ConvAdapter && project_channels).then(|| {
            nn::conv2d(path / "adapter", config.obs_shape[0], 3, 1, Default::default())
        });
        Self {
            mode: config.frame_mode,
            frames: config.frames,
            resize: config.pretrained_resize,
            adapter,
        }
    }

    /// Channels of each view handed to the network
    pub fn view_channels(config: &AgentConfig) -> i64 {
        match config.frame_mode {
            FrameMode::ConvAdapter if config.backbone == BackboneKind::Cnn => config.obs_shape[0],
            FrameMode::MultiFrameAvg | FrameMode::MultiFramePatchConcat => {
                config.obs_shape[0] / config.frames
            }
            _ => 3,
        }
    }

    pub fn adapt(&self, observations: &Tensor) -> Tensor {
        let observations = observations.to_kind(Kind::Float);
        if self.resize {
            observations.upsample_nearest2d(
                [PRETRAINED_RESOLUTION, PRETRAINED_RESOLUTION],
                None,
                None,
            )
        } else {
            observations
        }
    }

    /// Scaled views of an adapted batch: one for single-view modes, one per
    /// frame (oldest first) for multi-frame modes.
    pub fn views(&self, x: &Tensor) -> Vec<Tensor> {
        let x = x.to_kind(Kind::Float);
        match self.mode {
            FrameMode::SingleFrame => {
                let channels = x.size()[1];
                vec![x.narrow(1, channels - 3, 3) / 255.0]
            }
            FrameMode::ConvAdapter => match &self.adapter {
                Some(adapter) => vec![adapter.forward(&x) / 255.0],
                None => vec![x / 255.0],
            },
            FrameMode::MultiFrameAvg | FrameMode::MultiFramePatchConcat => {
                let [b, c, h, w] = size4(&x);
                let frames = x.view([b, self.frames, c / self.frames, h, w]);
                (0..self.frames)
                    .map(|i| frames.select(1, i) / 255.0)
                    .collect()
            }
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }
}

pub(crate) fn size4(x: &Tensor) -> [i64; 4] {
    let s = x.size();
    [s[0], s[1], s[2], s[3]]
}

/// Mean of per-view features
pub(crate) fn average(mut features: Vec<Tensor>) -> Tensor {
    if features.len() == 1 {
        return features.remove(0);
    }
    Tensor::stack(&features, 0).mean_dim(0, false, Kind::Float)
}

/// Measure the feature width with a forward pass on a zero observation.
pub(crate) fn probe_feature_dim(backbone: &dyn Backbone, config: &AgentConfig, device: Device) -> i64 {
    let [c, h, w] = config.obs_shape;
    tch::no_grad(|| {
        let zeros = Tensor::zeros([1, c, h, w], (Kind::Float, device));
        backbone.extract(&backbone.adapt(&zeros), false).size()[1]
    })
}

/// Build the backbone selected by `config` under `path`.
pub(crate) fn build_backbone(
    path: &nn::Path,
    config: &AgentConfig,
    factory: &mut ProjectionFactory,
) -> Result<Box<dyn Backbone>> {
    let backbone: Box<dyn Backbone> = match config.backbone {
        BackboneKind::Cnn => Box::new(NatureCnn::new(path, config)),
        BackboneKind::Resnet18 | BackboneKind::Resnet18Pretrained => {
            Box::new(ResNet18::new(path, config))
        }
        BackboneKind::Vit | BackboneKind::VitPretrained => {
            Box::new(VisionTransformer::new(path, config, factory))
        }
    };
    Ok(backbone)
}

/// Copy matching tensors from a libtorch weight file into the variables
/// under `prefix`. Returns the number of tensors loaded.
pub(crate) fn load_pretrained(vs: &nn::VarStore, prefix: &str, weights: &Path) -> Result<usize> {
    let named = Tensor::load_multi(weights)?;
    let variables = vs.variables();
    let mut loaded = 0;

    tch::no_grad(|| -> Result<()> {
        for (name, src) in &named {
            let key = format!("{prefix}{name}");
            let Some(var) = variables.get(&key) else {
                tracing::debug!(tensor = %name, "Skipping pretrained tensor without a matching variable");
                continue;
            };
            if var.size() != src.size() {
                return Err(FpsError::ShapeMismatch {
                    expected: var.size().iter().map(|&d| d as usize).collect(),
                    actual: src.size().iter().map(|&d| d as usize).collect(),
                });
            }
            let mut var = var.shallow_clone();
            var.f_copy_(&src.to_device(var.device()))?;
            loaded += 1;
        }
        Ok(())
    })?;

    if loaded == 0 {
        return Err(FpsError::Config(format!(
            "no tensor in {} matches the backbone variables",
            weights.display()
        )));
    }
    tracing::info!(path = %weights.display(), loaded, total = named.len(), "Loaded pretrained backbone weights");
    Ok(loaded)
}
