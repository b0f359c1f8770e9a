//! Agent architecture configuration.

use crate::spaces::DynSpace;
use crate::{FpsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Side length of the canonical input resolution used by pretrained backbones.
pub const PRETRAINED_RESOLUTION: i64 = 224;

/// Vision backbone variants
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackboneKind {
    /// Nature CNN with a LayerNorm/LeakyReLU projection to 256 features
    Cnn,
    /// ResNet-18 trained from scratch
    Resnet18,
    /// ResNet-18 initialised from a libtorch weight file
    Resnet18Pretrained,
    /// Compact vision transformer trained from scratch
    Vit,
    /// Vision transformer initialised from a libtorch weight file
    VitPretrained,
}

impl BackboneKind {
    pub const ALL: [BackboneKind; 5] = [
        BackboneKind::Cnn,
        BackboneKind::Resnet18,
        BackboneKind::Resnet18Pretrained,
        BackboneKind::Vit,
        BackboneKind::VitPretrained,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BackboneKind::Cnn => "cnn",
            BackboneKind::Resnet18 => "resnet18",
            BackboneKind::Resnet18Pretrained => "resnet18-pretrained",
            BackboneKind::Vit => "vit",
            BackboneKind::VitPretrained => "vit-pretrained",
        }
    }

    pub fn is_pretrained(self) -> bool {
        matches!(
            self,
            BackboneKind::Resnet18Pretrained | BackboneKind::VitPretrained
        )
    }

    pub fn is_vit(self) -> bool {
        matches!(self, BackboneKind::Vit | BackboneKind::VitPretrained)
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackboneKind {
    type Err = FpsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| FpsError::UnknownBackbone(s.to_string()))
    }
}

/// How stacked observation frames are fed to the backbone
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameMode {
    /// Only the newest RGB frame (last three channels)
    SingleFrame,
    /// All channels; non-CNN backbones project them to RGB with a 1x1 conv
    ConvAdapter,
    /// Backbone applied per frame, features averaged
    MultiFrameAvg,
    /// Per-frame patch tokens concatenated into one sequence (ViT only)
    MultiFramePatchConcat,
}

impl FrameMode {
    pub const ALL: [FrameMode; 4] = [
        FrameMode::SingleFrame,
        FrameMode::ConvAdapter,
        FrameMode::MultiFrameAvg,
        FrameMode::MultiFramePatchConcat,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FrameMode::SingleFrame => "single-frame",
            FrameMode::ConvAdapter => "conv-adapter",
            FrameMode::MultiFrameAvg => "multi-frame-avg",
            FrameMode::MultiFramePatchConcat => "multi-frame-patch-concat",
        }
    }

    pub fn is_multi_frame(self) -> bool {
        matches!(
            self,
            FrameMode::MultiFrameAvg | FrameMode::MultiFramePatchConcat
        )
    }
}

impl fmt::Display for FrameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FrameMode {
    type Err = FpsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| FpsError::UnknownFrameMode(s.to_string()))
    }
}

/// Shape of the actor and critic heads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeadKind {
    /// Direct linear projection from features
    Linear,
    /// Linear(256) -> ReLU -> Linear
    Mlp,
}

impl fmt::Display for HeadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeadKind::Linear => "linear",
            HeadKind::Mlp => "mlp",
        })
    }
}

impl FromStr for HeadKind {
    type Err = FpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(HeadKind::Linear),
            "mlp" => Ok(HeadKind::Mlp),
            other => Err(FpsError::UnknownHead(other.to_string())),
        }
    }
}

/// Low-rank adaptation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub rank: i64,
    pub alpha: f64,
    /// Substrings of module paths that receive adapters
    pub targets: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 16.0,
            targets: vec!["attn".to_string(), "fc".to_string()],
        }
    }
}

impl LoraConfig {
    pub fn matches(&self, module_path: &str) -> bool {
        self.targets.iter().any(|t| module_path.contains(t.as_str()))
    }

    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }
}

/// Full architecture description of an [`Agent`](super::Agent).
///
/// Serialized next to the weights so an agent can be rebuilt exactly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub backbone: BackboneKind,
    pub frame_mode: FrameMode,
    /// Frames stacked in each observation
    pub frames: i64,
    pub head: HeadKind,
    /// Resize inputs to 224x224 (nearest) before the backbone
    pub pretrained_resize: bool,
    /// libtorch weight file for `*-pretrained` backbones
    pub pretrained_weights: Option<PathBuf>,
    pub lora: Option<LoraConfig>,
    /// Observation shape `[C, H, W]`
    pub obs_shape: [i64; 3],
    pub num_actions: i64,
}

impl AgentConfig {
    /// Default architecture for the given observation shape and action count
    pub fn new(obs_shape: [i64; 3], num_actions: i64) -> Self {
        Self {
            backbone: BackboneKind::Cnn,
            frame_mode: FrameMode::SingleFrame,
            frames: 4,
            head: HeadKind::Linear,
            pretrained_resize: false,
            pretrained_weights: None,
            lora: None,
            obs_shape,
            num_actions,
        }
    }

    /// Derive shapes from a pool's spaces
    pub fn from_spaces(observation_space: &DynSpace, action_space: &DynSpace) -> Result<Self> {
        Ok(Self::new(
            observation_space.image_shape()?,
            action_space.num_actions()? as i64,
        ))
    }

    pub fn with_backbone(mut self, backbone: BackboneKind) -> Self {
        self.backbone = backbone;
        self
    }

    pub fn with_frame_mode(mut self, frame_mode: FrameMode) -> Self {
        self.frame_mode = frame_mode;
        self
    }

    pub fn with_head(mut self, head: HeadKind) -> Self {
        self.head = head;
        self
    }

    pub fn with_pretrained_resize(mut self, enabled: bool) -> Self {
        self.pretrained_resize = enabled;
        self
    }

    pub fn with_pretrained_weights(mut self, path: impl Into<PathBuf>) -> Self {
        self.pretrained_weights = Some(path.into());
        self
    }

    pub fn with_lora(mut self, lora: LoraConfig) -> Self {
        self.lora = Some(lora);
        self
    }

    /// Spatial size seen by the backbone
    pub fn input_hw(&self) -> (i64, i64) {
        if self.pretrained_resize {
            (PRETRAINED_RESOLUTION, PRETRAINED_RESOLUTION)
        } else {
            (self.obs_shape[1], self.obs_shape[2])
        }
    }

    /// Check every construction-time contract
    pub fn validate(&self) -> Result<()> {
        let [channels, height, width] = self.obs_shape;
        if channels <= 0 || height <= 0 || width <= 0 {
            return Err(FpsError::Config(format!(
                "observation shape {:?} must be positive",
                self.obs_shape
            )));
        }
        if self.num_actions <= 0 {
            return Err(FpsError::Config("num_actions must be positive".into()));
        }
        if self.frame_mode == FrameMode::SingleFrame && channels < 3 {
            return Err(FpsError::FrameChannels {
                channels,
                frames: 1,
            });
        }
        if self.frame_mode.is_multi_frame()
            && (self.frames <= 0 || channels % self.frames != 0 || channels / self.frames != 3)
        {
            return Err(FpsError::FrameChannels {
                channels,
                frames: self.frames,
            });
        }
        if self.frame_mode == FrameMode::MultiFramePatchConcat && !self.backbone.is_vit() {
            return Err(FpsError::Config(format!(
                "frame mode {} requires a vit backbone, got {}",
                self.frame_mode, self.backbone
            )));
        }
        if let Some(lora) = &self.lora {
            if !self.backbone.is_vit() {
                return Err(FpsError::Config(format!(
                    "low-rank adaptation targets attention layers; backbone {} has none",
                    self.backbone
                )));
            }
            if lora.rank <= 0 || lora.targets.is_empty() {
                return Err(FpsError::Config(
                    "LoRA needs a positive rank and at least one target".into(),
                ));
            }
        }
        if self.backbone == BackboneKind::Cnn {
            let (h, w) = self.input_hw();
            if h < 36 || w < 36 {
                return Err(FpsError::Config(format!(
                    "cnn backbone needs inputs of at least 36x36, got {h}x{w}"
                )));
            }
        }
        if matches!(
            self.backbone,
            BackboneKind::Resnet18 | BackboneKind::Resnet18Pretrained
        ) {
            // Keeps layer4 above 1x1 so batch norm works on single observations.
            let (h, w) = self.input_hw();
            if h < 64 || w < 64 {
                return Err(FpsError::Config(format!(
                    "resnet18 backbone needs inputs of at least 64x64, got {h}x{w}"
                )));
            }
        }
        if self.backbone.is_vit() {
            let (h, w) = self.input_hw();
            let patch = super::vit::PATCH_SIZE;
            if h % patch != 0 || w % patch != 0 {
                return Err(FpsError::Config(format!(
                    "vit backbone needs inputs divisible by {patch}, got {h}x{w}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        for kind in BackboneKind::ALL {
            assert_eq!(kind.name().parse::<BackboneKind>().unwrap(), kind);
        }
        for mode in FrameMode::ALL {
            assert_eq!(mode.to_string().parse::<FrameMode>().unwrap(), mode);
        }
        assert!(matches!(
            "swin".parse::<BackboneKind>(),
            Err(FpsError::UnknownBackbone(_))
        ));
        assert!(matches!(
            "stacked".parse::<FrameMode>(),
            Err(FpsError::UnknownFrameMode(_))
        ));
        assert_eq!("mlp".parse::<HeadKind>().unwrap(), HeadKind::Mlp);
    }

    #[test]
    fn test_multi_frame_channels_must_divide() {
        let config = AgentConfig::new([10, 84, 84], 5)
            .with_backbone(BackboneKind::Resnet18)
            .with_frame_mode(FrameMode::MultiFrameAvg);
        assert!(matches!(
            config.validate(),
            Err(FpsError::FrameChannels { channels: 10, frames: 4 })
        ));

        let ok = AgentConfig::new([12, 84, 84], 5)
            .with_backbone(BackboneKind::Resnet18)
            .with_frame_mode(FrameMode::MultiFrameAvg);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_patch_concat_requires_vit() {
        let config = AgentConfig::new([12, 84, 84], 5)
            .with_backbone(BackboneKind::Cnn)
            .with_frame_mode(FrameMode::MultiFramePatchConcat);
        assert!(matches!(config.validate(), Err(FpsError::Config(_))));
    }

    #[test]
    fn test_lora_requires_vit() {
        let config = AgentConfig::new([12, 84, 84], 5).with_lora(LoraConfig::default());
        assert!(config.validate().is_err());
        let vit = config.with_backbone(BackboneKind::Vit);
        assert!(vit.validate().is_ok());
    }

    #[test]
    fn test_lora_target_matching() {
        let lora = LoraConfig::default();
        assert!(lora.matches("blocks.0.attn.qkv"));
        assert!(lora.matches("blocks.3.mlp.fc2"));
        assert!(!lora.matches("patch_embed.proj"));
        assert_eq!(lora.scaling(), 1.0);
    }

    #[test]
    fn test_serde_names() {
        let config = AgentConfig::new([12, 84, 84], 5).with_backbone(BackboneKind::VitPretrained);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"vit-pretrained\""));
        let back: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
