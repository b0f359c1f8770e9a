//! Agent: backbone + policy-value head over one VarStore.

use super::backbone::{build_backbone, load_pretrained, Backbone};
use super::config::AgentConfig;
use super::distribution::Categorical;
use super::head::PolicyValueHead;
use super::lora::{count_parameters, freeze_backbone, LoraReport, ProjectionFactory};
use super::HasVarStore;
use crate::{FpsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tch::{nn, Device, Tensor};

const BACKBONE_PREFIX: &str = "backbone.net.";

/// Output of [`Agent::act`]
#[derive(Debug)]
pub struct ActOutput {
    /// Sampled (or supplied) actions `[B]`
    pub action: Tensor,
    pub log_prob: Tensor,
    pub entropy: Tensor,
    pub value: Tensor,
}

/// Architecture metadata stored next to the weights
#[derive(Debug, Serialize, Deserialize)]
struct AgentSnapshot {
    version: String,
    config: AgentConfig,
}

/// Actor-critic agent over pixel observations.
///
/// Observations are float tensors `[B, C, H, W]` of raw pixels on the agent's
/// device. `act` and `value` run the backbone in training mode; the
/// evaluation harness uses [`Agent::act_eval`].
pub struct Agent {
    vs: nn::VarStore,
    config: AgentConfig,
    backbone: Box<dyn Backbone>,
    head: PolicyValueHead,
    lora: Option<LoraReport>,
}

impl Agent {
    /// Build a fresh agent, loading pretrained backbone weights when the
    /// configured backbone asks for them.
    pub fn new(config: AgentConfig, device: Device) -> Result<Self> {
        if config.backbone.is_pretrained() && config.pretrained_weights.is_none() {
            return Err(FpsError::Config(format!(
                "backbone {} needs a pretrained weight file",
                config.backbone
            )));
        }
        Self::build(config, device, true)
    }

    fn build(config: AgentConfig, device: Device, load_weights: bool) -> Result<Self> {
        config.validate()?;
        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let mut factory = ProjectionFactory::new(config.lora.clone());
        let backbone = build_backbone(&(&root / "backbone"), &config, &mut factory)?;
        let head = PolicyValueHead::new(&root, config.head, backbone.feature_dim(), config.num_actions);

        if load_weights {
            if let Some(weights) = config.pretrained_weights.as_deref() {
                load_pretrained(&vs, BACKBONE_PREFIX, weights)?;
            }
        }

        let lora = factory.is_enabled().then(|| {
            let frozen = freeze_backbone(&vs, BACKBONE_PREFIX);
            let (trainable, total) = count_parameters(&vs);
            tracing::info!(
                adapted = factory.adapted().len(),
                frozen,
                trainable,
                total,
                "Applied low-rank adaptation"
            );
            LoraReport {
                adapted: factory.adapted().to_vec(),
                trainable,
                total,
            }
        });

        tracing::info!(
            backbone = %config.backbone,
            frame_mode = %config.frame_mode,
            head = %config.head,
            feature_dim = backbone.feature_dim(),
            parameters = count_parameters(&vs).1,
            "Built agent"
        );

        Ok(Self {
            vs,
            config,
            backbone,
            head,
            lora,
        })
    }

    /// Action distribution and value for a batch
    pub fn forward(&self, observations: &Tensor, train: bool) -> (Categorical, Tensor) {
        let features = self.features(observations, train);
        let (logits, value) = self.head.forward(&features);
        (Categorical::from_logits(&logits), value)
    }

    fn features(&self, observations: &Tensor, train: bool) -> Tensor {
        let adapted = self.backbone.adapt(observations);
        self.backbone.extract(&adapted, train)
    }

    /// Sample actions, or score `action` under the current parameters.
    pub fn act(&self, observations: &Tensor, action: Option<&Tensor>) -> ActOutput {
        self.act_with_mode(observations, action, true)
    }

    /// Sample actions with the backbone in inference mode
    pub fn act_eval(&self, observations: &Tensor) -> ActOutput {
        self.act_with_mode(observations, None, false)
    }

    fn act_with_mode(&self, observations: &Tensor, action: Option<&Tensor>, train: bool) -> ActOutput {
        let (dist, value) = self.forward(observations, train);
        let action = match action {
            Some(a) => a.shallow_clone(),
            None => dist.sample(),
        };
        ActOutput {
            log_prob: dist.log_prob(&action),
            entropy: dist.entropy(),
            action,
            value,
        }
    }

    /// State-value estimate `[B]`
    pub fn value(&self, observations: &Tensor) -> Tensor {
        self.head.value(&self.features(observations, true))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn lora_report(&self) -> Option<&LoraReport> {
        self.lora.as_ref()
    }

    /// Parameters that receive gradients
    pub fn trainable_variables(&self) -> Vec<Tensor> {
        self.vs
            .trainable_variables()
            .into_iter()
            .filter(|v| v.requires_grad())
            .collect()
    }

    pub fn num_parameters(&self) -> i64 {
        count_parameters(&self.vs).1
    }

    /// Write `<stem>.ot` (weights) and `<stem>.json` (architecture).
    pub fn save(&self, stem: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
        let (weights, meta) = snapshot_paths(stem.as_ref());
        if let Some(dir) = weights.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        self.vs.save(&weights)?;
        let snapshot = AgentSnapshot {
            version: crate::VERSION.to_string(),
            config: self.config.clone(),
        };
        serde_json::to_writer_pretty(std::fs::File::create(&meta)?, &snapshot)?;
        tracing::info!(path = %weights.display(), "Saved agent");
        Ok((weights, meta))
    }

    /// Rebuild an agent written by [`Agent::save`].
    pub fn load(stem: impl AsRef<Path>, device: Device) -> Result<Self> {
        let (weights, meta) = snapshot_paths(stem.as_ref());
        let snapshot: AgentSnapshot = serde_json::from_reader(std::fs::File::open(&meta)?)?;
        if snapshot.version != crate::VERSION {
            tracing::warn!(saved = %snapshot.version, current = crate::VERSION, "Loading agent saved by another version");
        }
        let mut agent = Self::build(snapshot.config, device, false)?;
        agent.vs.load(&weights)?;
        Ok(agent)
    }
}

impl HasVarStore for Agent {
    fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

/// `<stem>.ot` and `<stem>.json`, keeping any dots already in the stem
fn snapshot_paths(stem: &Path) -> (PathBuf, PathBuf) {
    let with_ext = |ext: &str| {
        let mut name = stem.as_os_str().to_owned();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    };
    (with_ext("ot"), with_ext("json"))
}
