//! Low-rank adaptation of linear projections.
//!
//! Adaptation is decided while the network is built: every projection goes
//! through a [`ProjectionFactory`], which wraps the ones whose module path
//! matches a target with a [`LoraLinear`]. After construction
//! [`freeze_backbone`] turns off gradients for every backbone variable that
//! is not a low-rank factor.

use super::config::LoraConfig;
use serde::Serialize;
use tch::{nn, nn::Module, Tensor};

/// Marker shared by the names of trainable low-rank factors
pub const LORA_MARKER: &str = "lora_";

/// Frozen base projection plus a trainable update `B·A` scaled by `alpha / rank`.
#[derive(Debug)]
pub struct LoraLinear {
    base: nn::Linear,
    lora_a: Tensor,
    lora_b: Tensor,
    scaling: f64,
}

impl LoraLinear {
    pub fn new(path: &nn::Path, in_dim: i64, out_dim: i64, config: &LoraConfig) -> Self {
        let base = nn::linear(path, in_dim, out_dim, Default::default());
        let lora_a = path.var(
            "lora_a",
            &[config.rank, in_dim],
            nn::init::DEFAULT_KAIMING_UNIFORM,
        );
        let lora_b = path.zeros("lora_b", &[out_dim, config.rank]);
        Self {
            base,
            lora_a,
            lora_b,
            scaling: config.scaling(),
        }
    }
}

impl Module for LoraLinear {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let update = xs.matmul(&self.lora_a.tr()).matmul(&self.lora_b.tr());
        self.base.forward(xs) + update * self.scaling
    }
}

/// A linear projection, optionally adapted
#[derive(Debug)]
pub enum Projection {
    Plain(nn::Linear),
    Lora(LoraLinear),
}

impl Module for Projection {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Projection::Plain(linear) => linear.forward(xs),
            Projection::Lora(lora) => lora.forward(xs),
        }
    }
}

/// Builds projections, adapting the ones selected by the LoRA targets
#[derive(Debug, Default)]
pub struct ProjectionFactory {
    lora: Option<LoraConfig>,
    adapted: Vec<String>,
}

impl ProjectionFactory {
    pub fn new(lora: Option<LoraConfig>) -> Self {
        Self {
            lora,
            adapted: Vec::new(),
        }
    }

    /// Build the projection named `module` (a dotted path such as
    /// `blocks.0.attn.qkv`) under `path`.
    pub fn linear(&mut self, path: &nn::Path, module: &str, in_dim: i64, out_dim: i64) -> Projection {
        match &self.lora {
            Some(lora) if lora.matches(module) => {
                self.adapted.push(module.to_string());
                Projection::Lora(LoraLinear::new(path, in_dim, out_dim, lora))
            }
            _ => Projection::Plain(nn::linear(path, in_dim, out_dim, Default::default())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.lora.is_some()
    }

    pub fn adapted(&self) -> &[String] {
        &self.adapted
    }
}

/// Outcome of applying low-rank adaptation
#[derive(Clone, Debug, Serialize)]
pub struct LoraReport {
    /// Module paths that received adapters
    pub adapted: Vec<String>,
    /// Trainable parameters in the whole agent
    pub trainable: i64,
    /// All parameters in the whole agent
    pub total: i64,
}

/// Freeze every variable under `prefix` that is not a low-rank factor.
/// Returns the number of frozen tensors.
pub fn freeze_backbone(vs: &nn::VarStore, prefix: &str) -> usize {
    let mut frozen = 0;
    for (name, var) in vs.variables() {
        if name.starts_with(prefix) && !name.contains(LORA_MARKER) {
            let _ = var.set_requires_grad(false);
            frozen += 1;
        }
    }
    frozen
}

/// Count parameters as (trainable, total)
pub fn count_parameters(vs: &nn::VarStore) -> (i64, i64) {
    vs.variables()
        .values()
        .fold((0, 0), |(trainable, total), var| {
            let n = var.numel() as i64;
            if var.requires_grad() {
                (trainable + n, total + n)
            } else {
                (trainable, total + n)
            }
        })
}
