//! Agent architecture.
//!
//! - `Backbone` - feature extraction from stacked pixel frames (CNN,
//!   ResNet-18, ViT) with the frame handling modes
//! - `lora` - low-rank adaptation as an explicit construction transform
//! - `PolicyValueHead` / `Categorical` - actor-critic heads
//! - `Agent` - the composition used for acting, evaluation and training

mod agent;
mod backbone;
mod cnn;
mod config;
mod distribution;
mod head;
pub mod lora;
mod resnet;
mod vit;

pub use agent::{ActOutput, Agent};
pub use backbone::Backbone;
pub use cnn::NatureCnn;
pub use config::{AgentConfig, BackboneKind, FrameMode, HeadKind, LoraConfig, PRETRAINED_RESOLUTION};
pub use distribution::Categorical;
pub use head::PolicyValueHead;
pub use lora::LoraReport;
pub use resnet::ResNet18;
pub use vit::VisionTransformer;

use tch::nn;

/// Trait for models that own a VarStore for optimization
pub trait HasVarStore {
    /// Get mutable reference to the VarStore
    fn var_store_mut(&mut self) -> &mut nn::VarStore;

    /// Get reference to the VarStore
    fn var_store(&self) -> &nn::VarStore;
}
