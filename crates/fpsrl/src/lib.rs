//! # fpsrl
//!
//! Proximal Policy Optimization for first-person-shooter agents.
//!
//! ## Overview
//!
//! fpsrl provides:
//! - An `Environment` trait for single pixel-observation games
//! - Asynchronous environment pools (`SerialPool`, `ThreadedPool`) that deliver
//!   results for arbitrary subsets of slots in arbitrary order
//! - Vision backbones (Nature CNN, ResNet-18, a compact ViT) with frame
//!   handling modes and optional low-rank adaptation
//! - A PPO trainer with GAE, clipped objectives, multi-task schedules and a
//!   periodic evaluation harness
//!
//! ## Features
//!
//! - `default` - Training, evaluation and console metrics
//! - `tensorboard` - TensorBoard event-file metric sink
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fpsrl::prelude::*;
//! use fpsrl::training::TrainContext;
//! use fpsrl_envs::{Arena, ArenaConfig};
//!
//! let config = ArenaConfig::default();
//! let train = SerialPool::from_fn(32, 32, |_| Arena::boxed(config.clone()))?;
//! let eval = SerialPool::from_fn(4, 4, |_| Arena::boxed(config.clone()))?;
//! let agent = Agent::new(
//!     AgentConfig::from_spaces(&train.observation_space(), &train.action_space())?,
//!     Device::Cpu,
//! )?;
//! let tasks = vec![Task::new("center", Box::new(train), Box::new(eval))];
//! let mut trainer = Trainer::new(TrainerConfig::default(), agent, tasks, TrainContext::silent(Device::Cpu))?;
//! trainer.train()?;
//! ```

pub mod env;
pub mod log;
pub mod policy;
pub mod spaces;
pub mod training;
pub mod utils;
pub mod vector;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::env::{EnvInfo, Environment, StepResult, KILLCOUNT_TOTAL};
    pub use crate::spaces::*;
    pub use crate::vector::{AsyncEnvPool, PoolBatch, SerialPool, ThreadedPool};

    #[cfg(feature = "tensorboard")]
    pub use crate::log::TensorBoardLogger;
    pub use crate::log::{CompositeLogger, ConsoleLogger, MetricLogger, NoOpLogger};

    pub use crate::policy::{
        ActOutput, Agent, AgentConfig, BackboneKind, FrameMode, HeadKind, LoraConfig,
    };
    pub use crate::training::{
        evaluate, EvalConfig, EvalReport, ScoreMatrix, Task, Trainer, TrainerConfig,
        TrainingHook,
    };
    pub use crate::{FpsError, Result};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum FpsError {
    #[error("Unknown backbone '{0}' (expected one of: cnn, resnet18, resnet18-pretrained, vit, vit-pretrained)")]
    UnknownBackbone(String),

    #[error("Unknown frame mode '{0}' (expected one of: single-frame, conv-adapter, multi-frame-avg, multi-frame-patch-concat)")]
    UnknownFrameMode(String),

    #[error("Unknown head kind '{0}' (expected linear or mlp)")]
    UnknownHead(String),

    #[error("Observation has {channels} channels, which cannot be split into {frames} RGB frames")]
    FrameChannels { channels: i64, frames: i64 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Environment slot {slot} out of range for a pool of {num_envs} environments")]
    SlotOutOfRange { slot: usize, num_envs: usize },

    #[error("Environment slot {0} delivered twice in one batch")]
    DuplicateSlot(usize),

    #[error("Rollout incomplete: {written} of {expected} buffer entries written")]
    IncompleteRollout { written: usize, expected: usize },

    #[error("Environment error: {0}")]
    EnvError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Tensor error: {0}")]
    TensorError(#[from] tch::TchError),

    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FpsError>;
