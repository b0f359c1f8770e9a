//! Command-line arguments.

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use fpsrl::policy::{AgentConfig, BackboneKind, FrameMode, HeadKind, LoraConfig};
use fpsrl::training::TrainerConfig;
use fpsrl_envs::{ArenaConfig, Scenario};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fpsrl")]
#[command(version, about = "fpsrl - PPO for first-person shooter agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train an agent on a sequence of arena scenarios
    Train(Box<TrainArgs>),

    /// Evaluate a saved agent on every scenario
    Eval(EvalArgs),

    /// List scenarios, backbones, frame modes and heads
    List,

    /// Demo: run a scenario with a scripted policy
    Demo {
        /// Scenario name
        #[arg(default_value = "center")]
        scenario: String,

        /// Number of steps
        #[arg(long, default_value = "100")]
        steps: usize,

        #[arg(long, default_value = "9")]
        seed: u64,
    },
}

/// Environment construction shared by `train` and `eval`
#[derive(Args, Clone, Debug)]
pub struct EnvArgs {
    /// Scenarios trained (and evaluated) in order
    #[arg(long, value_delimiter = ',', default_value = "center")]
    pub tasks: Vec<String>,

    /// Square frame size in pixels
    #[arg(long, default_value = "64")]
    pub resolution: usize,

    /// Stacked RGB frames per observation
    #[arg(long, default_value = "4")]
    pub frames: usize,

    /// Step environments on worker threads instead of in-process
    #[arg(long)]
    pub threaded: bool,

    /// Slots delivered per poll (defaults to every slot)
    #[arg(long)]
    pub pool_batch: Option<usize>,

    /// Environments in each evaluation pool
    #[arg(long, default_value = "4")]
    pub eval_envs: usize,
}

impl EnvArgs {
    pub fn scenarios(&self) -> Result<Vec<Scenario>> {
        self.tasks
            .iter()
            .map(|name| name.parse::<Scenario>().with_context(|| format!("parsing --tasks entry '{name}'")))
            .collect()
    }

    pub fn arena(&self, scenario: Scenario) -> ArenaConfig {
        ArenaConfig::scenario(scenario)
            .with_resolution(self.resolution, self.resolution)
            .with_frames(self.frames)
    }
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(long, default_value = "ppo_vanilla")]
    pub exp_name: String,

    #[arg(long, default_value = "2.5e-5")]
    pub learning_rate: f64,

    #[arg(long, default_value = "9")]
    pub seed: u64,

    #[arg(long, default_value = "500")]
    pub updates_per_task: usize,

    /// Disable cuDNN benchmarking for reproducible kernels
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub deterministic: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub cuda: bool,

    /// Write TensorBoard event files (needs the `tensorboard` feature)
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub track: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub progress: bool,

    /// Directory for saved agents and event files
    #[arg(long, default_value = "models")]
    pub data_dir: String,

    #[command(flatten)]
    pub env: EnvArgs,

    /// cnn, resnet18, resnet18-pretrained, vit or vit-pretrained
    #[arg(long, default_value = "cnn")]
    pub backbone: String,

    /// libtorch weights for the pretrained backbones
    #[arg(long)]
    pub pretrained_weights: Option<PathBuf>,

    /// linear or mlp
    #[arg(long, default_value = "linear")]
    pub head: String,

    /// Resize observations to 224x224 before the backbone
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub pretrained_resize: bool,

    /// single-frame, conv-adapter, multi-frame-avg or multi-frame-patch-concat
    #[arg(long, default_value = "single-frame")]
    pub frame_mode: String,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub lora: bool,

    #[arg(long, default_value = "16")]
    pub lora_rank: i64,

    #[arg(long, default_value = "16")]
    pub lora_alpha: f64,

    #[arg(long, default_value = "32")]
    pub num_envs: usize,

    #[arg(long, default_value = "128")]
    pub num_steps: usize,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub anneal_lr: bool,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub gae: bool,

    #[arg(long, default_value = "0.99")]
    pub gamma: f64,

    #[arg(long, default_value = "0.95")]
    pub gae_lambda: f64,

    #[arg(long, default_value = "32")]
    pub num_minibatches: usize,

    #[arg(long, default_value = "4")]
    pub update_epochs: usize,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub norm_adv: bool,

    #[arg(long, default_value = "0.2")]
    pub clip_coef: f64,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub clip_vloss: bool,

    #[arg(long, default_value = "0.01")]
    pub ent_coef: f64,

    #[arg(long, default_value = "0.5")]
    pub vf_coef: f64,

    #[arg(long, default_value = "0.5")]
    pub max_grad_norm: f64,

    #[arg(long)]
    pub target_kl: Option<f64>,

    #[arg(long, default_value = "20")]
    pub eval_interval: usize,

    #[arg(long, default_value = "10")]
    pub eval_episodes: usize,

    #[arg(long, default_value = "1250")]
    pub eval_max_steps: usize,
}

impl TrainArgs {
    pub fn trainer_config(&self) -> TrainerConfig {
        TrainerConfig {
            exp_name: self.exp_name.clone(),
            data_dir: self.data_dir.clone(),
            seed: self.seed,
            deterministic: self.deterministic,
            cuda: self.cuda,
            track: self.track,
            progress: self.progress,
            num_envs: self.num_envs,
            num_steps: self.num_steps,
            updates_per_task: self.updates_per_task,
            gae: self.gae,
            gamma: self.gamma,
            gae_lambda: self.gae_lambda,
            learning_rate: self.learning_rate,
            anneal_lr: self.anneal_lr,
            num_minibatches: self.num_minibatches,
            update_epochs: self.update_epochs,
            norm_adv: self.norm_adv,
            clip_coef: self.clip_coef,
            clip_vloss: self.clip_vloss,
            ent_coef: self.ent_coef,
            vf_coef: self.vf_coef,
            max_grad_norm: self.max_grad_norm,
            target_kl: self.target_kl,
            eval_interval: self.eval_interval,
            eval_episodes: self.eval_episodes,
            eval_max_steps: self.eval_max_steps,
        }
    }

    pub fn agent_config(&self, obs_shape: [i64; 3], num_actions: i64) -> Result<AgentConfig> {
        let mut config = AgentConfig::new(obs_shape, num_actions)
            .with_backbone(self.backbone.parse::<BackboneKind>()?)
            .with_head(self.head.parse::<HeadKind>()?)
            .with_frame_mode(self.frame_mode.parse::<FrameMode>()?)
            .with_pretrained_resize(self.pretrained_resize);
        config.frames = self.env.frames as i64;
        if let Some(path) = &self.pretrained_weights {
            config = config.with_pretrained_weights(path);
        }
        if self.lora {
            config = config.with_lora(LoraConfig {
                rank: self.lora_rank,
                alpha: self.lora_alpha,
                ..LoraConfig::default()
            });
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Saved agent path without extension (`<data_dir>/<exp_name>`)
    pub model: PathBuf,

    #[command(flatten)]
    pub env: EnvArgs,

    #[arg(long, default_value = "10")]
    pub episodes: usize,

    #[arg(long, default_value = "1250")]
    pub max_steps: usize,

    #[arg(long, default_value = "9")]
    pub seed: u64,

    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    pub cuda: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_train_defaults_match_trainer_config() {
        let cli = Cli::try_parse_from(["fpsrl", "train"]).unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert_eq!(args.trainer_config(), TrainerConfig::default());
    }

    #[test]
    fn test_boolean_toggles_and_task_list() {
        let cli = Cli::try_parse_from([
            "fpsrl", "train", "--gae", "false", "--tasks", "center,crowd", "--target-kl", "0.02",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let config = args.trainer_config();
        assert!(!config.gae);
        assert_eq!(config.target_kl, Some(0.02));
        assert_eq!(args.env.scenarios().unwrap(), vec![Scenario::Center, Scenario::Crowd]);
    }

    #[test]
    fn test_agent_config_from_flags() {
        let cli = Cli::try_parse_from([
            "fpsrl", "train", "--backbone", "vit", "--frame-mode", "multi-frame-avg", "--lora", "true", "--lora-rank", "4",
        ])
        .unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let config = args.agent_config([12, 64, 64], 3).unwrap();
        assert_eq!(config.backbone, BackboneKind::Vit);
        assert_eq!(config.frame_mode, FrameMode::MultiFrameAvg);
        assert_eq!(config.lora.map(|l| l.rank), Some(4));

        let cli = Cli::try_parse_from(["fpsrl", "train", "--backbone", "alexnet"]).unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert!(args.agent_config([12, 64, 64], 3).is_err());
    }
}
