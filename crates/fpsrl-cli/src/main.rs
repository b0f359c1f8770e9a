//! fpsrl CLI
//!
//! Command-line interface for training and evaluating first-person agents.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use fpsrl::env::Environment;
use fpsrl::log::{CompositeLogger, ConsoleLogger, MetricLogger};
use fpsrl::policy::{Agent, BackboneKind, FrameMode, HeadKind};
use fpsrl::training::{evaluate, EvalConfig, Task, TrainContext, Trainer};
use fpsrl::utils;
use fpsrl::vector::{AsyncEnvPool, SerialPool, ThreadedPool};
use fpsrl_envs::{Arena, Scenario};

mod args;

use args::{Cli, Commands, EnvArgs, EvalArgs, TrainArgs};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train(*args)?,
        Commands::Eval(args) => eval(&args)?,
        Commands::List => list(),
        Commands::Demo { scenario, steps, seed } => demo(&scenario, steps, seed)?,
    }

    Ok(())
}

/// Build a pool of `num_envs` arenas for `scenario`
fn make_pool(scenario: Scenario, env: &EnvArgs, num_envs: usize, seed: u64) -> Result<Box<dyn AsyncEnvPool>> {
    let arena = env.arena(scenario);
    let batch_size = env.pool_batch.unwrap_or(num_envs).min(num_envs);
    let create = |_: usize| Arena::boxed(arena.clone());
    let pool: Box<dyn AsyncEnvPool> = if env.threaded {
        Box::new(ThreadedPool::from_fn(num_envs, batch_size, create)?)
    } else if batch_size < num_envs {
        Box::new(SerialPool::from_fn(num_envs, batch_size, create)?.with_shuffle(seed))
    } else {
        Box::new(SerialPool::from_fn(num_envs, batch_size, create)?)
    };
    Ok(pool)
}

fn train(args: TrainArgs) -> Result<()> {
    let scenarios = args.env.scenarios()?;
    if scenarios.is_empty() {
        bail!("--tasks needs at least one scenario");
    }
    let config = args.trainer_config();
    config.validate()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            tracing::warn!("Interrupted, finishing the current update");
            stop.store(true, Ordering::SeqCst);
        })
        .context("installing the Ctrl-C handler")?;
    }

    tracing::info!(
        exp_name = %config.exp_name,
        tasks = ?args.env.tasks,
        backbone = %args.backbone,
        num_envs = config.num_envs,
        num_steps = config.num_steps,
        "Starting training"
    );

    // Large backbones recurse deeply in libtorch autograd
    std::thread::Builder::new()
        .stack_size(8 * 1024 * 1024)
        .spawn(move || run_training(args, scenarios, stop))?
        .join()
        .map_err(|_| anyhow!("training thread panicked"))?
}

fn run_training(args: TrainArgs, scenarios: Vec<Scenario>, stop: Arc<AtomicBool>) -> Result<()> {
    let config = args.trainer_config();
    utils::set_seed(config.seed);
    utils::set_deterministic(config.deterministic);
    let device = utils::select_device(config.cuda);

    let tasks = scenarios
        .iter()
        .map(|&scenario| {
            Ok(Task::new(
                scenario.name(),
                make_pool(scenario, &args.env, config.num_envs, config.seed)?,
                make_pool(scenario, &args.env, args.env.eval_envs, config.seed)?,
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let obs_shape = tasks[0].train.observation_space().image_shape()?;
    let num_actions = tasks[0].train.action_space().num_actions()? as i64;
    let agent = Agent::new(args.agent_config(obs_shape, num_actions)?, device)?;
    tracing::info!(
        params = %utils::abbreviate(agent.num_parameters().max(0) as u64),
        ?device,
        "Created agent"
    );

    let ctx = TrainContext::new(device, build_logger(&args)).with_stop_flag(stop);
    let mut trainer = Trainer::new(config, agent, tasks, ctx).context("setting up the trainer")?;
    let summary = trainer.train()?;

    tracing::info!(
        updates = summary.updates,
        global_step = summary.global_step,
        interrupted = summary.interrupted,
        weights = %summary.saved.0.display(),
        "Training complete"
    );
    println!("{}", summary.scores.to_table());
    Ok(())
}

fn build_logger(args: &TrainArgs) -> Box<dyn MetricLogger> {
    let mut logger = CompositeLogger::default();
    logger.add(Box::new(ConsoleLogger::new()));
    if args.track {
        #[cfg(feature = "tensorboard")]
        logger.add(Box::new(fpsrl::log::TensorBoardLogger::new(&args.data_dir, &args.exp_name)));
        #[cfg(not(feature = "tensorboard"))]
        tracing::warn!("--track needs the 'tensorboard' feature; metrics go to the console only");
    }
    Box::new(logger)
}

fn eval(args: &EvalArgs) -> Result<()> {
    let scenarios = args.env.scenarios()?;
    let device = utils::select_device(args.cuda);
    let agent = Agent::load(&args.model, device)
        .with_context(|| format!("loading agent from {}", args.model.display()))?;
    tracing::info!(model = %args.model.display(), episodes = args.episodes, "Starting evaluation");

    let config = EvalConfig {
        max_steps: args.max_steps,
        episodes: args.episodes,
        record_frames: false,
        seed: Some(args.seed),
    };

    let mut reports = Vec::with_capacity(scenarios.len());
    for scenario in scenarios {
        let mut pool = make_pool(scenario, &args.env, args.env.eval_envs, args.seed)?;
        let shape = pool.observation_space().image_shape()?;
        if shape != agent.config().obs_shape {
            bail!(
                "scenario {} produces observations {shape:?} but the agent expects {:?}; check --resolution and --frames",
                scenario.name(),
                agent.config().obs_shape
            );
        }
        let report = evaluate(&agent, pool.as_mut(), &config)?;
        pool.close();
        tracing::info!(
            scenario = scenario.name(),
            episodes = report.episodes,
            mean_return = ?report.mean_return,
            mean_kills = ?report.mean_kills,
            success = ?report.success,
            "Evaluation complete"
        );
        reports.push((scenario.name(), report));
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

fn demo(scenario: &str, steps: usize, seed: u64) -> Result<()> {
    let scenario: Scenario = scenario.parse()?;
    tracing::info!(scenario = scenario.name(), steps, "Running demo");

    let mut env = Arena::new(fpsrl_envs::ArenaConfig::scenario(scenario));
    env.reset(Some(seed));
    let mut episodes = 0;

    for step in 0..steps {
        // Sweep right, firing every fourth step
        let action = if step % 4 == 3 { 2 } else { 1 };
        let result = env.step(action);

        if step % 10 == 0 {
            if let Some(render) = env.render() {
                println!("Step {}: {}", step, render);
            }
        }

        if result.done() {
            episodes += 1;
            tracing::info!(step, kills = env.kills(), "Episode ended, resetting");
            env.reset(None);
        }
    }

    println!("Demo finished: {} steps, {} episodes, {} kills in the current episode", steps, episodes, env.kills());
    Ok(())
}

fn list() {
    println!("Available scenarios:");
    println!();
    for scenario in Scenario::ALL {
        let about = match scenario {
            Scenario::Center => "Few slow targets in a lit room",
            Scenario::Night => "Same targets in a dark room",
            Scenario::Crowd => "Many fast targets",
        };
        println!("  {:<10} {}", scenario.name(), about);
    }
    println!();
    println!("Backbones:");
    for backbone in [
        BackboneKind::Cnn,
        BackboneKind::Resnet18,
        BackboneKind::Resnet18Pretrained,
        BackboneKind::Vit,
        BackboneKind::VitPretrained,
    ] {
        println!("  {}", backbone);
    }
    println!();
    println!("Frame modes:");
    for mode in [
        FrameMode::SingleFrame,
        FrameMode::ConvAdapter,
        FrameMode::MultiFrameAvg,
        FrameMode::MultiFramePatchConcat,
    ] {
        println!("  {}", mode);
    }
    println!();
    println!("Heads: {}, {}", HeadKind::Linear, HeadKind::Mlp);
}
