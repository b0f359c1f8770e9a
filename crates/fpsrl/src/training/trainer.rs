//! Main PPO trainer.
//!
//! Phases strictly alternate: collect, estimate advantages, optimize, and
//! (every `eval_interval` updates or at a task boundary) evaluate. Tasks are
//! trained in order for `updates_per_task` updates each.

use super::buffer::RolloutBuffer;
use super::config::TrainerConfig;
use super::context::TrainContext;
use super::episode::EpisodeSummary;
use super::eval::{evaluate, EvalConfig, EvalReport, SUCCESS_SCALE};
use super::hooks::TrainingHook;
use super::optimizer::PpoOptimizer;
use super::ppo::{compute_gae, compute_nstep_returns};
use super::rollout::RolloutCollector;
use super::scores::{ScoreMatrix, PAPER_SCALE};
use super::update::{ppo_update, UpdateStats};
use crate::policy::Agent;
use crate::vector::AsyncEnvPool;
use crate::{FpsError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// A named task: a training pool and a held-out evaluation pool
pub struct Task {
    pub name: String,
    pub train: Box<dyn AsyncEnvPool>,
    pub eval: Box<dyn AsyncEnvPool>,
}

impl Task {
    pub fn new(name: impl Into<String>, train: Box<dyn AsyncEnvPool>, eval: Box<dyn AsyncEnvPool>) -> Self {
        Self {
            name: name.into(),
            train,
            eval,
        }
    }
}

/// What a finished run produced
pub struct TrainSummary {
    pub updates: usize,
    pub global_step: u64,
    /// Stopped by the stop flag before all updates ran
    pub interrupted: bool,
    /// Final evaluation per task, in task order
    pub final_eval: Vec<(String, EvalReport)>,
    pub scores: ScoreMatrix,
    /// `(weights, metadata)` of the saved agent
    pub saved: (PathBuf, PathBuf),
}

/// Main trainer for the PPO algorithm
pub struct Trainer {
    config: TrainerConfig,
    agent: Agent,
    optimizer: PpoOptimizer,
    tasks: Vec<Task>,
    current: usize,
    buffer: RolloutBuffer,
    collector: RolloutCollector,
    hooks: Vec<Box<dyn TrainingHook>>,
    scores: ScoreMatrix,
    ctx: TrainContext,
    progress: Option<ProgressBar>,
    updates_done: usize,
    last_stats: Option<UpdateStats>,
}

impl Trainer {
    /// Create a trainer over `tasks`, checking that every pool matches the
    /// configuration and the agent.
    pub fn new(config: TrainerConfig, mut agent: Agent, tasks: Vec<Task>, ctx: TrainContext) -> Result<Self> {
        config.validate()?;
        if tasks.is_empty() {
            return Err(FpsError::Config("at least one task is required".into()));
        }
        let obs_shape = agent.config().obs_shape;
        let num_actions = agent.config().num_actions;
        for task in &tasks {
            for (role, pool) in [("train", &task.train), ("eval", &task.eval)] {
                if role == "train" && pool.num_envs() != config.num_envs {
                    return Err(FpsError::Config(format!(
                        "task {} {role} pool has {} environments, expected {}",
                        task.name,
                        pool.num_envs(),
                        config.num_envs
                    )));
                }
                let shape = pool.observation_space().image_shape()?;
                let actions = pool.action_space().num_actions()? as i64;
                if shape != obs_shape || actions != num_actions {
                    return Err(FpsError::Config(format!(
                        "task {} {role} pool has observations {shape:?} and {actions} actions, agent expects {obs_shape:?} and {num_actions}",
                        task.name
                    )));
                }
            }
        }

        let optimizer = PpoOptimizer::new(&mut agent, config.learning_rate)?;
        let buffer = RolloutBuffer::new(config.num_steps, config.num_envs, obs_shape, ctx.device);
        let scores = ScoreMatrix::new(tasks.iter().map(|t| t.name.clone()).collect());
        let num_updates = config.num_updates(tasks.len());

        let progress = config.progress.then(|| {
            let pb = ProgressBar::new(num_updates as u64);
            let style = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            pb
        });

        Ok(Self {
            collector: RolloutCollector::new(config.num_envs),
            config,
            agent,
            optimizer,
            tasks,
            current: 0,
            buffer,
            hooks: Vec::new(),
            scores,
            ctx,
            progress,
            updates_done: 0,
            last_stats: None,
        })
    }

    pub fn with_hook(mut self, hook: Box<dyn TrainingHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Flag that ends training after the current update
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.ctx.stop_flag()
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn into_agent(self) -> Agent {
        self.agent
    }

    pub fn global_step(&self) -> u64 {
        self.ctx.global_step
    }

    pub fn current_task(&self) -> &str {
        &self.tasks[self.current].name
    }

    pub fn last_stats(&self) -> Option<&UpdateStats> {
        self.last_stats.as_ref()
    }

    /// Run every update, evaluate, close the pools and save the agent.
    ///
    /// The agent is saved only when the run completes (or is stopped through
    /// the stop flag); any error returns before anything is written.
    pub fn train(&mut self) -> Result<TrainSummary> {
        let num_updates = self.config.num_updates(self.tasks.len());
        self.log_hyperparameters();
        tracing::info!(
            tasks = self.tasks.len(),
            num_updates,
            batch_size = self.config.batch_size(),
            device = ?self.ctx.device,
            "Starting training"
        );

        self.tasks[self.current].train.reset_async(Some(self.config.seed))?;
        self.collector.clear();

        let mut interrupted = false;
        for update in 0..num_updates {
            if self.ctx.stop_requested() {
                tracing::warn!(update, "Stop requested, finishing early");
                interrupted = true;
                break;
            }

            if update > 0 && update % self.config.updates_per_task == 0 {
                self.evaluate_all(true, true)?;
                self.switch_task(update / self.config.updates_per_task)?;
            } else if update > 0 && update % self.config.eval_interval == 0 {
                self.evaluate_all(false, false)?;
            }

            if self.config.anneal_lr {
                self.optimizer.anneal(update, num_updates);
            }
            self.train_update()?;
            self.updates_done = update + 1;

            if let Some(pb) = &self.progress {
                pb.set_position(self.updates_done as u64);
                if let Some(stats) = &self.last_stats {
                    pb.set_message(format!(
                        "{} Loss: {:.4} KL: {:.4} SPS: {:.0}",
                        self.tasks[self.current].name,
                        stats.policy_loss + stats.value_loss,
                        stats.approx_kl,
                        self.ctx.sps()
                    ));
                }
            }
        }

        if let Some(pb) = &self.progress {
            pb.finish_with_message("Training complete");
        }

        let final_eval = self.evaluate_all(true, true)?;
        self.log_scores();
        for task in &mut self.tasks {
            task.train.close();
            task.eval.close();
        }
        self.ctx.close_logger();

        let stem = PathBuf::from(&self.config.data_dir).join(&self.config.exp_name);
        let saved = self.agent.save(&stem)?;

        Ok(TrainSummary {
            updates: self.updates_done,
            global_step: self.ctx.global_step,
            interrupted,
            final_eval,
            scores: self.scores.clone(),
            saved,
        })
    }

    /// Collect one rollout, estimate advantages and optimize.
    fn train_update(&mut self) -> Result<()> {
        let rollout = self.collector.collect(
            &self.agent,
            self.tasks[self.current].train.as_mut(),
            &mut self.buffer,
            &mut self.ctx,
        )?;

        let advantages = tch::no_grad(|| {
            let b = &self.buffer;
            if self.config.gae {
                compute_gae(&b.rewards, &b.values, &b.dones, &rollout.next_value, self.config.gamma, self.config.gae_lambda)
            } else {
                compute_nstep_returns(&b.rewards, &b.values, &b.dones, &rollout.next_value, self.config.gamma)
            }
        });
        let batch = self.buffer.flatten(&advantages);

        let stats = ppo_update(&mut self.agent, &mut self.optimizer, &batch, &self.config, &mut self.hooks)?;

        let mut metrics = stats.metrics();
        metrics.insert("charts/SPS".to_string(), self.ctx.sps());
        let episodes = EpisodeSummary::from_episodes(&rollout.episodes);
        if let (Some(ret), Some(len)) = (episodes.mean_return, episodes.mean_length) {
            metrics.insert("charts/episodic_return".to_string(), ret);
            metrics.insert("charts/episodic_length".to_string(), len);
        }
        self.ctx.log_metrics(&metrics);
        self.last_stats = Some(stats);
        Ok(())
    }

    /// Evaluate on every task's held-out pool. With `matrix`, the mean kills
    /// fill the current row of the score matrix.
    fn evaluate_all(&mut self, matrix: bool, record_frames: bool) -> Result<Vec<(String, EvalReport)>> {
        let eval_config = EvalConfig::from_trainer(&self.config).with_frames(record_frames);
        let mut reports = Vec::with_capacity(self.tasks.len());
        tracing::info!(
            step = self.ctx.global_step,
            elapsed = %crate::utils::format_duration(self.ctx.elapsed_secs()),
            "Evaluating"
        );

        for (j, task) in self.tasks.iter_mut().enumerate() {
            let report = evaluate(&self.agent, task.eval.as_mut(), &eval_config)?;
            let name = &task.name;
            if let Some(len) = report.mean_length {
                self.ctx.log_scalar(&format!("{name}/episode_len"), len);
            }
            if let Some(ret) = report.mean_return {
                self.ctx.log_scalar(&format!("{name}/reward"), ret);
            }
            if let (Some(kills), Some(success)) = (report.mean_kills, report.success) {
                self.ctx.log_scalar(&format!("{name}/kills"), kills);
                self.ctx.log_scalar(&format!("{name}/success"), success);
            }
            if !report.frames.is_empty() {
                self.ctx.log_frames(&format!("{name}/frames"), &report.frames);
            }
            tracing::info!(
                task = %name,
                episodes = report.episodes,
                mean_return = report.mean_return.unwrap_or(f64::NAN),
                mean_length = report.mean_length.unwrap_or(f64::NAN),
                kills = report.mean_kills.unwrap_or(f64::NAN),
                success = report.success.unwrap_or(f64::NAN),
                "Evaluated"
            );
            if matrix {
                self.scores.record(self.current, j, report.mean_kills.unwrap_or(0.0));
            }
            reports.push((name.clone(), report));
        }
        Ok(reports)
    }

    fn switch_task(&mut self, next: usize) -> Result<()> {
        let finished = self.current;
        self.current = next;
        self.tasks[next].train.reset_async(Some(self.config.seed))?;
        self.collector.clear();
        for hook in &mut self.hooks {
            hook.on_task_switch(&self.agent, finished, next);
        }
        tracing::info!(
            from = %self.tasks[finished].name,
            to = %self.tasks[next].name,
            step = self.ctx.global_step,
            "Switched task"
        );
        Ok(())
    }

    fn log_hyperparameters(&self) {
        let mut table = String::from("|param|value|\n|-|-|");
        for (name, value) in self.config.hyperparameters() {
            let _ = write!(table, "\n|{name}|{value}|");
        }
        if let Ok(agent) = serde_json::to_string(self.agent.config()) {
            let _ = write!(table, "\n|agent|{agent}|");
        }
        self.ctx.log_text("hyperparameters", &table);
    }

    fn log_scores(&self) {
        self.ctx.log_text("scores/kills", &self.scores.to_table());
        for (label, scale) in [("paper", PAPER_SCALE), ("tough", SUCCESS_SCALE)] {
            let Some(metrics) = self.scores.metrics(scale) else {
                continue;
            };
            self.ctx.log_scalar(&format!("{label}/average_accuracy"), metrics.average_accuracy);
            self.ctx.log_scalar(
                &format!("{label}/average_incremental_accuracy"),
                metrics.average_incremental_accuracy,
            );
            for (name, value) in [
                ("average_forgetting", metrics.average_forgetting),
                ("forward_transfer", metrics.forward_transfer),
                ("backward_transfer", metrics.backward_transfer),
            ] {
                if let Some(value) = value {
                    self.ctx.log_scalar(&format!("{label}/{name}"), value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::logger::tests::Recorder;
    use crate::policy::AgentConfig;
    use crate::vector::serial::tests::Counter;
    use crate::vector::SerialPool;
    use std::sync::atomic::Ordering;
    use tch::Device;

    fn task(name: &str, envs: usize) -> Task {
        let train = SerialPool::from_fn(envs, envs, |_| Counter::boxed(5)).unwrap().with_shuffle(1);
        let eval = SerialPool::from_fn(2, 2, |_| Counter::boxed(5)).unwrap();
        Task::new(name, Box::new(train), Box::new(eval))
    }

    fn config(dir: &std::path::Path) -> TrainerConfig {
        TrainerConfig::default()
            .with_exp_name("unit")
            .with_data_dir(dir.to_string_lossy())
            .with_rollout(3, 4)
            .with_minibatches(2, 2)
            .with_updates_per_task(2)
            .with_eval(1, 2, 50)
            .with_progress(false)
    }

    fn agent() -> Agent {
        Agent::new(AgentConfig::new([3, 36, 36], 2), Device::Cpu).unwrap()
    }

    #[test]
    fn test_two_task_run_saves_and_fills_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let ctx = TrainContext::new(Device::Cpu, Box::new(recorder.clone()));
        let mut trainer = Trainer::new(config(dir.path()), agent(), vec![task("a", 3), task("b", 3)], ctx).unwrap();

        let summary = trainer.train().unwrap();
        assert_eq!(summary.updates, 4);
        assert!(!summary.interrupted);
        assert!(summary.global_step > 0);
        assert_eq!(summary.final_eval.len(), 2);
        assert!(summary.saved.0.exists() && summary.saved.1.exists());
        assert!(!summary.final_eval[0].1.frames.is_empty());
        // Counter reports 5 kills per episode
        assert_eq!(summary.scores.get(0, 1), Some(5.0));
        assert_eq!(summary.scores.get(1, 0), Some(5.0));

        let names = recorder.names();
        for expected in ["losses/value_loss", "losses/approx_kl", "charts/SPS", "a/success", "b/kills", "tough/average_accuracy"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
        let texts = recorder.texts.lock().unwrap();
        assert!(texts.iter().any(|(tag, _)| tag == "hyperparameters"));
        // Boundary evaluation after "a" and the final one both record clips
        let frames = recorder.frames.lock().unwrap();
        let steps: std::collections::BTreeSet<u64> = frames.iter().map(|&(_, _, step)| step).collect();
        assert_eq!(steps.len(), 2);
        assert_eq!(frames.iter().filter(|(name, _, _)| name == "a/frames").count(), 2);
        assert_eq!(frames.iter().filter(|(name, _, _)| name == "b/frames").count(), 2);

        let loaded = Agent::load(dir.path().join("unit"), Device::Cpu).unwrap();
        assert_eq!(loaded.config(), trainer.agent().config());
    }

    #[test]
    fn test_stop_flag_still_evaluates_and_saves() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(config(dir.path()), agent(), vec![task("a", 3)], TrainContext::silent(Device::Cpu)).unwrap();
        trainer.stop_flag().store(true, Ordering::SeqCst);

        let summary = trainer.train().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.updates, 0);
        assert_eq!(summary.final_eval.len(), 1);
        assert!(summary.saved.0.exists());
    }

    #[test]
    fn test_mismatched_pool_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Trainer::new(config(dir.path()), agent(), vec![task("a", 4)], TrainContext::silent(Device::Cpu));
        assert!(matches!(result, Err(FpsError::Config(_))));

        let wrong_actions = Agent::new(AgentConfig::new([3, 36, 36], 5), Device::Cpu).unwrap();
        let result = Trainer::new(config(dir.path()), wrong_actions, vec![task("a", 3)], TrainContext::silent(Device::Cpu));
        assert!(matches!(result, Err(FpsError::Config(_))));
    }

    struct SwitchRecorder(Arc<std::sync::Mutex<Vec<(usize, usize)>>>);

    impl TrainingHook for SwitchRecorder {
        fn on_task_switch(&mut self, _agent: &Agent, finished: usize, next: usize) {
            self.0.lock().unwrap().push((finished, next));
        }
    }

    #[test]
    fn test_task_switch_notifies_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let switches = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut trainer = Trainer::new(
            config(dir.path()),
            agent(),
            vec![task("a", 3), task("b", 3), task("c", 3)],
            TrainContext::silent(Device::Cpu),
        )
        .unwrap()
        .with_hook(Box::new(SwitchRecorder(Arc::clone(&switches))));

        trainer.train().unwrap();
        assert_eq!(*switches.lock().unwrap(), vec![(0, 1), (1, 2)]);
        assert_eq!(trainer.current_task(), "c");
    }
}
