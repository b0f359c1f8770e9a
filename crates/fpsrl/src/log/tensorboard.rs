//! TensorBoard logging backend.
//!
//! Event files group every tag under one of three namespaces: `charts/`
//! for throughput and episode curves, `losses/` for PPO update statistics
//! and `eval/` for per-task evaluation and continual-learning scores.

use super::MetricLogger;
use ndarray::ArrayD;
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tensorboard_rs::summary_writer::SummaryWriter;

/// Top-level group a metric is charted under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Namespace {
    Charts,
    Losses,
    Eval,
}

impl Namespace {
    const fn prefix(self) -> &'static str {
        match self {
            Namespace::Charts => "charts",
            Namespace::Losses => "losses",
            Namespace::Eval => "eval",
        }
    }

    /// Training metrics arrive already grouped; anything else is keyed by
    /// task or score label and belongs to evaluation.
    fn of(name: &str) -> Self {
        match name.split_once('/').map(|(head, _)| head) {
            Some("charts") => Namespace::Charts,
            Some("losses") => Namespace::Losses,
            _ => Namespace::Eval,
        }
    }
}

/// Event-file tag for a metric name
fn tag(name: &str) -> Cow<'_, str> {
    match Namespace::of(name) {
        Namespace::Eval if !name.starts_with("eval/") => {
            Cow::Owned(format!("{}/{name}", Namespace::Eval.prefix()))
        }
        _ => Cow::Borrowed(name),
    }
}

/// Logger that writes scalars to TensorBoard event files.
pub struct TensorBoardLogger {
    writer: Mutex<SummaryWriter>,
}

impl TensorBoardLogger {
    /// Event files go to `runs/<run_name>` under `log_dir`.
    pub fn new(log_dir: impl AsRef<Path>, run_name: &str) -> Self {
        let path = log_dir.as_ref().join("runs").join(run_name);
        let writer = SummaryWriter::new(&path);
        tracing::info!(path = %path.display(), "Writing TensorBoard events");
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl MetricLogger for TensorBoardLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        if let Ok(mut writer) = self.writer.lock() {
            writer.add_scalar(&tag(name), value as f32, step as usize);
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        if let Ok(mut writer) = self.writer.lock() {
            for (name, value) in metrics {
                writer.add_scalar(&tag(name), *value as f32, step as usize);
            }
            let _ = writer.flush();
        }
    }

    /// Only the clip length is charted; the frames stay in the eval report.
    fn log_frames(&self, name: &str, frames: &[ArrayD<f32>], step: u64) {
        if let Ok(mut writer) = self.writer.lock() {
            writer.add_scalar(&tag(name), frames.len() as f32, step as usize);
        }
    }

    fn close(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.flush();
        }
    }
}
