//! Console logging backend.

use super::MetricLogger;
use ndarray::ArrayD;
use std::collections::HashMap;

/// Logger that prints metrics through tracing.
#[derive(Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!("Step {}: {} = {:.4}", step, name, value);
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        tracing::info!("Step {}: {}", step, format_metrics(metrics));
    }

    fn log_text(&self, tag: &str, text: &str, step: u64) {
        tracing::info!("Step {}: {}\n{}", step, tag, text);
    }

    fn log_frames(&self, name: &str, frames: &[ArrayD<f32>], step: u64) {
        tracing::info!("Step {}: {} recorded {} frames", step, name, frames.len());
    }
}

/// `a=1.0000, b=2.0000` sorted by name
fn format_metrics(metrics: &HashMap<String, f64>) -> String {
    let mut sorted: Vec<_> = metrics.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .iter()
        .map(|(key, value)| format!("{key}={value:.4}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_metrics_sorted() {
        let metrics = HashMap::from([("b".to_string(), 2.0), ("a".to_string(), 1.0)]);
        assert_eq!(format_metrics(&metrics), "a=1.0000, b=2.0000");
    }
}
