//! Task-by-task score matrix for continual evaluation.
//!
//! Row `i` holds the mean kills on every task measured right after training
//! on task `i`. Continual-learning metrics are computed on a copy normalized
//! with `clamp((kills - 3.5) / scale, 0, 1)`.

use super::eval::SUCCESS_OFFSET;
use serde::Serialize;
use std::fmt::Write;

/// Normalization used by the published score tables
pub const PAPER_SCALE: f64 = 16.5;

#[derive(Clone, Debug, Serialize)]
pub struct ScoreMatrix {
    tasks: Vec<String>,
    kills: Vec<Vec<f64>>,
}

/// Summary of a normalized score matrix
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ContinualMetrics {
    /// Mean of the final row
    pub average_accuracy: f64,
    /// Mean over rows `i` of the mean of columns `0..=i`
    pub average_incremental_accuracy: f64,
    /// Per task: best score ever minus final score
    pub forgetting: Vec<f64>,
    /// Mean forgetting over all but the last task
    pub average_forgetting: Option<f64>,
    /// Mean score on task `i` just before training on it
    pub forward_transfer: Option<f64>,
    /// Mean change on task `i` from right after training it to the end
    pub backward_transfer: Option<f64>,
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.into_iter().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

impl ScoreMatrix {
    pub fn new(tasks: Vec<String>) -> Self {
        let n = tasks.len();
        Self {
            tasks,
            kills: vec![vec![0.0; n]; n],
        }
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    /// Record `kills` on `evaluated` after training on `trained`.
    pub fn record(&mut self, trained: usize, evaluated: usize, kills: f64) {
        if let Some(cell) = self.kills.get_mut(trained).and_then(|row| row.get_mut(evaluated)) {
            *cell = kills;
        }
    }

    pub fn get(&self, trained: usize, evaluated: usize) -> Option<f64> {
        self.kills.get(trained).and_then(|row| row.get(evaluated)).copied()
    }

    pub fn normalized(&self, scale: f64) -> Vec<Vec<f64>> {
        self.kills
            .iter()
            .map(|row| {
                row.iter()
                    .map(|&k| ((k - SUCCESS_OFFSET) / scale).clamp(0.0, 1.0))
                    .collect()
            })
            .collect()
    }

    /// Continual-learning metrics on the matrix normalized by `scale`.
    /// `None` for an empty matrix.
    pub fn metrics(&self, scale: f64) -> Option<ContinualMetrics> {
        let m = self.normalized(scale);
        let n = m.len();
        let last = m.last()?;

        let forgetting: Vec<f64> = (0..n)
            .map(|j| {
                let best = m.iter().map(|row| row[j]).fold(f64::NEG_INFINITY, f64::max);
                best - last[j]
            })
            .collect();

        Some(ContinualMetrics {
            average_accuracy: mean(last.iter().copied())?,
            average_incremental_accuracy: mean((0..n).filter_map(|i| mean(m[i][..=i].iter().copied())))?,
            average_forgetting: mean(forgetting[..n - 1].iter().copied()),
            forward_transfer: mean((1..n).map(|i| m[i - 1][i])),
            backward_transfer: mean((0..n - 1).map(|i| last[i] - m[i][i])),
            forgetting,
        })
    }

    /// Markdown table of the raw kills
    pub fn to_table(&self) -> String {
        let mut out = String::from("| trained \\ evaluated |");
        for task in &self.tasks {
            let _ = write!(out, " {task} |");
        }
        out.push_str("\n|---|");
        out.push_str(&"---|".repeat(self.tasks.len()));
        for (task, row) in self.tasks.iter().zip(&self.kills) {
            let _ = write!(out, "\n| {task} |");
            for value in row {
                let _ = write!(out, " {value:.2} |");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::eval::SUCCESS_SCALE;

    fn kills_for(score: f64, scale: f64) -> f64 {
        score * scale + SUCCESS_OFFSET
    }

    #[test]
    fn test_metrics_on_known_matrix() {
        let scores = [[0.8, 0.2, 0.1], [0.5, 0.9, 0.3], [0.4, 0.6, 1.0]];
        let mut matrix = ScoreMatrix::new(vec!["a".into(), "b".into(), "c".into()]);
        for (i, row) in scores.iter().enumerate() {
            for (j, &s) in row.iter().enumerate() {
                matrix.record(i, j, kills_for(s, SUCCESS_SCALE));
            }
        }
        let metrics = matrix.metrics(SUCCESS_SCALE).unwrap();
        let eq = |a: f64, b: f64| assert!((a - b).abs() < 1e-9, "{a} != {b}");

        eq(metrics.average_accuracy, (0.4 + 0.6 + 1.0) / 3.0);
        eq(metrics.average_incremental_accuracy, (0.8 + 0.7 + 2.0 / 3.0) / 3.0);
        eq(metrics.forgetting[0], 0.4);
        eq(metrics.forgetting[1], 0.3);
        eq(metrics.forgetting[2], 0.0);
        eq(metrics.average_forgetting.unwrap(), 0.35);
        eq(metrics.forward_transfer.unwrap(), (0.2 + 0.3) / 2.0);
        eq(metrics.backward_transfer.unwrap(), ((0.4 - 0.8) + (0.6 - 0.9)) / 2.0);
    }

    #[test]
    fn test_normalization_clamps() {
        let mut matrix = ScoreMatrix::new(vec!["only".into()]);
        matrix.record(0, 0, 100.0);
        assert_eq!(matrix.normalized(PAPER_SCALE), vec![vec![1.0]]);
        matrix.record(0, 0, 1.0);
        assert_eq!(matrix.normalized(PAPER_SCALE), vec![vec![0.0]]);

        let metrics = matrix.metrics(PAPER_SCALE).unwrap();
        assert_eq!(metrics.average_forgetting, None);
        assert_eq!(metrics.forward_transfer, None);
        assert!(ScoreMatrix::new(Vec::new()).metrics(PAPER_SCALE).is_none());
    }

    #[test]
    fn test_out_of_range_record_is_ignored() {
        let mut matrix = ScoreMatrix::new(vec!["a".into()]);
        matrix.record(3, 0, 5.0);
        assert_eq!(matrix.get(3, 0), None);
        assert_eq!(matrix.get(0, 0), Some(0.0));
    }

    #[test]
    fn test_table() {
        let mut matrix = ScoreMatrix::new(vec!["a".into(), "b".into()]);
        matrix.record(1, 0, 7.25);
        let table = matrix.to_table();
        assert!(table.starts_with("| trained \\ evaluated | a | b |"));
        assert!(table.contains("| b | 7.25 | 0.00 |"));
    }
}
