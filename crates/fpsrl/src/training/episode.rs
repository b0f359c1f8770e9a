//! Per-slot episode accounting.

use crate::env::{EnvInfo, KILLCOUNT_TOTAL};

/// Statistics of one finished episode
#[derive(Clone, Debug, PartialEq)]
pub struct EpisodeStats {
    pub slot: usize,
    pub episode_return: f64,
    /// Delivered observations in the episode, the first one included
    pub length: u64,
    /// Kill counter reported with the final step, if any
    pub kills: Option<f64>,
}

/// Running return and length of every slot.
///
/// A slot's accumulators reset on exactly the result that reports `done`.
#[derive(Clone, Debug)]
pub struct EpisodeTracker {
    returns: Vec<f64>,
    lengths: Vec<u64>,
}

impl EpisodeTracker {
    pub fn new(num_envs: usize) -> Self {
        Self {
            returns: vec![0.0; num_envs],
            lengths: vec![0; num_envs],
        }
    }

    pub fn reset(&mut self) {
        self.returns.fill(0.0);
        self.lengths.fill(0);
    }

    /// Account one delivered result; returns the finished episode on `done`.
    pub fn record(&mut self, slot: usize, reward: f32, done: bool, info: &EnvInfo) -> Option<EpisodeStats> {
        self.returns[slot] += reward as f64;
        self.lengths[slot] += 1;
        if !done {
            return None;
        }
        let stats = EpisodeStats {
            slot,
            episode_return: self.returns[slot],
            length: self.lengths[slot],
            kills: info.get(KILLCOUNT_TOTAL).map(f64::from),
        };
        self.returns[slot] = 0.0;
        self.lengths[slot] = 0;
        Some(stats)
    }

    /// Running `(return, length)` of a slot
    #[cfg(test)]
    pub fn current(&self, slot: usize) -> (f64, u64) {
        (self.returns[slot], self.lengths[slot])
    }
}

/// Means over finished episodes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EpisodeSummary {
    pub episodes: usize,
    pub mean_return: Option<f64>,
    pub mean_length: Option<f64>,
    pub mean_kills: Option<f64>,
}

impl EpisodeSummary {
    pub fn from_episodes(episodes: &[EpisodeStats]) -> Self {
        if episodes.is_empty() {
            return Self::default();
        }
        let n = episodes.len() as f64;
        let sum = |f: fn(&EpisodeStats) -> f64| episodes.iter().map(f).sum::<f64>() / n;
        Self {
            episodes: episodes.len(),
            mean_return: Some(sum(|e| e.episode_return)),
            mean_length: Some(sum(|e| e.length as f64)),
            mean_kills: Some(sum(|e| e.kills.unwrap_or(0.0))),
        }
    }
}
