//! State shared by collection, optimization and evaluation.

use crate::log::{MetricLogger, NoOpLogger};
use ndarray::ArrayD;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tch::Device;

/// Explicit training context threaded through every phase.
pub struct TrainContext {
    pub device: Device,
    pub global_step: u64,
    logger: Box<dyn MetricLogger>,
    start: Instant,
    stop: Arc<AtomicBool>,
}

impl TrainContext {
    pub fn new(device: Device, logger: Box<dyn MetricLogger>) -> Self {
        Self {
            device,
            global_step: 0,
            logger,
            start: Instant::now(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context that discards metrics
    pub fn silent(device: Device) -> Self {
        Self::new(device, Box::new(NoOpLogger))
    }

    /// Share an externally owned stop flag (e.g. set by a signal handler).
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Environment steps per second since the context was created
    pub fn sps(&self) -> f64 {
        let elapsed = self.elapsed_secs();
        if elapsed > 0.0 {
            self.global_step as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Log at the current global step
    pub fn log_scalar(&self, name: &str, value: f64) {
        self.logger.log_scalar(name, value, self.global_step);
    }

    pub fn log_metrics(&self, metrics: &HashMap<String, f64>) {
        self.logger.log_metrics(metrics, self.global_step);
    }

    pub fn log_text(&self, tag: &str, text: &str) {
        self.logger.log_text(tag, text, self.global_step);
    }

    pub fn log_frames(&self, name: &str, frames: &[ArrayD<f32>]) {
        self.logger.log_frames(name, frames, self.global_step);
    }

    pub fn close_logger(&self) {
        self.logger.close();
    }
}
