//! Metric logger traits and composites.

use ndarray::ArrayD;
use std::collections::HashMap;

/// Trait for logging metrics to various backends.
///
/// Names are `category/name`, e.g. `losses/value_loss` or `arena/success`.
pub trait MetricLogger: Send + Sync {
    /// Log a scalar value (e.g. reward, loss).
    fn log_scalar(&self, name: &str, value: f64, step: u64);

    /// Log a set of metrics collected in a map.
    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        for (name, value) in metrics {
            self.log_scalar(name, *value, step);
        }
    }

    /// Log a block of text such as a hyper-parameter table.
    fn log_text(&self, _tag: &str, _text: &str, _step: u64) {}

    /// Log an evaluation clip of `[3, H, W]` frames.
    fn log_frames(&self, _name: &str, _frames: &[ArrayD<f32>], _step: u64) {}

    /// Close the logger and flush any pending writes.
    fn close(&self) {}
}

/// A logger that does nothing (default).
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &HashMap<String, f64>, _step: u64) {}
}

/// A composite logger that dispatches to multiple backends.
#[derive(Default)]
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricLogger for CompositeLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_scalar(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn log_text(&self, tag: &str, text: &str, step: u64) {
        for logger in &self.loggers {
            logger.log_text(tag, text, step);
        }
    }

    fn log_frames(&self, name: &str, frames: &[ArrayD<f32>], step: u64) {
        for logger in &self.loggers {
            logger.log_frames(name, frames, step);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records everything it is given
    #[derive(Clone, Default)]
    pub(crate) struct Recorder {
        pub scalars: Arc<Mutex<Vec<(String, f64, u64)>>>,
        pub texts: Arc<Mutex<Vec<(String, String)>>>,
        pub frames: Arc<Mutex<Vec<(String, usize, u64)>>>,
    }

    impl Recorder {
        pub fn names(&self) -> Vec<String> {
            self.scalars.lock().unwrap().iter().map(|(n, _, _)| n.clone()).collect()
        }
    }

    impl MetricLogger for Recorder {
        fn log_scalar(&self, name: &str, value: f64, step: u64) {
            self.scalars.lock().unwrap().push((name.to_string(), value, step));
        }

        fn log_text(&self, tag: &str, text: &str, _step: u64) {
            self.texts.lock().unwrap().push((tag.to_string(), text.to_string()));
        }

        fn log_frames(&self, name: &str, frames: &[ArrayD<f32>], step: u64) {
            self.frames.lock().unwrap().push((name.to_string(), frames.len(), step));
        }
    }

    #[test]
    fn test_composite_fans_out() {
        let (a, b) = (Recorder::default(), Recorder::default());
        let mut composite = CompositeLogger::new(vec![Box::new(a.clone())]);
        composite.add(Box::new(b.clone()));
        assert_eq!(composite.len(), 2);

        let metrics = HashMap::from([("losses/a".to_string(), 1.0), ("losses/b".to_string(), 2.0)]);
        composite.log_metrics(&metrics, 7);
        composite.log_text("hyperparameters", "|x|y|", 0);
        composite.log_frames("center/frames", &[ArrayD::zeros(vec![3, 2, 2])], 7);

        for recorder in [a, b] {
            let mut names = recorder.names();
            names.sort();
            assert_eq!(names, ["losses/a", "losses/b"]);
            assert_eq!(recorder.texts.lock().unwrap().len(), 1);
            assert_eq!(*recorder.frames.lock().unwrap(), [("center/frames".to_string(), 1, 7)]);
        }
    }
}
