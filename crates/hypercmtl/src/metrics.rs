//! Scalar metrics collaborators
//!
//! The training loop pushes `(key, value, step)` triples into a
//! [`MetricsSink`] and never reads anything back.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Receiver of scalar training metrics
pub trait MetricsSink {
    /// Record one value of `key` at `step`
    fn record(&mut self, key: &str, value: f64, step: usize);

    /// Flush buffered values
    fn flush(&mut self) {}
}

/// Emits every value as a `debug!` event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, key: &str, value: f64, step: usize) {
        debug!(metric = key, value, step, "metric");
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&mut self, _key: &str, _value: f64, _step: usize) {}
}

/// One recorded value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Step at which the value was recorded
    pub step: usize,
    /// Value
    pub value: f64,
}

/// In-memory series per key, exportable as JSON
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecorder {
    series: BTreeMap<String, Vec<MetricPoint>>,
}

impl MetricsRecorder {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// All points of `key`, oldest first
    pub fn series(&self, key: &str) -> &[MetricPoint] {
        self.series.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recent value of `key`
    pub fn last(&self, key: &str) -> Option<f64> {
        self.series(key).last().map(|p| p.value)
    }

    /// Recorded keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    /// Pretty JSON of every series
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write [`MetricsRecorder::to_json`] to `path`
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl MetricsSink for MetricsRecorder {
    fn record(&mut self, key: &str, value: f64, step: usize) {
        self.series
            .entry(key.to_string())
            .or_default()
            .push(MetricPoint { step, value });
    }
}

impl<S: MetricsSink + ?Sized> MetricsSink for &mut S {
    fn record(&mut self, key: &str, value: f64, step: usize) {
        (**self).record(key, value, step);
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_keeps_series() {
        let mut recorder = MetricsRecorder::new();
        recorder.record("loss", 1.0, 0);
        recorder.record("loss", 0.5, 1);
        recorder.record("acc", 0.9, 1);

        assert_eq!(recorder.series("loss").len(), 2);
        assert_eq!(recorder.last("loss"), Some(0.5));
        assert_eq!(recorder.last("missing"), None);
        assert_eq!(recorder.keys().collect::<Vec<_>>(), vec!["acc", "loss"]);
    }

    #[test]
    fn test_save_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let mut recorder = MetricsRecorder::new();
        recorder.record("train/total_loss", 0.25, 3);
        recorder.save_json(&path).unwrap();

        let loaded: MetricsRecorder = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded, recorder);
    }

    fn push<S: MetricsSink>(mut sink: S) {
        sink.record("x", 1.0, 0);
        sink.flush();
    }

    #[test]
    fn test_sink_through_mut_ref() {
        let mut recorder = MetricsRecorder::new();
        push(&mut recorder);
        push(NullSink);
        push(TracingSink);
        assert_eq!(recorder.last("x"), Some(1.0));
    }
}
