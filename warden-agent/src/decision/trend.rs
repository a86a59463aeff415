//! Trend and anomaly signals over the recent sample window

use crate::config::{DecisionConfig, Resource};
use crate::metrics::MetricSample;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalKind {
    /// Strictly increasing over the window
    Trend { rise: f64 },
    /// Current value is `z` standard deviations away from the window mean
    Anomaly { z: f64 },
}

/// Why the backend is being consulted
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub resource: Resource,
    pub kind: SignalKind,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            SignalKind::Trend { rise } => write!(f, "{} rising steadily (+{rise:.1})", self.resource),
            SignalKind::Anomaly { z } => write!(f, "{} anomalous (z={z:.2})", self.resource),
        }
    }
}

pub fn reading(sample: &MetricSample, resource: Resource) -> Option<f64> {
    match resource {
        Resource::Cpu => sample.cpu_percent.map(f64::from),
        Resource::Memory => sample.memory_percent.map(f64::from),
        Resource::Disk => sample.disk_percent.map(f64::from),
        Resource::Network => sample.network_connection_count.map(f64::from),
    }
}

/// Rise across `values` if it is strictly increasing and rises at least `min_delta`
pub fn rising(values: &[f64], min_delta: f64) -> Option<f64> {
    if values.len() < 2 || !values.windows(2).all(|w| w[1] > w[0]) {
        return None;
    }
    let rise = values[values.len() - 1] - values[0];
    (rise >= min_delta).then_some(rise)
}

/// Population z-score of `current` against `window`; `None` below `min_points`
/// or when the window has no spread
pub fn z_score(window: &[f64], current: f64, min_points: usize) -> Option<f64> {
    if window.len() < min_points.max(2) {
        return None;
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev < f64::EPSILON {
        return None;
    }
    Some((current - mean) / std_dev)
}

/// Bounded history of raw samples
pub struct History {
    samples: VecDeque<MetricSample>,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: MetricSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Readings of one resource, oldest first, skipping samples where it is missing
    pub fn series(&self, resource: Resource) -> Vec<f64> {
        self.samples.iter().filter_map(|s| reading(s, resource)).collect()
    }

    /// First trend (in priority order), then first anomaly, for `current`
    pub fn detect(&self, current: &MetricSample, config: &DecisionConfig) -> Option<Signal> {
        for &resource in &config.priority_order {
            let Some(value) = reading(current, resource) else {
                continue;
            };
            let series = self.series(resource);
            let tail = series.len().saturating_sub(config.trend_window.saturating_sub(1));
            let mut window = series[tail..].to_vec();
            window.push(value);
            if window.len() >= config.trend_window {
                if let Some(rise) = rising(&window, f64::from(config.trend_min_delta)) {
                    return Some(Signal {
                        resource,
                        kind: SignalKind::Trend { rise },
                    });
                }
            }
        }

        for &resource in &config.priority_order {
            if resource == Resource::Network {
                continue;
            }
            let Some(value) = reading(current, resource) else {
                continue;
            };
            let series = self.series(resource);
            let start = series.len().saturating_sub(config.anomaly_window);
            if let Some(z) = z_score(&series[start..], value, config.anomaly_min_points) {
                if z.abs() > f64::from(config.anomaly_std_dev) {
                    return Some(Signal {
                        resource,
                        kind: SignalKind::Anomaly { z },
                    });
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_with;

    #[test]
    fn test_rising_requires_strict_increase_and_delta() {
        assert_eq!(rising(&[10.0, 12.0, 15.0, 20.0], 5.0), Some(10.0));
        assert_eq!(rising(&[10.0, 12.0, 12.0, 20.0], 5.0), None);
        assert_eq!(rising(&[10.0, 11.0, 12.0], 5.0), None);
        assert_eq!(rising(&[10.0], 0.0), None);
    }

    #[test]
    fn test_z_score() {
        let window = [10.0, 12.0, 10.0, 12.0];
        let z = z_score(&window, 16.0, 4).unwrap();
        assert!((z - 5.0).abs() < 1e-9);
        assert!(z_score(&window, 16.0, 10).is_none());
        assert!(z_score(&[5.0; 20], 50.0, 10).is_none());
    }

    #[test]
    fn test_detects_trend_in_priority_order() {
        let config = DecisionConfig::default();
        let mut history = History::new(100);
        for i in 0..4 {
            history.push(sample_with(10.0 + i as f32 * 5.0, 40.0 + i as f32 * 5.0, 50.0));
        }
        let signal = history.detect(&sample_with(30.0, 60.0, 50.0), &config).unwrap();
        // Memory outranks cpu in the default order
        assert_eq!(signal.resource, Resource::Memory);
        assert!(matches!(signal.kind, SignalKind::Trend { .. }));
    }

    #[test]
    fn test_detects_anomaly_after_enough_points() {
        let config = DecisionConfig::default();
        let mut history = History::new(100);
        for i in 0..12 {
            history.push(sample_with(20.0 + (i % 2) as f32, 30.0, 40.0));
        }
        let signal = history.detect(&sample_with(60.0, 30.0, 40.0), &config).unwrap();
        assert_eq!(signal.resource, Resource::Cpu);
        assert!(matches!(signal.kind, SignalKind::Anomaly { z } if z > 2.0));
    }

    #[test]
    fn test_quiet_history_has_no_signal() {
        let config = DecisionConfig::default();
        let mut history = History::new(3);
        for _ in 0..10 {
            history.push(sample_with(20.0, 30.0, 40.0));
        }
        assert_eq!(history.len(), 3);
        assert!(history.detect(&sample_with(20.0, 30.0, 40.0), &config).is_none());
    }
}
