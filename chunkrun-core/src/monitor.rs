use std::{collections::VecDeque, time::Duration};

use sysinfo::System;

/// One reading of system pressure, all values in percent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceSample {
    pub cpu:    f32,
    pub memory: f32,
    pub swap:   f32,
}

pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceSample;
}

/// Samples the host through `sysinfo`.
pub struct SystemMonitor {
    system: System,
}

impl SystemMonitor {
    #[inline]
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is computed between two refreshes, prime the first one
        system.refresh_cpu_usage();
        system.refresh_memory();
        Self {
            system,
        }
    }
}

impl Default for SystemMonitor {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemMonitor {
    #[inline]
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let percent = |used: u64, total: u64| {
            if total == 0 {
                0.0
            } else {
                (used as f64 / total as f64 * 100.0) as f32
            }
        };

        ResourceSample {
            cpu:    self.system.global_cpu_usage(),
            memory: percent(self.system.used_memory(), self.system.total_memory()),
            swap:   percent(self.system.used_swap(), self.system.total_swap()),
        }
    }
}

/// Fixed reading, for callers that don't want live sampling.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub ResourceSample);

impl ResourceProbe for StaticProbe {
    #[inline]
    fn sample(&mut self) -> ResourceSample {
        self.0
    }
}

const ROLLING_WINDOW: usize = 5;
const SMOOTHING_WINDOW: usize = 3;
const DEBOUNCE: usize = 2;

/// Tracks encode throughput across completions and decides whether adding
/// workers is still paying off.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    samples:       VecDeque<f64>,
    rolling:       VecDeque<f64>,
    last_smoothed: Option<f64>,
    decreases:     usize,
    trend:         i8,
}

impl Default for ThroughputTracker {
    #[inline]
    fn default() -> Self {
        Self {
            samples:       VecDeque::with_capacity(ROLLING_WINDOW),
            rolling:       VecDeque::with_capacity(SMOOTHING_WINDOW),
            last_smoothed: None,
            decreases:     0,
            trend:         1,
        }
    }
}

impl ThroughputTracker {
    /// Records `frames` completed over `elapsed` wall time and returns the
    /// current trend: `1` to keep growing the pool, `-1` to shrink it.
    #[inline]
    pub fn record(&mut self, frames: usize, elapsed: Duration) -> i8 {
        let seconds = elapsed.as_secs_f64();
        if seconds <= 0.0 {
            return self.trend;
        }

        push_bounded(&mut self.samples, frames as f64 / seconds, ROLLING_WINDOW);
        let rolling = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        push_bounded(&mut self.rolling, rolling, SMOOTHING_WINDOW);
        let smoothed = self.rolling.iter().sum::<f64>() / self.rolling.len() as f64;

        if let Some(previous) = self.last_smoothed {
            if smoothed < previous {
                self.decreases += 1;
                if self.decreases >= DEBOUNCE {
                    self.trend = -self.trend;
                    self.decreases = 0;
                }
            } else {
                self.decreases = 0;
            }
        }
        self.last_smoothed = Some(smoothed);

        self.trend
    }

    #[inline]
    pub const fn trend(&self) -> i8 {
        self.trend
    }

    /// Smoothed frames per second, if any sample has been recorded
    #[inline]
    pub const fn fps(&self) -> Option<f64> {
        self.last_smoothed
    }
}

fn push_bounded(window: &mut VecDeque<f64>, value: f64, capacity: usize) {
    if window.len() == capacity {
        window.pop_front();
    }
    window.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn rising_throughput_keeps_trend() {
        let mut tracker = ThroughputTracker::default();
        for fps in [10, 20, 30, 40, 50] {
            assert_eq!(tracker.record(fps, SECOND), 1);
        }
        assert!(tracker.fps().unwrap() > 10.0);
    }

    #[test]
    fn single_dip_is_debounced() {
        let mut tracker = ThroughputTracker::default();
        tracker.record(100, SECOND);
        tracker.record(100, SECOND);
        // one decrease of the smoothed value
        assert_eq!(tracker.record(10, SECOND), 1);
        // recovery resets the debounce counter
        assert_eq!(tracker.record(1000, SECOND), 1);
    }

    #[test]
    fn sustained_drop_flips_trend() {
        let mut tracker = ThroughputTracker::default();
        tracker.record(100, SECOND);
        tracker.record(100, SECOND);
        tracker.record(50, SECOND);
        assert_eq!(tracker.record(10, SECOND), -1);
        assert_eq!(tracker.trend(), -1);
    }

    #[test]
    fn zero_elapsed_is_ignored() {
        let mut tracker = ThroughputTracker::default();
        assert_eq!(tracker.record(100, Duration::ZERO), 1);
        assert_eq!(tracker.fps(), None);
    }

    #[test]
    fn system_monitor_reports_percentages() {
        let sample = SystemMonitor::new().sample();
        assert!((0.0..=100.0).contains(&sample.memory));
        assert!(sample.cpu >= 0.0);
    }
}
