use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, ensure, Context};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    balance::ChunkOrdering,
    concurrency::{ConcurrencyMode, ScalingPolicy},
    encoder::ParameterKind,
    ladder::WeightedDistance,
    metrics::{ProbingStatistic, TargetMetric},
    scheduler::SchedulerError,
};

/// Worker count meaning "decide automatically"
pub const AUTO_WORKERS: i64 = -1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Fixed worker count, or [`AUTO_WORKERS`]
    pub workers:              i64,
    pub mode:                 ConcurrencyMode,
    pub pin_to_cores:         bool,
    pub throughput_scaling:   bool,
    /// Upper bound for adaptive scaling
    pub max_workers:          Option<usize>,
    pub chunk_order:          ChunkOrdering,
    pub balance_iterations:   usize,
    /// Interval at which the worker limit is re-evaluated between completions
    pub tick_ms:              u64,
    /// Interval between polls of a distributed queue
    pub poll_interval_ms:     u64,
    /// Runs with fewer jobs than this are executed sequentially
    pub sequential_threshold: usize,
    /// Where the resumable snapshot (`done.json`) is written
    pub progress_file:        Option<PathBuf>,
    pub resume:               bool,
}

impl Default for SchedulerSettings {
    #[inline]
    fn default() -> Self {
        Self {
            workers:              AUTO_WORKERS,
            mode:                 ConcurrencyMode::Local,
            pin_to_cores:         false,
            throughput_scaling:   false,
            max_workers:          None,
            chunk_order:          ChunkOrdering::Sequential,
            balance_iterations:   1000,
            tick_ms:              7000,
            poll_interval_ms:     500,
            sequential_threshold: 10,
            progress_file:        None,
            resume:               false,
        }
    }
}

impl SchedulerSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.workers == 0 || self.workers < AUTO_WORKERS {
            return Err(SchedulerError::InvalidConcurrency(format!(
                "worker count must be positive or {AUTO_WORKERS} (auto), got {}",
                self.workers
            )));
        }
        if self.max_workers == Some(0) {
            return Err(SchedulerError::InvalidConcurrency(
                "maximum worker count must be at least 1".to_owned(),
            ));
        }
        if let (Some(workers), Some(max_workers)) = (self.fixed_workers(), self.max_workers) {
            if workers > max_workers {
                return Err(SchedulerError::InvalidConcurrency(format!(
                    "worker count {workers} exceeds the maximum of {max_workers}"
                )));
            }
        }
        if self.tick_ms == 0 || self.poll_interval_ms == 0 {
            return Err(SchedulerError::InvalidConcurrency(
                "tick and poll intervals must be non-zero".to_owned(),
            ));
        }
        if self.resume && self.progress_file.is_none() {
            return Err(SchedulerError::InvalidConcurrency(
                "resuming requires a progress file".to_owned(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn fixed_workers(&self) -> Option<usize> {
        usize::try_from(self.workers).ok().filter(|&workers| workers > 0)
    }

    /// Throughput scaling wins over a fixed count, which then only acts as a
    /// ceiling.
    #[inline]
    pub fn scaling_policy(&self) -> ScalingPolicy {
        match (self.throughput_scaling, self.fixed_workers()) {
            (true, _) => ScalingPolicy::Throughput,
            (false, Some(workers)) => ScalingPolicy::Fixed(workers),
            (false, None) => ScalingPolicy::Auto,
        }
    }

    #[inline]
    pub fn max_workers(&self) -> Option<usize> {
        match (self.throughput_scaling, self.fixed_workers()) {
            (true, Some(workers)) => Some(self.max_workers.map_or(workers, |max| max.min(workers))),
            _ => self.max_workers,
        }
    }

    #[inline]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    #[inline]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetQualitySettings {
    pub metric:            TargetMetric,
    pub target:            f64,
    pub probes:            u32,
    pub parameter:         ParameterKind,
    /// Overrides the encoder's legal parameter range
    pub bounds:            Option<(f64, f64)>,
    pub probing_statistic: ProbingStatistic,
    /// Stop probing once a score lands this close to the target
    pub tolerance:         f64,
    /// Probe artifacts are written below `<temp>/probes`
    pub temp:              PathBuf,
}

impl Default for TargetQualitySettings {
    #[inline]
    fn default() -> Self {
        Self {
            metric:            TargetMetric::VMAF,
            target:            95.0,
            probes:            3,
            parameter:         ParameterKind::Quantizer,
            bounds:            None,
            probing_statistic: ProbingStatistic::default(),
            tolerance:         0.0,
            temp:              PathBuf::from("temp"),
        }
    }
}

impl TargetQualitySettings {
    #[inline]
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(warning) = validate_probes(self.probes)? {
            warn!("{warning}");
        }
        ensure!(self.target.is_finite(), "Target quality must be a finite number");
        ensure!(
            self.tolerance >= 0.0,
            "Target quality tolerance must not be negative"
        );
        if let Some((low, high)) = self.bounds {
            ensure!(
                low < high,
                "Parameter range minimum ({low}) must be below the maximum ({high})"
            );
        }
        Ok(())
    }
}

/// Checks the probe budget, returning a warning for budgets that are legal
/// but rarely worth their cost.
#[inline]
pub fn validate_probes(probes: u32) -> anyhow::Result<Option<String>> {
    match probes {
        1..=3 => Ok(None),
        4..=10 => Ok(Some(format!(
            "{probes} probes requested; more than 3 rarely improves the result and every probe \
             is a full encode"
        ))),
        _ => bail!("Number of probes must be between 1 and 10, got {probes}"),
    }
}

/// Parses `min-max` into a parameter range.
#[inline]
pub fn parse_parameter_range(s: &str) -> anyhow::Result<(f64, f64)> {
    let Some((min, max)) = s.split_once('-') else {
        bail!("Parameter range must be specified as min-max (e.g. 10-50)");
    };
    let min = min.trim().parse::<f64>().with_context(|| format!("Invalid range minimum: {min}"))?;
    let max = max.trim().parse::<f64>().with_context(|| format!("Invalid range maximum: {max}"))?;
    ensure!(min < max, "Min must be < max");
    Ok((min, max))
}

/// Parses `WIDTHxHEIGHT`.
#[inline]
pub fn parse_resolution(s: &str) -> anyhow::Result<(u32, u32)> {
    let Some((width, height)) = s.split_once('x') else {
        bail!("Invalid resolution: {s}. Expected widthxheight");
    };
    Ok((
        width.parse().with_context(|| format!("Invalid resolution width: {s}"))?,
        height.parse().with_context(|| format!("Invalid resolution height: {s}"))?,
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LadderSettings {
    pub metric:            TargetMetric,
    pub resolutions:       Vec<(u32, u32)>,
    /// Target scores, in any order
    pub tiers:             Vec<f64>,
    /// Parameter values probed at every resolution
    pub parameters:        Vec<f64>,
    pub parameter:         ParameterKind,
    pub continuity_weight: f64,
    /// When set, candidates are scored with a bitrate and frame count penalty
    /// instead of plain metric error
    pub weighted_distance: Option<WeightedDistance>,
    pub probing_statistic: ProbingStatistic,
    pub temp:              PathBuf,
}

impl Default for LadderSettings {
    #[inline]
    fn default() -> Self {
        Self {
            metric:            TargetMetric::VMAF,
            resolutions:       vec![(1920, 1080), (1280, 720), (854, 480)],
            tiers:             vec![95.0, 90.0, 85.0],
            parameters:        vec![18.0, 24.0, 30.0, 36.0, 42.0],
            parameter:         ParameterKind::Quantizer,
            continuity_weight: 1.0,
            weighted_distance: None,
            probing_statistic: ProbingStatistic::default(),
            temp:              PathBuf::from("temp"),
        }
    }
}

impl LadderSettings {
    #[inline]
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.resolutions.is_empty(), "Ladder needs at least one resolution");
        ensure!(!self.tiers.is_empty(), "Ladder needs at least one quality tier");
        ensure!(
            !self.parameters.is_empty(),
            "Ladder needs at least one candidate parameter"
        );
        ensure!(
            self.resolutions.iter().all(|&(width, height)| width > 0 && height > 0),
            "Ladder resolutions must be non-zero"
        );
        let duplicates = self.resolutions.iter().duplicates().collect::<Vec<_>>();
        ensure!(
            duplicates.is_empty(),
            "Duplicate ladder resolutions: {duplicates:?}"
        );
        ensure!(
            self.continuity_weight >= 0.0,
            "Continuity weight must not be negative"
        );
        Ok(())
    }
}

/// Everything a run can be configured with, as loaded from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub scheduler:      SchedulerSettings,
    pub target_quality: Option<TargetQualitySettings>,
    pub ladder:         Option<LadderSettings>,
}

impl Settings {
    #[inline]
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {path:?}"))?;
        let settings: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings file {path:?}"))?;
        settings.validate()?;
        Ok(settings)
    }

    #[inline]
    pub fn validate(&self) -> anyhow::Result<()> {
        self.scheduler.validate()?;
        if let Some(target_quality) = &self.target_quality {
            target_quality.validate()?;
        }
        if let Some(ladder) = &self.ladder {
            ladder.validate()?;
        }
        Ok(())
    }
}
