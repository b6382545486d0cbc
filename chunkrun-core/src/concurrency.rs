use std::{num::NonZero, thread::available_parallelism};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::debug;

use crate::monitor::ResourceSample;

const DEFAULT_INITIAL_LIMIT: usize = 2;
const CPU_CEILING: f32 = 95.0;
const MEMORY_CEILING: f32 = 80.0;

/// Where jobs run
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    #[default]
    Local,
    Distributed,
}

/// How the worker limit moves during a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingPolicy {
    /// Constant worker count
    Fixed(usize),
    /// Grow while CPU and memory have headroom
    Auto,
    /// Follow the measured frames per second
    Throughput,
}

#[inline]
pub fn core_count() -> usize {
    available_parallelism().map_or(1, NonZero::get)
}

/// Owns the current worker limit of one scheduling run.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    policy:  ScalingPolicy,
    limit:   usize,
    ceiling: usize,
}

impl ConcurrencyController {
    /// `max_workers` caps the limit in addition to `2 × cores`; with `pinning`
    /// the limit never exceeds the number of cores that can be claimed.
    #[inline]
    pub fn new(
        policy: ScalingPolicy,
        cores: usize,
        max_workers: Option<usize>,
        jobs: usize,
        pinning: bool,
    ) -> Self {
        let cores = cores.max(1);
        let mut ceiling = match policy {
            ScalingPolicy::Fixed(workers) => workers,
            ScalingPolicy::Auto | ScalingPolicy::Throughput => 2 * cores,
        };
        if let Some(max_workers) = max_workers {
            ceiling = ceiling.min(max_workers);
        }
        if pinning {
            ceiling = ceiling.min(cores);
        }
        let ceiling = ceiling.min(jobs).max(1);

        let initial = match policy {
            ScalingPolicy::Fixed(workers) => workers,
            ScalingPolicy::Auto => DEFAULT_INITIAL_LIMIT,
            ScalingPolicy::Throughput => cores / 2,
        };

        Self {
            policy,
            limit: initial.clamp(1, ceiling),
            ceiling,
        }
    }

    #[inline]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub const fn ceiling(&self) -> usize {
        self.ceiling
    }

    #[inline]
    pub const fn policy(&self) -> ScalingPolicy {
        self.policy
    }

    /// Re-evaluates the limit from a resource sample. Only the auto policy
    /// reacts to CPU and memory pressure.
    #[inline]
    pub fn on_resources(&mut self, sample: ResourceSample) -> usize {
        if self.policy == ScalingPolicy::Auto {
            let step = if sample.cpu <= CPU_CEILING && sample.memory <= MEMORY_CEILING {
                1
            } else {
                -1
            };
            self.adjust(step);
        }
        self.limit
    }

    /// Applies a throughput trend (`1` grow, `-1` shrink). Only the throughput
    /// policy reacts to it.
    #[inline]
    pub fn on_trend(&mut self, trend: i8) -> usize {
        if self.policy == ScalingPolicy::Throughput {
            self.adjust(trend.into());
        }
        self.limit
    }

    fn adjust(&mut self, step: isize) {
        let next = self.limit.saturating_add_signed(step).clamp(1, self.ceiling);
        if next != self.limit {
            debug!("worker limit {} -> {next}", self.limit);
            self.limit = next;
        }
    }
}
