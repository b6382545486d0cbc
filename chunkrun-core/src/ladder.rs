use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};

use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    cache::ProbeCache,
    chunk::Chunk,
    encoder::Encoder,
    job::{Job, JobContext, JobError, JobOutput},
    metrics::TargetMetric,
    progress::ProgressSink,
    scheduler::{Backend, Scheduler},
    settings::{LadderSettings, TargetQualitySettings},
    target_quality::TargetQuality,
};

/// One probed (resolution, parameter) point of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderCandidate {
    pub chunk_index:  usize,
    pub resolution:   (u32, u32),
    pub parameter:    f64,
    pub metric:       f64,
    /// kbps
    pub bitrate:      f64,
    pub artifact:     PathBuf,
    /// seconds
    pub chunk_length: f64,
    pub frames:       usize,
}

/// One rung of the ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LadderTier {
    pub target:     f64,
    pub resolution: (u32, u32),
    /// Chosen candidate of every chunk, in chunk order
    pub candidates: Vec<LadderCandidate>,
    /// Duration-weighted bitrate of the chosen candidates in kbps
    pub bitrate:    f64,
    /// Mean absolute metric error of the chosen candidates
    pub error:      f64,
}

/// Scores how far a candidate is from a tier target. Lower is better.
pub type DistanceFn = dyn Fn(&LadderCandidate, f64) -> f64 + Sync;

#[inline]
pub fn metric_error(candidate: &LadderCandidate, target: f64) -> f64 {
    (candidate.metric - target).abs()
}

/// Metric error plus penalties for a tiny bitrate and for few bits per
/// frame, so a candidate is not picked only because a near-empty encode
/// happens to score close to the target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedDistance {
    pub bitrate_weight: f64,
    pub frame_weight:   f64,
}

impl Default for WeightedDistance {
    #[inline]
    fn default() -> Self {
        Self {
            bitrate_weight: 100.0,
            frame_weight:   1.0,
        }
    }
}

impl WeightedDistance {
    #[inline]
    pub fn distance(&self, candidate: &LadderCandidate, target: f64) -> f64 {
        metric_error(candidate, target)
            + self.bitrate_weight / candidate.bitrate.max(f64::EPSILON)
            + self.frame_weight / kilobits_per_frame(candidate).max(f64::EPSILON)
    }
}

#[inline]
pub fn kilobits_per_frame(candidate: &LadderCandidate) -> f64 {
    candidate.bitrate * candidate.chunk_length / candidate.frames.max(1) as f64
}

/// Distance strategy for a ladder run.
#[inline]
pub fn distance_for(settings: &LadderSettings) -> Box<DistanceFn> {
    match settings.weighted_distance {
        Some(weighted) => Box::new(move |candidate: &LadderCandidate, target: f64| {
            weighted.distance(candidate, target)
        }),
        None => Box::new(metric_error),
    }
}

/// Picks one resolution and one candidate per chunk for every tier.
///
/// `grid[i]` holds every probed candidate of chunk `i`. Tiers are assembled
/// from the highest quality down; a resolution whose bitrate rises above
/// the previous tier's is penalised by `continuity_weight` times the
/// relative increase.
#[inline]
pub fn build_ladder(
    grid: &[Vec<LadderCandidate>],
    resolutions: &[(u32, u32)],
    tiers: &[f64],
    metric: TargetMetric,
    distance: &DistanceFn,
    continuity_weight: f64,
) -> anyhow::Result<Vec<LadderTier>> {
    ensure!(!grid.is_empty(), "No chunks to build a ladder from");
    ensure!(!resolutions.is_empty(), "No ladder resolutions given");

    let mut tiers = tiers.to_vec();
    tiers.sort_by(|a, b| metric.orient(*b).total_cmp(&metric.orient(*a)));

    let mut ladder = Vec::with_capacity(tiers.len());
    let mut previous_bitrate: Option<f64> = None;

    for target in tiers {
        let mut best: Option<(f64, LadderTier)> = None;

        for &resolution in resolutions {
            let candidates = best_fits(grid, resolution, target, distance)?;
            let error = candidates.iter().map(|candidate| metric_error(candidate, target)).sum::<f64>()
                / candidates.len() as f64;
            let bitrate = weighted_bitrate(&candidates);
            let penalty = previous_bitrate.map_or(0.0, |previous| {
                continuity_weight * ((bitrate - previous) / previous.max(f64::EPSILON)).max(0.0)
            });
            let score = error + penalty;

            debug!(
                "tier {target} at {}x{}: error {error:.3}, {bitrate:.0} kbps, penalty {penalty:.3}",
                resolution.0, resolution.1
            );

            if best.as_ref().is_none_or(|(best_score, _)| score < *best_score) {
                best = Some((score, LadderTier {
                    target,
                    resolution,
                    candidates,
                    bitrate,
                    error,
                }));
            }
        }

        let Some((_, tier)) = best else {
            bail!("No resolution produced a tier for target {target}");
        };
        info!(
            "tier {}: {}x{} at {:.0} kbps",
            tier.target, tier.resolution.0, tier.resolution.1, tier.bitrate
        );
        previous_bitrate = Some(tier.bitrate);
        ladder.push(tier);
    }

    Ok(ladder)
}

fn best_fits(
    grid: &[Vec<LadderCandidate>],
    resolution: (u32, u32),
    target: f64,
    distance: &DistanceFn,
) -> anyhow::Result<Vec<LadderCandidate>> {
    grid.iter()
        .enumerate()
        .map(|(index, candidates)| {
            candidates
                .iter()
                .filter(|candidate| candidate.resolution == resolution)
                .min_by(|a, b| distance(*a, target).total_cmp(&distance(*b, target)))
                .cloned()
                .with_context(|| {
                    format!(
                        "Chunk {index} has no candidates at {}x{}",
                        resolution.0, resolution.1
                    )
                })
        })
        .collect()
}

fn weighted_bitrate(candidates: &[LadderCandidate]) -> f64 {
    let seconds: f64 = candidates.iter().map(|candidate| candidate.chunk_length).sum();
    if seconds <= 0.0 {
        return 0.0;
    }
    candidates
        .iter()
        .map(|candidate| candidate.bitrate * candidate.chunk_length)
        .sum::<f64>()
        / seconds
}

/// Probes every (resolution, parameter) pair of one chunk.
pub struct GridProbeJob {
    pub chunk:       Chunk,
    pub search:      Arc<TargetQuality>,
    pub resolutions: Vec<(u32, u32)>,
    pub parameters:  Vec<f64>,
}

impl JobOutput for Vec<LadderCandidate> {
    #[inline]
    fn encoded_bytes(&self) -> Option<u64> {
        None
    }
}

impl Job for GridProbeJob {
    type Output = Vec<LadderCandidate>;

    #[inline]
    fn index(&self) -> usize {
        self.chunk.index
    }

    #[inline]
    fn name(&self) -> String {
        self.chunk.name()
    }

    #[inline]
    fn frames(&self) -> usize {
        self.chunk.frames()
    }

    #[inline]
    fn length(&self) -> f64 {
        self.chunk.length()
    }

    #[inline]
    fn run(&mut self, context: &JobContext<'_>) -> Result<Vec<LadderCandidate>, JobError> {
        let points = self.resolutions.len() * self.parameters.len();
        let mut candidates = Vec::with_capacity(points);
        for &resolution in &self.resolutions {
            for &parameter in &self.parameters {
                let probe = self.search.probe(&self.chunk, parameter, Some(resolution))?;
                candidates.push(LadderCandidate {
                    chunk_index: self.chunk.index,
                    resolution,
                    parameter,
                    metric: probe.score + self.search.encoder.probe_bias(self.search.settings.metric),
                    bitrate: probe.bitrate,
                    artifact: probe.artifact,
                    chunk_length: self.chunk.length(),
                    frames: self.chunk.frames(),
                });
                context.report_frames(self.chunk.frames() * candidates.len() / points);
            }
        }
        Ok(candidates)
    }
}

impl LadderSettings {
    /// Probe configuration used for the candidate grid
    #[inline]
    pub fn probe_settings(&self) -> TargetQualitySettings {
        TargetQualitySettings {
            metric: self.metric,
            parameter: self.parameter,
            probing_statistic: self.probing_statistic,
            temp: self.temp.clone(),
            ..TargetQualitySettings::default()
        }
    }
}

/// Probes the candidate grid of every chunk through the scheduler. Results
/// already in `cache` are not probed again.
#[inline]
pub fn probe_candidate_grid(
    chunks: &[Chunk],
    settings: &LadderSettings,
    encoder: Arc<dyn Encoder>,
    cache: Arc<ProbeCache>,
    scheduler: &Scheduler,
    sink: &dyn ProgressSink,
    cancelled: &AtomicBool,
) -> anyhow::Result<Vec<Vec<LadderCandidate>>> {
    settings.validate()?;
    let search = Arc::new(TargetQuality::new(settings.probe_settings(), encoder, cache)?);
    let jobs = chunks
        .iter()
        .map(|chunk| GridProbeJob {
            chunk:       chunk.clone(),
            search:      Arc::clone(&search),
            resolutions: settings.resolutions.clone(),
            parameters:  settings.parameters.clone(),
        })
        .collect();

    let report = scheduler.execute(jobs, &Backend::Local, sink, cancelled)?;
    let mut outputs = report.into_outputs()?;
    outputs.sort_by_key(|(job, _)| job.index());
    Ok(outputs.into_iter().map(|(_, candidates)| candidates).collect())
}
