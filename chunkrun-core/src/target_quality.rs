use std::{
    cmp::Ordering,
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, ensure, Context};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::{
    cache::{ProbeCache, DECISIONS, PROBES},
    chunk::Chunk,
    encoder::{EncodeParameters, Encoder, ParameterKind, Purpose, Stats},
    interpol::linear_interpolate,
    job::{Job, JobContext, JobError, JobOutput},
    metrics::{ProbingStatistic, TargetMetric},
    settings::TargetQualitySettings,
};

/// Measured outcome of one probe encode. The score is stored as measured,
/// before any bias correction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub parameter: f64,
    pub score:     f64,
    pub bitrate:   f64,
    pub artifact:  PathBuf,
}

/// Cached outcome of a finished search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub parameter: f64,
    /// `(parameter, corrected score)` of every probe the decision used
    pub probes:    Vec<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipProbingReason {
    WithinTolerance,
    ProbeLimitReached,
    RangeExhausted,
}

/// Finds, per chunk, the encoder parameter that hits a target quality score.
pub struct TargetQuality {
    pub settings: TargetQualitySettings,
    pub encoder:  Arc<dyn Encoder>,
    pub cache:    Arc<ProbeCache>,
}

impl TargetQuality {
    #[inline]
    pub fn new(
        settings: TargetQualitySettings,
        encoder: Arc<dyn Encoder>,
        cache: Arc<ProbeCache>,
    ) -> anyhow::Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            encoder,
            cache,
        })
    }

    /// Searches the parameter for `chunk` using the configured target, budget
    /// and bounds.
    #[inline]
    pub fn find(&self, chunk: &Chunk) -> anyhow::Result<f64> {
        self.find_parameter(
            chunk,
            self.settings.target,
            self.settings.probes,
            self.settings.bounds,
        )
    }

    /// Binary search over the integer parameter range followed by a linear
    /// interpolation between the two probes closest to `target`.
    ///
    /// Every probe is a real encode unless its result is already cached. A
    /// failed probe fails the search.
    #[tracing::instrument(level = "debug", skip(self, chunk), fields(chunk = chunk.index))]
    #[inline]
    pub fn find_parameter(
        &self,
        chunk: &Chunk,
        target: f64,
        probe_budget: u32,
        bounds: Option<(f64, f64)>,
    ) -> anyhow::Result<f64> {
        ensure!(probe_budget > 0, "Probe budget must be at least 1");
        let kind = self.settings.parameter;
        let metric = self.settings.metric;
        let legal = bounds.unwrap_or_else(|| self.encoder.legal_parameter_range(kind));
        ensure!(
            legal.0 <= legal.1,
            "Invalid parameter range {}-{}",
            legal.0,
            legal.1
        );

        let decision_key = format!(
            "{name}:{metric}:{statistic}:{kind:?}:{target}:{low}-{high}",
            name = chunk.name(),
            statistic = self.settings.probing_statistic,
            low = legal.0,
            high = legal.1
        );
        if let Some(decision) = self.cache.get::<Decision>(DECISIONS, &decision_key) {
            debug!(
                "chunk {}: using cached decision {}",
                chunk.name(),
                decision.parameter
            );
            return Ok(decision.parameter);
        }

        // Comparisons happen on an axis where larger is always better
        let oriented_target = metric.orient(target);
        let bias = self.encoder.probe_bias(metric);

        let mut low = legal.0.ceil() as u32;
        let mut high = legal.1.floor() as u32;
        ensure!(
            low <= high,
            "Parameter range {}-{} contains no integer",
            legal.0,
            legal.1
        );
        let mut tried: SmallVec<[u32; 10]> = SmallVec::new();
        let mut history: SmallVec<[(ProbeResult, f64); 4]> = SmallVec::new();
        let mut skip = SkipProbingReason::ProbeLimitReached;

        for iteration in 1..=probe_budget {
            let mut next = low.midpoint(high);

            if iteration == probe_budget && matches!(probe_budget, 2 | 3) {
                let nearest_bound = if next - low <= high - next { low } else { high };
                if tried.contains(&nearest_bound) {
                    trace!("bound {nearest_bound} already probed, keeping midpoint {next}");
                } else {
                    next = nearest_bound;
                }
            }

            if tried.contains(&next) {
                trace!("parameter {next} already probed, skipping iteration {iteration}");
                skip = SkipProbingReason::RangeExhausted;
                continue;
            }
            tried.push(next);

            let probe = self.probe(chunk, f64::from(next), None)?;
            let score = probe.score + bias;
            history.push((probe, score));

            if (score - target).abs() <= self.settings.tolerance {
                skip = SkipProbingReason::WithinTolerance;
                break;
            }

            // Move toward lower quality when the score overshoots the target
            let quality_too_high = metric.orient(score) > oriented_target;
            if quality_too_high == kind.quality_increases_with_value() {
                high = next;
            } else {
                low = next;
            }
        }

        let parameter = self.decide(&history, target, legal)?;
        log_probes(
            &history,
            metric,
            target,
            chunk.frames(),
            &chunk.name(),
            parameter,
            skip,
        );

        self.cache.set(DECISIONS, &decision_key, &Decision {
            parameter,
            probes: history.iter().map(|(probe, score)| (probe.parameter, *score)).collect(),
        })?;
        remove_probe_artifacts(history.iter().map(|(probe, _)| probe.artifact.as_path()));

        Ok(parameter)
    }

    fn decide(
        &self,
        history: &[(ProbeResult, f64)],
        target: f64,
        legal: (f64, f64),
    ) -> anyhow::Result<f64> {
        let mut closest: SmallVec<[(f64, f64); 4]> =
            history.iter().map(|(probe, score)| (probe.parameter, *score)).collect();
        closest.sort_by(|(_, a), (_, b)| {
            (a - target).abs().partial_cmp(&(b - target).abs()).unwrap_or(Ordering::Equal)
        });

        let parameter = match closest.as_slice() {
            [] => bail!("No probes were taken"),
            [(parameter, _)] => *parameter,
            [(p1, s1), (p2, s2), ..] => {
                linear_interpolate(&[*s1, *s2], &[*p1, *p2], target).unwrap_or_else(|| {
                    trace!("probes {p1} and {p2} scored the same, using the closer one");
                    *p1
                })
            },
        };

        let parameter = if self.encoder.supports_fractional_parameters() {
            parameter
        } else {
            parameter.round()
        };
        Ok(parameter.clamp(legal.0, legal.1))
    }

    /// Runs one probe encode, or returns the cached result of an identical one.
    #[inline]
    pub fn probe(
        &self,
        chunk: &Chunk,
        parameter: f64,
        resolution: Option<(u32, u32)>,
    ) -> anyhow::Result<ProbeResult> {
        let key = probe_key(
            chunk.index,
            self.settings.metric,
            self.settings.probing_statistic,
            parameter,
            resolution,
        );
        if let Some(cached) = self.cache.get::<ProbeResult>(PROBES, &key) {
            trace!("probe cache hit for {key}");
            return Ok(cached);
        }

        let kind = self.settings.parameter;
        let artifact = probe_artifact_path(
            &self.settings.temp,
            chunk,
            parameter,
            resolution,
            self.encoder.output_extension(),
        );
        let parameters =
            EncodeParameters::probe(kind.with_value(parameter), self.settings.metric, artifact)
                .at_resolution(resolution);
        let stats = self
            .encoder
            .encode(chunk, &parameters, &|_| {})
            .with_context(|| format!("Probe of chunk {} at {parameter} failed", chunk.name()))?;

        let probe = ProbeResult {
            parameter,
            score: self.aggregate(&stats, parameter)?,
            bitrate: stats.bitrate,
            artifact: stats.artifact,
        };
        self.cache.set(PROBES, &key, &probe)?;
        Ok(probe)
    }

    fn aggregate(&self, stats: &Stats, parameter: f64) -> anyhow::Result<f64> {
        let Some(scores) = &stats.metric else {
            bail!("Encoder returned no {} scores", self.settings.metric);
        };
        let kind = self.settings.parameter;
        let (low, high) = self.encoder.legal_parameter_range(kind);
        let relative = if high > low {
            let position = (parameter - low) / (high - low);
            if kind.quality_increases_with_value() {
                1.0 - position
            } else {
                position
            }
        } else {
            0.0
        };
        scores.aggregate(self.settings.probing_statistic, self.settings.metric, relative)
    }
}

/// Cache key of one probe. A score is only reusable for the same metric and
/// aggregation.
#[inline]
pub fn probe_key(
    index: usize,
    metric: TargetMetric,
    statistic: ProbingStatistic,
    parameter: f64,
    resolution: Option<(u32, u32)>,
) -> String {
    match resolution {
        Some((width, height)) => {
            format!("{index}:{metric}:{statistic}:{width}x{height}:{parameter}")
        },
        None => format!("{index}:{metric}:{statistic}:{parameter}"),
    }
}

fn probe_artifact_path(
    temp: &Path,
    chunk: &Chunk,
    parameter: f64,
    resolution: Option<(u32, u32)>,
    extension: &str,
) -> PathBuf {
    let name = match resolution {
        Some((width, height)) => {
            format!("v_{}_{width}x{height}_{parameter}.{extension}", chunk.name())
        },
        None => format!("v_{}_{parameter}.{extension}", chunk.name()),
    };
    temp.join("probes").join(name)
}

/// Deletes probe encodes once they are no longer needed.
#[inline]
pub fn remove_probe_artifacts<'a>(artifacts: impl IntoIterator<Item = &'a Path>) {
    for artifact in artifacts {
        match fs::remove_file(artifact) {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => warn!("failed to remove probe {}: {e}", artifact.display()),
        }
    }
}

#[inline]
pub fn log_probes(
    history: &[(ProbeResult, f64)],
    metric: TargetMetric,
    target: f64,
    frames: usize,
    chunk_name: &str,
    parameter: f64,
    skip: SkipProbingReason,
) {
    let mut sorted: Vec<(f64, f64)> =
        history.iter().map(|(probe, score)| (probe.parameter, *score)).collect();
    sorted.sort_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    debug!(
        "chunk {chunk_name}: Target={target}, Metric={metric}, {frames} frames
       TQ-Probes: {sorted:.2?}{suffix}
       Final parameter={parameter:.2}",
        suffix = match skip {
            SkipProbingReason::ProbeLimitReached => "",
            SkipProbingReason::WithinTolerance => " Early Skip Within Tolerance",
            SkipProbingReason::RangeExhausted => " Early Skip Range Exhausted",
        },
    );
}

/// Searches the parameter for one chunk and then encodes it with the result.
pub struct TargetQualityJob {
    pub chunk:      Chunk,
    pub search:     Arc<TargetQuality>,
    /// Output template; its rate control value is replaced by the search result
    pub parameters: EncodeParameters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetQualityOutput {
    pub parameter: f64,
    pub stats:     Stats,
}

impl JobOutput for TargetQualityOutput {
    #[inline]
    fn encoded_bytes(&self) -> Option<u64> {
        Some(self.stats.bytes)
    }
}

impl Job for TargetQualityJob {
    type Output = TargetQualityOutput;

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
    fn run(&mut self, context: &JobContext<'_>) -> Result<TargetQualityOutput, JobError> {
        let parameter = self.search.find(&self.chunk)?;
        let parameters = EncodeParameters {
            rate: self.search.settings.parameter.with_value(parameter),
            purpose: Purpose::Final,
            ..self.parameters.clone()
        };
        let stats = self.search.encoder.encode(&self.chunk, &parameters, &|frames| {
            context.report_frames(frames);
        })?;
        Ok(TargetQualityOutput {
            parameter,
            stats,
        })
    }
}
