use std::{cmp::Ordering, fmt};

use anyhow::{anyhow, ensure};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum TargetMetric {
    #[strum(serialize = "vmaf")]
    VMAF,
    #[strum(serialize = "ssimulacra2")]
    SSIMULACRA2,
    #[strum(serialize = "butteraugli-inf")]
    ButteraugliINF,
    #[strum(serialize = "butteraugli-3")]
    Butteraugli3,
    #[strum(serialize = "xpsnr")]
    XPSNR,
    #[strum(serialize = "xpsnr-weighted")]
    XPSNRWeighted,
}

impl TargetMetric {
    /// Lower scores mean higher quality
    #[inline]
    pub const fn is_inverse(self) -> bool {
        matches!(self, Self::ButteraugliINF | Self::Butteraugli3)
    }

    /// Maps a score onto an axis where larger always means better quality.
    #[inline]
    pub fn orient(self, score: f64) -> f64 {
        if self.is_inverse() {
            -score
        } else {
            score
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbingStatisticName {
    Automatic,
    Mean,
    RootMeanSquare,
    Median,
    Harmonic,
    Percentile,
    StandardDeviation,
    Mode,
    Minimum,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbingStatistic {
    pub name:  ProbingStatisticName,
    pub value: Option<f64>,
}

impl Default for ProbingStatistic {
    #[inline]
    fn default() -> Self {
        Self {
            name:  ProbingStatisticName::Automatic,
            value: None,
        }
    }
}

impl ProbingStatistic {
    #[inline]
    pub fn parse(stat: &str) -> anyhow::Result<Self> {
        let simple = |name| {
            Ok(Self {
                name,
                value: None,
            })
        };
        match stat.to_lowercase().as_str() {
            "auto" => simple(ProbingStatisticName::Automatic),
            "mean" => simple(ProbingStatisticName::Mean),
            "harmonic" => simple(ProbingStatisticName::Harmonic),
            "root-mean-square" => simple(ProbingStatisticName::RootMeanSquare),
            "median" => simple(ProbingStatisticName::Median),
            "mode" => simple(ProbingStatisticName::Mode),
            "minimum" => simple(ProbingStatisticName::Minimum),
            "maximum" => simple(ProbingStatisticName::Maximum),
            probe_statistic if probe_statistic.starts_with("percentile") => {
                let value = probe_statistic
                    .strip_prefix("percentile=")
                    .and_then(|s| s.parse::<f64>().ok())
                    .filter(|v| (0.0..=100.0).contains(v))
                    .ok_or_else(|| {
                        anyhow!(
                            "Probing Statistic percentile must be set to a value between 0 and \
                             100 using \"=\" (eg. \"percentile=1\")"
                        )
                    })?;
                Ok(Self {
                    name:  ProbingStatisticName::Percentile,
                    value: Some(value),
                })
            },
            probe_statistic if probe_statistic.starts_with("standard-deviation") => {
                let value = probe_statistic
                    .strip_prefix("standard-deviation=")
                    .and_then(|s| s.parse::<f64>().ok())
                    .ok_or_else(|| {
                        anyhow!(
                            "Probing Statistic standard deviation must have a positive or \
                             negative value set using \"=\" (eg. \"standard-deviation=-0.25\")"
                        )
                    })?;
                Ok(Self {
                    name:  ProbingStatisticName::StandardDeviation,
                    value: Some(value),
                })
            },
            _ => Err(anyhow!("Unknown Probing Statistic: {}", stat)),
        }
    }
}

impl fmt::Display for ProbingStatistic {
    /// Same syntax [`ProbingStatistic::parse`] accepts
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.name {
            ProbingStatisticName::Automatic => "auto",
            ProbingStatisticName::Mean => "mean",
            ProbingStatisticName::RootMeanSquare => "root-mean-square",
            ProbingStatisticName::Median => "median",
            ProbingStatisticName::Harmonic => "harmonic",
            ProbingStatisticName::Percentile => "percentile",
            ProbingStatisticName::StandardDeviation => "standard-deviation",
            ProbingStatisticName::Mode => "mode",
            ProbingStatisticName::Minimum => "minimum",
            ProbingStatisticName::Maximum => "maximum",
        };
        match self.value {
            Some(value) => write!(f, "{name}={value}"),
            None => f.write_str(name),
        }
    }
}

/// Summary of per-frame quality scores for one encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStatistics {
    scores: Vec<f64>,
}

impl MetricStatistics {
    #[inline]
    pub fn new(mut scores: Vec<f64>) -> Self {
        scores.retain(|score| score.is_finite());
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        Self {
            scores,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    #[inline]
    pub fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        self.scores.iter().sum::<f64>() / self.scores.len() as f64
    }

    #[inline]
    pub fn harmonic_mean(&self) -> f64 {
        if self.scores.is_empty() || self.scores.iter().any(|&score| score <= 0.0) {
            return self.minimum();
        }
        self.scores.len() as f64 / self.scores.iter().map(|score| 1.0 / score).sum::<f64>()
    }

    #[inline]
    pub fn root_mean_square(&self) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        (self.scores.iter().map(|score| score * score).sum::<f64>() / self.scores.len() as f64)
            .sqrt()
    }

    #[inline]
    pub fn median(&self) -> f64 {
        self.percentile(50.0)
    }

    /// Nearest-rank percentile, `percentile` in `0..=100`
    #[inline]
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.scores.is_empty() {
            return 0.0;
        }
        let rank = (percentile.clamp(0.0, 100.0) / 100.0 * (self.scores.len() - 1) as f64).round();
        self.scores[rank as usize]
    }

    #[inline]
    pub fn standard_deviation(&self) -> f64 {
        if self.scores.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = self.scores.iter().map(|score| (score - mean).powi(2)).sum::<f64>()
            / self.scores.len() as f64;
        variance.sqrt()
    }

    /// Most frequent score after rounding to two decimals
    #[inline]
    pub fn mode(&self) -> f64 {
        let mut best = (0usize, self.minimum());
        let mut run = (0usize, f64::NAN);
        for &score in &self.scores {
            let rounded = (score * 100.0).round() / 100.0;
            if rounded == run.1 {
                run.0 += 1;
            } else {
                run = (1, rounded);
            }
            if run.0 > best.0 {
                best = run;
            }
        }
        best.1
    }

    #[inline]
    pub fn minimum(&self) -> f64 {
        self.scores.first().copied().unwrap_or_default()
    }

    #[inline]
    pub fn maximum(&self) -> f64 {
        self.scores.last().copied().unwrap_or_default()
    }

    /// Reduces the summary to the single scalar the quality search consumes.
    ///
    /// `relative_parameter` is the probed parameter's position inside the legal
    /// range (`0.0` = highest quality end) and only matters for
    /// [`ProbingStatisticName::Automatic`].
    #[inline]
    pub fn aggregate(
        &self,
        statistic: ProbingStatistic,
        metric: TargetMetric,
        relative_parameter: f64,
    ) -> anyhow::Result<f64> {
        ensure!(!self.is_empty(), "No frame scores to aggregate");

        let aggregate = match statistic.name {
            ProbingStatisticName::Automatic => {
                if metric == TargetMetric::VMAF {
                    return Ok(self.percentile(1.0));
                }

                // Lower parameters produce lower variance, so the mean is trusted
                // further up the range and -1 sigma is used close to the top.
                if relative_parameter > 0.25 {
                    self.mean()
                } else {
                    (self.mean() - self.standard_deviation()).clamp(self.minimum(), self.maximum())
                }
            },
            ProbingStatisticName::Mean => self.mean(),
            ProbingStatisticName::RootMeanSquare => self.root_mean_square(),
            ProbingStatisticName::Median => self.median(),
            ProbingStatisticName::Harmonic => self.harmonic_mean(),
            ProbingStatisticName::Percentile => {
                let value = statistic
                    .value
                    .ok_or_else(|| anyhow!("Percentile statistic requires a value"))?;
                self.percentile(value)
            },
            ProbingStatisticName::StandardDeviation => {
                let value = statistic
                    .value
                    .ok_or_else(|| anyhow!("Standard deviation statistic requires a value"))?;
                (self.mean() + value * self.standard_deviation())
                    .clamp(self.minimum(), self.maximum())
            },
            ProbingStatisticName::Mode => self.mode(),
            ProbingStatisticName::Minimum => self.minimum(),
            ProbingStatisticName::Maximum => self.maximum(),
        };

        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn summary_statistics() {
        let stats = MetricStatistics::new(vec![4.0, 1.0, 2.0, 2.0, f64::NAN]);
        assert!((stats.mean() - 2.25).abs() < 1e-9);
        assert!((stats.minimum() - 1.0).abs() < f64::EPSILON);
        assert!((stats.maximum() - 4.0).abs() < f64::EPSILON);
        assert!((stats.mode() - 2.0).abs() < f64::EPSILON);
        assert!((stats.harmonic_mean() - 4.0 / 2.25).abs() < 1e-9);
        assert!((stats.percentile(100.0) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_probing_statistics() {
        assert_eq!(
            ProbingStatistic::parse("percentile=5").unwrap(),
            ProbingStatistic {
                name:  ProbingStatisticName::Percentile,
                value: Some(5.0),
            }
        );
        assert_eq!(
            ProbingStatistic::parse("standard-deviation=-0.5").unwrap().value,
            Some(-0.5)
        );
        assert!(ProbingStatistic::parse("percentile").is_err());
        assert!(ProbingStatistic::parse("percentile=101").is_err());
        assert!(ProbingStatistic::parse("bogus").is_err());
    }

    #[test]
    fn probing_statistics_display_as_parsed() {
        for stat in ["auto", "mean", "root-mean-square", "percentile=5", "standard-deviation=-0.5"] {
            assert_eq!(ProbingStatistic::parse(stat).unwrap().to_string(), stat);
        }
    }

    #[test]
    fn automatic_vmaf_uses_low_percentile() {
        let stats = MetricStatistics::new((0..=100).map(f64::from).collect());
        let value = stats
            .aggregate(ProbingStatistic::default(), TargetMetric::VMAF, 0.5)
            .unwrap();
        assert!((value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn metric_names_round_trip_through_strum() {
        assert_eq!(
            TargetMetric::from_str("butteraugli-inf").unwrap(),
            TargetMetric::ButteraugliINF
        );
        assert_eq!(TargetMetric::SSIMULACRA2.to_string(), "ssimulacra2");
        assert!(TargetMetric::Butteraugli3.is_inverse());
        assert!((TargetMetric::Butteraugli3.orient(2.0) + 2.0).abs() < f64::EPSILON);
    }
}
