use std::{
    fmt::{self, Display},
    path::PathBuf,
    process::ExitStatus,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    chunk::Chunk,
    metrics::{MetricStatistics, TargetMetric},
};

/// Scalar rate control value handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RateControl {
    /// Constant quality / quantizer. Lower is higher quality.
    Crf(f64),
    /// Target bitrate in kbps. Higher is higher quality.
    Bitrate(f64),
}

impl RateControl {
    #[inline]
    pub const fn value(self) -> f64 {
        match self {
            Self::Crf(value) | Self::Bitrate(value) => value,
        }
    }

    #[inline]
    pub const fn kind(self) -> ParameterKind {
        match self {
            Self::Crf(_) => ParameterKind::Quantizer,
            Self::Bitrate(_) => ParameterKind::Bitrate,
        }
    }
}

impl Display for RateControl {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Crf(value) => write!(f, "crf {value}"),
            Self::Bitrate(value) => write!(f, "{value} kbps"),
        }
    }
}

/// Which scalar the quality search varies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    Quantizer,
    Bitrate,
}

impl ParameterKind {
    #[inline]
    pub const fn with_value(self, value: f64) -> RateControl {
        match self {
            Self::Quantizer => RateControl::Crf(value),
            Self::Bitrate => RateControl::Bitrate(value),
        }
    }

    /// Whether raising the parameter raises quality
    #[inline]
    pub const fn quality_increases_with_value(self) -> bool {
        matches!(self, Self::Bitrate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Purpose {
    /// Throwaway encode used only to measure quality
    Probe,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeParameters {
    pub rate:       RateControl,
    /// Output (width, height); `None` keeps the source resolution
    pub resolution: Option<(u32, u32)>,
    pub passes:     u8,
    pub purpose:    Purpose,
    /// Metric the encoder should measure, if any
    pub metric:     Option<TargetMetric>,
    /// Where the artifact should be written
    pub output:     PathBuf,
}

impl EncodeParameters {
    #[inline]
    pub fn probe(rate: RateControl, metric: TargetMetric, output: PathBuf) -> Self {
        Self {
            rate,
            resolution: None,
            passes: 1,
            purpose: Purpose::Probe,
            metric: Some(metric),
            output,
        }
    }

    #[inline]
    pub fn at_resolution(mut self, resolution: Option<(u32, u32)>) -> Self {
        self.resolution = resolution;
        self
    }
}

/// Result of one encoder invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    /// Achieved bitrate in kbps
    pub bitrate:  f64,
    /// Per-frame scores of the requested metric
    pub metric:   Option<MetricStatistics>,
    pub duration: Duration,
    pub frames:   usize,
    pub bytes:    u64,
    pub artifact: PathBuf,
}

/// External encoder collaborator. Implementations are expected to be
/// deterministic for fixed inputs.
pub trait Encoder: Send + Sync {
    /// Encoder family name, e.g. `svt-av1`
    fn family(&self) -> &str;

    /// Encodes `chunk`, calling `on_frames` with the cumulative number of
    /// frames written so far whenever the encoder reports progress.
    fn encode(
        &self,
        chunk: &Chunk,
        parameters: &EncodeParameters,
        on_frames: &dyn Fn(usize),
    ) -> Result<Stats, EncoderCrash>;

    /// Inclusive legal range of the rate control scalar
    fn legal_parameter_range(&self, kind: ParameterKind) -> (f64, f64);

    #[inline]
    fn supports_fractional_parameters(&self) -> bool {
        false
    }

    /// Additive correction applied to probe scores of `metric`, for encoders
    /// whose fast probe presets are known to score systematically off.
    #[inline]
    fn probe_bias(&self, _metric: TargetMetric) -> f64 {
        0.0
    }

    /// Extension of artifacts this encoder produces
    #[inline]
    fn output_extension(&self) -> &str {
        "ivf"
    }
}

#[derive(Debug, Clone, Error)]
pub struct EncoderCrash {
    pub exit_status: Option<String>,
    pub stdout:      String,
    pub stderr:      String,
}

impl EncoderCrash {
    #[inline]
    pub fn new(exit_status: Option<ExitStatus>, stdout: String, stderr: String) -> Self {
        Self {
            exit_status: exit_status.map(|status| status.to_string()),
            stdout,
            stderr,
        }
    }

    #[inline]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            exit_status: None,
            stdout:      String::new(),
            stderr:      message.into(),
        }
    }
}

impl Display for EncoderCrash {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "encoder crashed: {}",
            self.exit_status.as_deref().unwrap_or("no exit status")
        )?;
        if !self.stdout.trim().is_empty() {
            write!(f, "\nstdout:\n{}", indent(&self.stdout))?;
        }
        if !self.stderr.trim().is_empty() {
            write!(f, "\nstderr:\n{}", indent(&self.stderr))?;
        }
        Ok(())
    }
}

fn indent(text: &str) -> String {
    text.trim_end().lines().map(|line| format!("  {line}")).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_display_includes_streams() {
        let crash = EncoderCrash {
            exit_status: Some("exit status: 1".to_owned()),
            stdout:      String::new(),
            stderr:      "bad parameter\n".to_owned(),
        };
        let text = crash.to_string();
        assert!(text.contains("exit status: 1"));
        assert!(text.contains("  bad parameter"));
        assert!(!text.contains("stdout"));
    }

    #[test]
    fn parameter_direction() {
        assert!(!ParameterKind::Quantizer.quality_increases_with_value());
        assert!(ParameterKind::Bitrate.quality_increases_with_value());
        assert_eq!(
            ParameterKind::Bitrate.with_value(800.0),
            RateControl::Bitrate(800.0)
        );
    }
}
