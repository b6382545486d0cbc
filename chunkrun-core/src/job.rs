use std::sync::Arc;

use thiserror::Error;

use crate::{
    chunk::Chunk,
    encoder::{EncodeParameters, Encoder, EncoderCrash, Stats},
};

/// A single executable unit handed to the scheduler.
///
/// The scheduler owns the job while it runs and hands it back in the run
/// report once `run` has returned.
pub trait Job: Send {
    type Output: JobOutput + Send;

    /// Stable ordering key, unique within one run
    fn index(&self) -> usize;

    #[inline]
    fn name(&self) -> String {
        format!("{:05}", self.index())
    }

    /// Frames this job accounts for in progress reporting
    fn frames(&self) -> usize;

    /// Media duration in seconds
    fn length(&self) -> f64;

    fn run(&mut self, context: &JobContext<'_>) -> Result<Self::Output, JobError>;
}

/// Per-execution environment passed to [`Job::run`].
pub struct JobContext<'a> {
    pub worker:    usize,
    /// Core this job is pinned to, if pinning is enabled
    pub core:      Option<usize>,
    pub on_frames: &'a (dyn Fn(usize) + Sync),
}

impl JobContext<'_> {
    /// Reports the cumulative number of frames finished by this job.
    #[inline]
    pub fn report_frames(&self, frames: usize) {
        (self.on_frames)(frames);
    }
}

pub trait JobOutput {
    /// Size of the produced artifact, used for the bitrate estimate
    fn encoded_bytes(&self) -> Option<u64>;
}

impl JobOutput for Stats {
    #[inline]
    fn encoded_bytes(&self) -> Option<u64> {
        Some(self.bytes)
    }
}

impl JobOutput for () {
    #[inline]
    fn encoded_bytes(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Encoder(#[from] EncoderCrash),
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Binds one chunk to one parameter set.
pub struct EncodeJob {
    pub chunk:      Chunk,
    pub parameters: EncodeParameters,
    pub encoder:    Arc<dyn Encoder>,
}

impl EncodeJob {
    #[inline]
    pub fn new(chunk: Chunk, parameters: EncodeParameters, encoder: Arc<dyn Encoder>) -> Self {
        Self {
            chunk,
            parameters,
            encoder,
        }
    }
}

impl Job for EncodeJob {
    type Output = Stats;

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
    fn run(&mut self, context: &JobContext<'_>) -> Result<Stats, JobError> {
        let stats = self.encoder.encode(&self.chunk, &self.parameters, &|frames| {
            context.report_frames(frames);
        })?;
        Ok(stats)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        encoder::{ParameterKind, Purpose, RateControl},
        metrics::{MetricStatistics, TargetMetric},
    };

    /// Encoder whose score is a fixed function of the rate control value.
    pub(crate) struct SyntheticEncoder {
        pub score:      Box<dyn Fn(f64, Option<(u32, u32)>) -> f64 + Send + Sync>,
        pub bitrate:    Box<dyn Fn(f64, Option<(u32, u32)>) -> f64 + Send + Sync>,
        pub range:      (f64, f64),
        pub calls:      AtomicUsize,
        pub fail_at:    Option<f64>,
        pub probed:     Mutex<Vec<f64>>,
        pub fractional: bool,
        pub bias:       f64,
    }

    impl SyntheticEncoder {
        pub(crate) fn new(score: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
            Self {
                score:      Box::new(move |value, _| score(value)),
                bitrate:    Box::new(|value, _| 10_000.0 / value.max(1.0)),
                range:      (0.0, 63.0),
                calls:      AtomicUsize::new(0),
                fail_at:    None,
                probed:     Mutex::new(Vec::new()),
                fractional: false,
                bias:       0.0,
            }
        }
    }

    impl Encoder for SyntheticEncoder {
        fn family(&self) -> &str {
            "synthetic"
        }

        fn encode(
            &self,
            chunk: &Chunk,
            parameters: &EncodeParameters,
            on_frames: &dyn Fn(usize),
        ) -> Result<Stats, EncoderCrash> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let value = parameters.rate.value();
            self.probed.lock().unwrap().push(value);
            if self.fail_at == Some(value) {
                return Err(EncoderCrash::message(format!("refusing {value}")));
            }
            on_frames(chunk.frames());
            let score = (self.score)(value, parameters.resolution);
            let bitrate = (self.bitrate)(value, parameters.resolution);
            if let Some(parent) = parameters.output.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            std::fs::write(&parameters.output, b"probe").ok();
            Ok(Stats {
                bitrate,
                metric: Some(MetricStatistics::new(vec![score; 4])),
                duration: Duration::from_millis(1),
                frames: chunk.frames(),
                bytes: (bitrate * 1000.0 / 8.0 * chunk.length()) as u64,
                artifact: parameters.output.clone(),
            })
        }

        fn legal_parameter_range(&self, _kind: ParameterKind) -> (f64, f64) {
            self.range
        }

        fn supports_fractional_parameters(&self) -> bool {
            self.fractional
        }

        fn probe_bias(&self, _metric: TargetMetric) -> f64 {
            self.bias
        }
    }

    #[test]
    fn encode_job_forwards_progress_and_stats() {
        let encoder = Arc::new(SyntheticEncoder::new(|value| 100.0 - value));
        let dir = tempfile::tempdir().unwrap();
        let mut job = EncodeJob::new(
            Chunk::new(7, "in.mkv", 0, 48, 24.0),
            EncodeParameters {
                rate:       RateControl::Crf(30.0),
                resolution: None,
                passes:     1,
                purpose:    Purpose::Final,
                metric:     Some(TargetMetric::VMAF),
                output:     dir.path().join("00007.ivf"),
            },
            Arc::clone(&encoder) as Arc<dyn Encoder>,
        );
        let reported = AtomicUsize::new(0);
        let on_frames = |frames: usize| reported.store(frames, Ordering::SeqCst);
        let context = JobContext {
            worker:    0,
            core:      None,
            on_frames: &on_frames,
        };

        let stats = job.run(&context).unwrap();
        assert_eq!(job.name(), "00007");
        assert_eq!(reported.load(Ordering::SeqCst), 48);
        assert_eq!(stats.frames, 48);
        assert_eq!(stats.artifact, dir.path().join("00007.ivf"));
        assert!(stats.encoded_bytes().is_some());
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
    }
}
