pub use crate::{
    balance::{Balancer, ChunkOrdering},
    cache::ProbeCache,
    chunk::Chunk,
    concurrency::{ConcurrencyController, ConcurrencyMode, ScalingPolicy},
    encoder::{EncodeParameters, Encoder, EncoderCrash, ParameterKind, Purpose, RateControl, Stats},
    job::{EncodeJob, Job, JobContext, JobError, JobOutput},
    ladder::{build_ladder, probe_candidate_grid, LadderCandidate, LadderTier},
    metrics::{MetricStatistics, ProbingStatistic, ProbingStatisticName, TargetMetric},
    progress::{DoneJson, IndicatifProgress, NullProgress, ProgressSink},
    queue::{TaskHandle, TaskQueue},
    scheduler::{Backend, RunReport, Scheduler, SchedulerError},
    settings::{LadderSettings, SchedulerSettings, Settings, TargetQualitySettings},
    target_quality::{TargetQuality, TargetQualityJob},
};

pub mod affinity;
pub mod balance;
pub mod cache;
pub mod chunk;
pub mod concurrency;
pub mod encoder;
pub mod interpol;
pub mod job;
pub mod ladder;
pub mod metrics;
pub mod monitor;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod settings;
pub mod target_quality;
