use std::{
    any::Any,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::RecvTimeoutError;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    affinity::{CoreClaim, CorePins},
    concurrency::{core_count, ConcurrencyController, ConcurrencyMode, ScalingPolicy},
    job::{Job, JobContext, JobError, JobOutput},
    monitor::{ResourceProbe, ResourceSample, SystemMonitor, ThroughputTracker},
    progress::{status_line, BitrateEstimate, DoneChunk, DoneJson, ProgressSink},
    queue::{TaskHandle, TaskQueue},
    settings::SchedulerSettings,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid concurrency configuration: {0}")]
    InvalidConcurrency(String),
    #[error("distributed mode selected but no remote workers are available")]
    NoRemoteWorkers,
    #[error("distributed mode requires a task queue")]
    MissingQueue,
    #[error("run cancelled after {completed} of {total} jobs")]
    Cancelled { completed: usize, total: usize },
    #[error("task queue failure: {0:#}")]
    Queue(#[source] anyhow::Error),
    #[error("failed to start worker: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the jobs of one run execute.
pub enum Backend<'q, J: Job> {
    Local,
    Distributed(&'q dyn TaskQueue<J>),
}

/// What happened to one job.
pub struct JobOutcome<J: Job> {
    pub job:     J,
    pub result:  Result<J::Output, JobError>,
    pub worker:  usize,
    pub elapsed: Duration,
}

/// Per-job result slots of a finished run, in submission order.
pub struct RunReport<J: Job> {
    pub outcomes: Vec<JobOutcome<J>>,
    /// Jobs skipped because a previous run already completed them
    pub skipped:  usize,
    pub estimate: BitrateEstimate,
    pub elapsed:  Duration,
}

impl<J: Job> RunReport<J> {
    /// Indices of the jobs that failed
    #[inline]
    pub fn failed(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .map(|outcome| outcome.job.index())
            .collect()
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    /// Returns every job with its output, or the first failure.
    #[inline]
    pub fn into_outputs(self) -> anyhow::Result<Vec<(J, J::Output)>> {
        self.outcomes
            .into_iter()
            .map(|outcome| {
                let index = outcome.job.index();
                outcome
                    .result
                    .map(|output| (outcome.job, output))
                    .map_err(|e| anyhow::Error::new(e).context(format!("Job {index} failed")))
            })
            .collect()
    }
}

/// Runs jobs with a worker pool sized from live feedback, or on a remote
/// queue.
pub struct Scheduler {
    settings: SchedulerSettings,
    cores:    usize,
    probe:    Mutex<Box<dyn ResourceProbe>>,
}

impl Scheduler {
    #[inline]
    pub fn new(settings: SchedulerSettings) -> Self {
        Self::with_probe(settings, Box::new(SystemMonitor::new()))
    }

    #[inline]
    pub fn with_probe(settings: SchedulerSettings, probe: Box<dyn ResourceProbe>) -> Self {
        Self {
            settings,
            cores: core_count(),
            probe: Mutex::new(probe),
        }
    }

    #[inline]
    pub const fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Executes `jobs`, returning once every issued job has settled.
    ///
    /// Job failures are recorded in the report and do not stop sibling jobs.
    /// Setting `cancelled` stops new jobs from being issued; jobs already
    /// running are allowed to finish, the progress snapshot is written and
    /// [`SchedulerError::Cancelled`] is returned.
    #[tracing::instrument(level = "debug", skip_all, fields(jobs = jobs.len()))]
    #[inline]
    pub fn execute<J: Job>(
        &self,
        jobs: Vec<J>,
        backend: &Backend<'_, J>,
        sink: &dyn ProgressSink,
        cancelled: &AtomicBool,
    ) -> Result<RunReport<J>, SchedulerError> {
        self.settings.validate()?;
        if matches!(backend, Backend::Local)
            && self.settings.mode == ConcurrencyMode::Distributed
        {
            return Err(SchedulerError::MissingQueue);
        }

        let started = Instant::now();
        let (mut state, pending) = self.prepare(jobs, sink);
        let total = pending.len();

        match backend {
            Backend::Distributed(queue) => {
                let workers = queue.worker_count().map_err(SchedulerError::Queue)?;
                if workers == 0 {
                    error!("no remote workers available, nothing was dispatched");
                    return Err(SchedulerError::NoRemoteWorkers);
                }
                let policy = ScalingPolicy::Fixed(self.settings.fixed_workers().unwrap_or(workers));
                state.controller = ConcurrencyController::new(
                    policy,
                    workers,
                    self.settings.max_workers,
                    total,
                    false,
                );
                info!(
                    "dispatching {total} jobs to {workers} remote workers ({} in flight)",
                    state.controller.limit()
                );
                self.run_distributed(&mut state, pending, *queue, sink, cancelled)?;
            },
            Backend::Local if total < self.settings.sequential_threshold => {
                debug!("running {total} jobs sequentially");
                self.run_sequential(&mut state, pending, sink, cancelled);
            },
            Backend::Local => {
                if state.pins.is_some() {
                    debug!("pinning workers to {} cores", self.cores);
                }
                info!(
                    "running {total} jobs with {} workers (up to {})",
                    state.controller.limit(),
                    state.controller.ceiling()
                );
                self.run_local(&mut state, pending, sink, cancelled)?;
            },
        }

        self.persist(&state);

        let completed = state.outcomes.iter().flatten().count();
        if cancelled.load(Ordering::SeqCst) && completed < total {
            warn!("cancelled with {completed} of {total} jobs settled, progress saved");
            return Err(SchedulerError::Cancelled {
                completed,
                total,
            });
        }

        sink.finish();

        let outcomes: Vec<JobOutcome<J>> = state.outcomes.into_iter().flatten().collect();
        let failed: Vec<usize> = outcomes
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .map(|outcome| outcome.job.index())
            .collect();
        if !failed.is_empty() {
            error!(
                "{} of {total} jobs failed: {failed:?}",
                failed.len()
            );
        }

        Ok(RunReport {
            outcomes,
            skipped: state.skipped,
            estimate: state.done.estimate,
            elapsed: started.elapsed(),
        })
    }

    fn prepare<J: Job>(
        &self,
        jobs: Vec<J>,
        sink: &dyn ProgressSink,
    ) -> (SchedulerState<J>, VecDeque<(usize, J)>) {
        let previous = if self.settings.resume {
            self.settings.progress_file.as_deref().and_then(DoneJson::load)
        } else {
            None
        };

        let mut skipped = 0;
        let mut pending = Vec::with_capacity(jobs.len());
        for job in jobs {
            if previous.as_ref().is_some_and(|done| done.is_done(&job.name())) {
                skipped += 1;
            } else {
                pending.push(job);
            }
        }

        let controller = ConcurrencyController::new(
            self.settings.scaling_policy(),
            self.cores,
            self.settings.max_workers(),
            pending.len(),
            self.settings.pin_to_cores,
        );
        self.settings.chunk_order.apply(
            &mut pending,
            controller.ceiling(),
            self.settings.balance_iterations,
            &mut rand::rng(),
        );
        let pending: VecDeque<(usize, J)> = pending.into_iter().enumerate().collect();

        let remaining_frames: usize = pending.iter().map(|(_, job)| job.frames()).sum();
        let done = match previous {
            Some(done) => {
                let frames_done = done.frames_done();
                info!(
                    "resuming with {skipped} jobs already done ({frames_done} frames), {} \
                     remaining",
                    pending.len()
                );
                DoneJson {
                    frames: done.frames.max(frames_done + remaining_frames),
                    ..done
                }
            },
            None => DoneJson::new(remaining_frames),
        };

        sink.set_total(done.frames as u64);
        sink.set_position(done.frames_done() as u64);

        let state = SchedulerState {
            controller,
            pins: self.settings.pin_to_cores.then(|| CorePins::new(self.cores)),
            throughput: ThroughputTracker::default(),
            workers: Vec::new(),
            last_completion: Instant::now(),
            outcomes: (0..pending.len()).map(|_| None).collect(),
            done,
            skipped,
        };

        (state, pending)
    }

    fn run_sequential<J: Job>(
        &self,
        state: &mut SchedulerState<J>,
        pending: VecDeque<(usize, J)>,
        sink: &dyn ProgressSink,
        cancelled: &AtomicBool,
    ) {
        for (slot, mut job) in pending {
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            let started = Instant::now();
            let reported = AtomicUsize::new(0);
            let frames = job.frames();
            let on_frames = |done: usize| report_frames(&reported, frames, done, sink);
            let context = JobContext {
                worker:    0,
                core:      None,
                on_frames: &on_frames,
            };
            let result = run_caught(&mut job, &context);
            let reported = reported.load(Ordering::SeqCst);
            self.complete(state, sink, Completion {
                slot,
                job,
                result,
                worker: 0,
                elapsed: started.elapsed(),
                reported,
            });
        }
    }

    fn run_local<J: Job>(
        &self,
        state: &mut SchedulerState<J>,
        mut pending: VecDeque<(usize, J)>,
        sink: &dyn ProgressSink,
        cancelled: &AtomicBool,
    ) -> Result<(), SchedulerError> {
        let tick = self.settings.tick();

        crossbeam_utils::thread::scope(|s| -> Result<(), SchedulerError> {
            let (tx, rx) = crossbeam_channel::unbounded::<Completion<J>>();
            let mut in_flight = 0usize;

            loop {
                if cancelled.load(Ordering::SeqCst) && !pending.is_empty() {
                    debug!("dropping {} pending jobs", pending.len());
                    pending.clear();
                }

                if in_flight < state.controller.limit() {
                    if let Some((slot, mut job)) = pending.pop_front() {
                        let worker = state.claim_worker();
                        let claim = state.pins.as_ref().and_then(CorePins::claim);
                        if state.pins.is_some() && claim.is_none() {
                            warn!("no free core for job {}, running unpinned", job.index());
                        }
                        let tx = tx.clone();
                        let frames = job.frames();

                        s.builder()
                            .name(format!("worker-{worker}"))
                            .spawn(move |_| {
                                if let Some(claim) = &claim {
                                    claim.pin_current_thread();
                                }
                                let started = Instant::now();
                                let reported = AtomicUsize::new(0);
                                let on_frames =
                                    |done: usize| report_frames(&reported, frames, done, sink);
                                let context = JobContext {
                                    worker,
                                    core: claim.as_ref().map(CoreClaim::core),
                                    on_frames: &on_frames,
                                };
                                let result = run_caught(&mut job, &context);
                                // Free the core before the driver can issue the next job
                                drop(claim);
                                let completion = Completion {
                                    slot,
                                    job,
                                    result,
                                    worker,
                                    elapsed: started.elapsed(),
                                    reported: reported.load(Ordering::SeqCst),
                                };
                                if tx.send(completion).is_err() {
                                    error!("scheduler stopped listening for completions");
                                }
                            })?;
                        in_flight += 1;
                        continue;
                    }
                }

                if in_flight == 0 {
                    break;
                }

                match rx.recv_timeout(tick) {
                    Ok(completion) => {
                        in_flight -= 1;
                        state.release_worker(completion.worker);
                        self.complete(state, sink, completion);
                    },
                    Err(RecvTimeoutError::Timeout) => {
                        let sample = self.sample();
                        state.controller.on_resources(sample);
                        sink.set_status(&status_line(in_flight, sample, state.done.estimate.kbps()));
                    },
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            Ok(())
        })
        .map_err(|payload| {
            SchedulerError::Io(std::io::Error::other(format!(
                "worker thread panicked: {}",
                panic_message(payload.as_ref())
            )))
        })?
    }

    fn run_distributed<J: Job>(
        &self,
        state: &mut SchedulerState<J>,
        mut pending: VecDeque<(usize, J)>,
        queue: &dyn TaskQueue<J>,
        sink: &dyn ProgressSink,
        cancelled: &AtomicBool,
    ) -> Result<(), SchedulerError> {
        let mut in_flight: Vec<(TaskHandle, usize, J, Instant)> = Vec::new();

        loop {
            if cancelled.load(Ordering::SeqCst) {
                pending.clear();
            }

            while in_flight.len() < state.controller.limit() {
                let Some((slot, job)) = pending.pop_front() else {
                    break;
                };
                let handle = queue.submit(&job).map_err(SchedulerError::Queue)?;
                debug!("submitted job {} as {handle}", job.index());
                in_flight.push((handle, slot, job, Instant::now()));
            }

            if in_flight.is_empty() {
                break;
            }

            let mut settled = false;
            let mut index = 0;
            while index < in_flight.len() {
                let handle = in_flight[index].0;
                match queue.poll(handle).map_err(SchedulerError::Queue)? {
                    Some(result) => {
                        let (_, slot, job, submitted) = in_flight.swap_remove(index);
                        self.complete(state, sink, Completion {
                            slot,
                            job,
                            result,
                            worker: 0,
                            elapsed: submitted.elapsed(),
                            reported: 0,
                        });
                        settled = true;
                    },
                    None => index += 1,
                }
            }

            if !settled {
                thread::sleep(self.settings.poll_interval());
            }
        }

        Ok(())
    }

    fn complete<J: Job>(
        &self,
        state: &mut SchedulerState<J>,
        sink: &dyn ProgressSink,
        completion: Completion<J>,
    ) {
        let Completion {
            slot,
            job,
            result,
            worker,
            elapsed,
            reported,
        } = completion;
        let frames = job.frames();

        match &result {
            Ok(output) => {
                // Count whatever the job didn't report itself
                sink.inc(frames.saturating_sub(reported) as u64);
                let size_bytes = output.encoded_bytes().unwrap_or_default();
                if output.encoded_bytes().is_some() {
                    state.done.estimate.record(size_bytes, job.length());
                }
                state.done.done.insert(job.name(), DoneChunk {
                    frames,
                    size_bytes,
                });
                debug!(
                    "job {} finished on worker {worker} in {:.2}s",
                    job.index(),
                    elapsed.as_secs_f64()
                );
            },
            Err(e) => error!("job {} failed on worker {worker}: {e}", job.index()),
        }

        let since_last = state.last_completion.elapsed();
        state.last_completion = Instant::now();
        let trend = state.throughput.record(frames, since_last);
        state.controller.on_trend(trend);
        let sample = self.sample();
        state.controller.on_resources(sample);
        sink.set_status(&status_line(
            state.controller.limit(),
            sample,
            state.done.estimate.kbps(),
        ));

        state.outcomes[slot] = Some(JobOutcome {
            job,
            result,
            worker,
            elapsed,
        });

        self.persist(state);
    }

    fn sample(&self) -> ResourceSample {
        self.probe.lock().map_or_else(|_| ResourceSample::default(), |mut probe| probe.sample())
    }

    fn persist<J: Job>(&self, state: &SchedulerState<J>) {
        if let Some(path) = &self.settings.progress_file {
            if let Err(e) = state.done.save(path) {
                warn!("failed to save progress to {}: {e:#}", path.display());
            }
        }
    }
}

/// Mutable state of one [`Scheduler::execute`] call.
struct SchedulerState<J: Job> {
    controller:      ConcurrencyController,
    pins:            Option<CorePins>,
    throughput:      ThroughputTracker,
    /// Worker ids currently in use
    workers:         Vec<bool>,
    last_completion: Instant,
    outcomes:        Vec<Option<JobOutcome<J>>>,
    done:            DoneJson,
    skipped:         usize,
}

impl<J: Job> SchedulerState<J> {
    fn claim_worker(&mut self) -> usize {
        if let Some(worker) = self.workers.iter().position(|in_use| !in_use) {
            self.workers[worker] = true;
            worker
        } else {
            self.workers.push(true);
            self.workers.len() - 1
        }
    }

    fn release_worker(&mut self, worker: usize) {
        if let Some(in_use) = self.workers.get_mut(worker) {
            *in_use = false;
        }
    }
}

struct Completion<J: Job> {
    slot:     usize,
    job:      J,
    result:   Result<J::Output, JobError>,
    worker:   usize,
    elapsed:  Duration,
    reported: usize,
}

fn run_caught<J: Job>(job: &mut J, context: &JobContext<'_>) -> Result<J::Output, JobError> {
    panic::catch_unwind(AssertUnwindSafe(|| job.run(context)))
        .unwrap_or_else(|payload| Err(JobError::Panicked(panic_message(payload.as_ref()))))
}

fn report_frames(reported: &AtomicUsize, frames: usize, done: usize, sink: &dyn ProgressSink) {
    let done = done.min(frames);
    let previous = reported.fetch_max(done, Ordering::SeqCst);
    if done > previous {
        sink.inc((done - previous) as u64);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
