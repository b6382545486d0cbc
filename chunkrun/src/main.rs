use std::{
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, ensure, Context};
use chunkrun_core::{
    chunk::validate_sequence,
    progress::{read_chunk_queue, save_chunk_queue},
    Backend,
    ChunkOrdering,
    IndicatifProgress,
    Job,
    ProgressSink,
    Scheduler,
    SchedulerError,
    Settings,
};
use clap::Parser;
use colored::Colorize;
use tracing::{info, level_filters::LevelFilter, warn};

use crate::{command::CommandJob, logging::init_logging};

mod command;
mod logging;

const DONE_FILE: &str = "done.json";
const CHUNKS_FILE: &str = "chunks.json";
/// Exit status of a run stopped by an interrupt, as a shell would report it
const INTERRUPTED: i32 = 130;

/// How a run that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Completed,
    Cancelled,
}

/// Runs an external command over every chunk of a chunk queue with an
/// adaptive worker pool.
#[derive(Parser, Debug)]
#[command(name = "chunkrun", version, about)]
pub struct CliOpts {
    /// Chunk queue (JSON list of chunks). Defaults to the queue saved in the
    /// temp directory when resuming
    #[arg(short, long)]
    pub chunks: Option<PathBuf>,

    /// Command run for every chunk, split like a shell would split it.
    ///
    /// Recognized placeholders: {index} {name} {start} {end} {frames}
    /// {source} {output}
    #[arg(short = 'x', long)]
    pub command: String,

    /// Temporary directory holding outputs, the saved queue and progress
    #[arg(long, default_value = "temp")]
    pub temp: PathBuf,

    /// Output file extension used for {output}
    #[arg(long, default_value = "ivf")]
    pub extension: String,

    /// Number of workers, -1 picks them automatically
    #[arg(short, long, allow_hyphen_values = true)]
    pub workers: Option<i64>,

    /// Upper bound for automatically scaled worker counts
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Order in which chunks are started
    #[arg(long)]
    pub chunk_order: Option<ChunkOrdering>,

    /// Pin each worker to its own CPU core
    #[arg(long)]
    pub pin: bool,

    /// Scale workers by measured frames per second instead of CPU load
    #[arg(long)]
    pub throughput_scaling: bool,

    /// Skip chunks a previous run already finished
    #[arg(short, long)]
    pub resume: bool,

    /// JSON settings file; command line flags take precedence
    #[arg(short, long)]
    pub settings: Option<PathBuf>,

    /// Log file, defaults to <temp>/log/chunkrun.log
    #[arg(short, long)]
    pub logs: Option<PathBuf>,

    /// Do not draw a progress bar
    #[arg(short, long)]
    pub quiet: bool,
}

fn main() -> anyhow::Result<()> {
    if run(CliOpts::parse())? == Finish::Cancelled {
        process::exit(INTERRUPTED);
    }
    Ok(())
}

fn run(cli: CliOpts) -> anyhow::Result<Finish> {
    let logs = cli.logs.clone().unwrap_or_else(|| cli.temp.join("log").join("chunkrun.log"));
    let _guard = init_logging(LevelFilter::INFO, &logs, LevelFilter::DEBUG)?;

    let settings = load_settings(&cli)?;
    settings.validate()?;
    ensure_supported(&settings)?;

    let chunks_path = match &cli.chunks {
        Some(path) => path.clone(),
        None if cli.resume => cli.temp.join(CHUNKS_FILE),
        None => bail!("A chunk queue is required unless resuming"),
    };
    let chunks = read_chunk_queue(&chunks_path)?;
    ensure!(!chunks.is_empty(), "Chunk queue {} is empty", chunks_path.display());
    let first = chunks.iter().map(|chunk| chunk.start_frame).min().unwrap_or_default();
    let last = chunks.iter().map(|chunk| chunk.end_frame).max().unwrap_or_default();
    validate_sequence(&chunks, first, last)?;

    std::fs::create_dir_all(&cli.temp)
        .with_context(|| format!("Failed to create {}", cli.temp.display()))?;
    if cli.temp.join(CHUNKS_FILE) != chunks_path {
        save_chunk_queue(&cli.temp.join(CHUNKS_FILE), &chunks)?;
    }

    let template = shlex::split(&cli.command).context("Command could not be parsed")?;
    let jobs = chunks
        .into_iter()
        .map(|chunk| CommandJob::from_template(chunk, &template, &cli.temp, &cli.extension))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let cancelled = Arc::new(AtomicBool::new(false));
    let ctrlc_cancelled = Arc::clone(&cancelled);
    ctrlc::set_handler(move || {
        warn!("Interrupted, finishing running chunks and saving progress");
        ctrlc_cancelled.store(true, Ordering::SeqCst);
    })
    .context("Failed to install the interrupt handler")?;

    info!(
        "\n{}{} {} {}{} {}\n{}: {}",
        "Q".green().bold(),
        "ueue".green(),
        format!("{len}", len = jobs.len()).green().bold(),
        "W".blue().bold(),
        "orkers".blue(),
        describe_workers(settings.scheduler.workers).blue().bold(),
        "Command".bold(),
        cli.command.dimmed()
    );

    let sink: Box<dyn ProgressSink> = if cli.quiet {
        Box::new(IndicatifProgress::hidden())
    } else {
        Box::new(IndicatifProgress::new("chunkrun")?)
    };
    let scheduler = Scheduler::new(settings.scheduler);
    execute(&scheduler, jobs, sink.as_ref(), &cancelled)
}

/// Runs `jobs` and turns the report into the outcome of the program. Any
/// failed job, panics included, fails the run once every other job settled.
fn execute<J: Job>(
    scheduler: &Scheduler,
    jobs: Vec<J>,
    sink: &dyn ProgressSink,
    cancelled: &AtomicBool,
) -> anyhow::Result<Finish> {
    match scheduler.execute(jobs, &Backend::Local, sink, cancelled) {
        Ok(report) => {
            let failed = report.failed();
            info!(
                "{} {} chunks in {:.1?}{}{}",
                "Finished".green().bold(),
                report.outcomes.len() - failed.len(),
                report.elapsed,
                if report.skipped > 0 {
                    format!(", {} skipped", report.skipped)
                } else {
                    String::new()
                },
                report
                    .estimate
                    .kbps()
                    .map(|kbps| format!(", ~{kbps:.0} kbps"))
                    .unwrap_or_default()
            );
            if !failed.is_empty() {
                bail!("{} chunks failed: {failed:?}", failed.len());
            }
            Ok(Finish::Completed)
        },
        Err(SchedulerError::Cancelled {
            completed,
            total,
        }) => {
            warn!(
                "{} after {completed} of {total} chunks, rerun with --resume to continue",
                "Cancelled".yellow().bold()
            );
            Ok(Finish::Cancelled)
        },
        Err(e) => Err(e.into()),
    }
}

/// The command driver only schedules external commands; quality searches and
/// ladders are library features.
fn ensure_supported(settings: &Settings) -> anyhow::Result<()> {
    ensure!(
        settings.target_quality.is_none(),
        "The settings file has a target_quality section, which chunkrun does not run; remove it"
    );
    ensure!(
        settings.ladder.is_none(),
        "The settings file has a ladder section, which chunkrun does not run; remove it"
    );
    Ok(())
}

fn load_settings(cli: &CliOpts) -> anyhow::Result<Settings> {
    let mut settings = match &cli.settings {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };

    let scheduler = &mut settings.scheduler;
    if let Some(workers) = cli.workers {
        scheduler.workers = workers;
    }
    if cli.max_workers.is_some() {
        scheduler.max_workers = cli.max_workers;
    }
    if let Some(order) = cli.chunk_order {
        scheduler.chunk_order = order;
    }
    scheduler.pin_to_cores |= cli.pin;
    scheduler.throughput_scaling |= cli.throughput_scaling;
    scheduler.resume |= cli.resume;
    if scheduler.progress_file.is_none() {
        scheduler.progress_file = Some(cli.temp.join(DONE_FILE));
    }

    Ok(settings)
}

fn describe_workers(workers: i64) -> String {
    if workers < 0 {
        "auto".to_owned()
    } else {
        workers.to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use chunkrun_core::{
        settings::{LadderSettings, SchedulerSettings, TargetQualitySettings},
        JobContext,
        JobError,
    };

    use super::*;

    struct Flaky {
        index: usize,
    }

    impl Job for Flaky {
        type Output = ();

        fn index(&self) -> usize {
            self.index
        }

        fn frames(&self) -> usize {
            24
        }

        fn length(&self) -> f64 {
            1.0
        }

        fn run(&mut self, _context: &JobContext<'_>) -> Result<(), JobError> {
            assert_ne!(self.index, 1, "chunk 1 is broken");
            Ok(())
        }
    }

    fn flaky(count: usize) -> Vec<Flaky> {
        (0..count)
            .map(|index| Flaky {
                index,
            })
            .collect()
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerSettings {
            workers: 2,
            ..SchedulerSettings::default()
        })
    }

    fn parse(args: &[&str]) -> CliOpts {
        CliOpts::try_parse_from(std::iter::once("chunkrun").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_settings() {
        let cli = parse(&[
            "-x",
            "true",
            "--workers",
            "3",
            "--chunk-order",
            "length_desc",
            "--pin",
            "--resume",
        ]);
        let settings = load_settings(&cli).unwrap();

        assert_eq!(settings.scheduler.workers, 3);
        assert_eq!(settings.scheduler.chunk_order, ChunkOrdering::LengthDesc);
        assert!(settings.scheduler.pin_to_cores);
        assert!(settings.scheduler.resume);
        assert_eq!(settings.scheduler.progress_file, Some(Path::new("temp").join(DONE_FILE)));
    }

    #[test]
    fn panicking_chunk_fails_only_itself() {
        let sink = IndicatifProgress::hidden();
        let cancelled = AtomicBool::new(false);

        let error = execute(&scheduler(), flaky(3), &sink, &cancelled).unwrap_err();
        assert_eq!(error.to_string(), "1 chunks failed: [1]");

        let finish = execute(&scheduler(), flaky(1), &sink, &cancelled).unwrap();
        assert_eq!(finish, Finish::Completed);
    }

    #[test]
    fn interrupted_run_reports_cancellation() {
        let sink = IndicatifProgress::hidden();
        let cancelled = AtomicBool::new(true);

        let finish = execute(&scheduler(), flaky(3), &sink, &cancelled).unwrap();
        assert_eq!(finish, Finish::Cancelled);
    }

    #[test]
    fn search_sections_are_rejected() {
        assert!(ensure_supported(&Settings::default()).is_ok());

        let settings = Settings {
            target_quality: Some(TargetQualitySettings::default()),
            ..Settings::default()
        };
        let error = ensure_supported(&settings).unwrap_err();
        assert!(error.to_string().contains("target_quality"));

        let settings = Settings {
            ladder: Some(LadderSettings::default()),
            ..Settings::default()
        };
        assert!(ensure_supported(&settings).unwrap_err().to_string().contains("ladder"));
    }

    #[test]
    fn negative_worker_count_parses() {
        let cli = parse(&["-x", "true", "-w", "-1"]);
        assert_eq!(cli.workers, Some(-1));
        assert_eq!(describe_workers(-1), "auto");
    }

    #[test]
    fn unknown_order_is_rejected() {
        let result = CliOpts::try_parse_from(["chunkrun", "-x", "true", "--chunk-order", "longest"]);
        assert!(result.is_err());
    }
}
