use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chunkrun_core::{Chunk, EncoderCrash, Job, JobContext, JobError, JobOutput};
use tracing::debug;

/// Runs one external command per chunk.
#[derive(Debug)]
pub struct CommandJob {
    pub chunk:   Chunk,
    pub program: String,
    pub args:    Vec<String>,
    pub output:  PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct CommandOutput {
    /// Size of the output file, if the command produced one
    pub bytes:    Option<u64>,
    pub duration: Duration,
}

impl JobOutput for CommandOutput {
    fn encoded_bytes(&self) -> Option<u64> {
        self.bytes
    }
}

impl CommandJob {
    /// Builds the command line of `chunk` from a template. See
    /// [`expand_placeholders`] for the recognized placeholders.
    pub fn from_template(
        chunk: Chunk,
        template: &[String],
        temp: &Path,
        extension: &str,
    ) -> anyhow::Result<Self> {
        let output = chunk.output_or_default(temp, extension);
        let mut words = template.iter().map(|word| expand_placeholders(word, &chunk, &output));
        let program = words.next().context("Command template is empty")?;
        let args = words.collect();
        Ok(Self {
            chunk,
            program,
            args,
            output,
        })
    }
}

/// Replaces `{index}`, `{name}`, `{start}`, `{end}`, `{frames}`, `{source}`
/// and `{output}` in `word`.
pub fn expand_placeholders(word: &str, chunk: &Chunk, output: &Path) -> String {
    word.replace("{index}", &chunk.index.to_string())
        .replace("{name}", &chunk.name())
        .replace("{start}", &chunk.start_frame.to_string())
        .replace("{end}", &chunk.end_frame.to_string())
        .replace("{frames}", &chunk.frames().to_string())
        .replace("{source}", &chunk.source.to_string_lossy())
        .replace("{output}", &output.to_string_lossy())
}

impl Job for CommandJob {
    type Output = CommandOutput;

    fn index(&self) -> usize {
        self.chunk.index
    }

    fn name(&self) -> String {
        self.chunk.name()
    }

    fn frames(&self) -> usize {
        self.chunk.frames()
    }

    fn length(&self) -> f64 {
        self.chunk.length()
    }

    fn run(&mut self, context: &JobContext<'_>) -> Result<CommandOutput, JobError> {
        if let Some(parent) = self.output.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        debug!(
            "chunk {} on worker {} (core {:?}): {} {}",
            self.chunk.name(),
            context.worker,
            context.core,
            self.program,
            self.args.join(" ")
        );
        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| anyhow!("Failed to start {}: {e}", self.program))?;

        if !output.status.success() {
            return Err(EncoderCrash::new(
                Some(output.status),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )
            .into());
        }

        context.report_frames(self.chunk.frames());
        Ok(CommandOutput {
            bytes:    fs::metadata(&self.output).ok().map(|metadata| metadata.len()),
            duration: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(words: &[&str]) -> Vec<String> {
        words.iter().map(|word| (*word).to_owned()).collect()
    }

    #[test]
    fn placeholders_are_expanded() {
        let chunk = Chunk::new(4, "in.mkv", 96, 144, 24.0);
        let job = CommandJob::from_template(
            chunk,
            &template(&["enc", "--range={start}:{end}", "-n", "{frames}", "{source}", "-o", "{output}"]),
            Path::new("temp"),
            "ivf",
        )
        .unwrap();

        assert_eq!(job.program, "enc");
        assert_eq!(job.args[0], "--range=96:144");
        assert_eq!(job.args[2], "48");
        assert_eq!(job.args[3], "in.mkv");
        assert_eq!(PathBuf::from(&job.args[5]), Path::new("temp").join("encode").join("00004.ivf"));
        assert_eq!(job.output, Path::new("temp").join("encode").join("00004.ivf"));
    }

    #[test]
    fn empty_template_is_rejected() {
        let chunk = Chunk::new(0, "in.mkv", 0, 10, 24.0);
        assert!(CommandJob::from_template(chunk, &[], Path::new("temp"), "ivf").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_its_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = CommandJob::from_template(
            Chunk::new(1, "in.mkv", 0, 10, 24.0),
            &template(&["sh", "-c", "echo broken {name} >&2; exit 3"]),
            dir.path(),
            "ivf",
        )
        .unwrap();
        let on_frames = |_: usize| {};

        let error = job
            .run(&JobContext {
                worker:    0,
                core:      None,
                on_frames: &on_frames,
            })
            .unwrap_err();

        let crash = match error {
            JobError::Encoder(crash) => crash,
            other => panic!("expected an encoder crash, got {other}"),
        };
        assert!(crash.stderr.contains("broken 00001"));
        assert!(crash.exit_status.is_some());
    }
}
