use std::{
    fs::{self, File},
    io::Write,
    path::Path,
    time::Duration,
};

use anyhow::Context;
use dashmap::DashMap;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{chunk::Chunk, monitor::ResourceSample};

/// Observer of a scheduling run. Nothing in the run depends on what a sink
/// does with the updates.
pub trait ProgressSink: Send + Sync {
    fn set_total(&self, total: u64);
    /// Jumps to `position`, used when resuming
    fn set_position(&self, position: u64);
    fn inc(&self, units: u64);
    fn set_status(&self, status: &str);
    fn finish(&self);
}

/// Discards all updates.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    #[inline]
    fn set_total(&self, _total: u64) {}

    #[inline]
    fn set_position(&self, _position: u64) {}

    #[inline]
    fn inc(&self, _units: u64) {}

    #[inline]
    fn set_status(&self, _status: &str) {}

    #[inline]
    fn finish(&self) {}
}

/// Terminal progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifProgress {
    bar: ProgressBar,
}

impl IndicatifProgress {
    #[inline]
    pub fn new(name: &str) -> anyhow::Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(&format!(
                    "{name} - {{elapsed}} {{wide_bar}} [{{pos}}/{{len}}] ({{percent:.2}}%) {{eta}} \
                     {{msg}}"
                ))
                .context("Failed to create progress bar style")?,
        );
        bar.enable_steady_tick(Duration::from_millis(250));
        Ok(Self {
            bar,
        })
    }

    #[inline]
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::hidden()),
        }
    }
}

impl ProgressSink for IndicatifProgress {
    #[inline]
    fn set_total(&self, total: u64) {
        self.bar.set_length(total);
    }

    #[inline]
    fn set_position(&self, position: u64) {
        self.bar.set_position(position);
        self.bar.reset_eta();
    }

    #[inline]
    fn inc(&self, units: u64) {
        self.bar.inc(units);
    }

    #[inline]
    fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_owned());
    }

    #[inline]
    fn finish(&self) {
        self.bar.finish();
    }
}

/// Running estimate of the output bitrate: total encoded bits over total
/// encoded media seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BitrateEstimate {
    pub bits:    f64,
    pub seconds: f64,
}

impl BitrateEstimate {
    #[inline]
    pub fn record(&mut self, bytes: u64, seconds: f64) {
        if seconds > 0.0 {
            self.bits += bytes as f64 * 8.0;
            self.seconds += seconds;
        }
    }

    #[inline]
    pub fn kbps(&self) -> Option<f64> {
        (self.seconds > 0.0).then(|| self.bits / self.seconds / 1000.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneChunk {
    pub frames:     usize,
    pub size_bytes: u64,
}

/// Resumable snapshot of a run, persisted as `done.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DoneJson {
    /// Total frames of the whole run
    pub frames:   usize,
    pub done:     DashMap<String, DoneChunk>,
    #[serde(default)]
    pub estimate: BitrateEstimate,
}

impl DoneJson {
    #[inline]
    pub fn new(frames: usize) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }

    /// Loads a snapshot. A missing or unreadable file means starting over.
    #[inline]
    pub fn load(path: &Path) -> Option<Self> {
        let contents = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(done) => Some(done),
            Err(e) => {
                warn!("ignoring corrupt progress file {}: {e}", path.display());
                None
            },
        }
    }

    #[inline]
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create {temp_path:?}"))?;
        file.write_all(serde_json::to_string(self)?.as_bytes())?;
        fs::rename(&temp_path, path).with_context(|| format!("Failed to write {path:?}"))?;
        Ok(())
    }

    #[inline]
    pub fn is_done(&self, name: &str) -> bool {
        self.done.contains_key(name)
    }

    #[inline]
    pub fn frames_done(&self) -> usize {
        self.done.iter().map(|chunk| chunk.frames).sum()
    }
}

#[inline]
pub fn read_chunk_queue(path: &Path) -> anyhow::Result<Vec<Chunk>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("Failed to read chunks file {path:?}"))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse chunks file {path:?}"))
}

#[inline]
pub fn save_chunk_queue(path: &Path, chunks: &[Chunk]) -> anyhow::Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create chunks file {path:?}"))?;
    file.write_all(serde_json::to_string(chunks)?.as_bytes())
        .with_context(|| format!("Failed to write chunks file {path:?}"))?;
    Ok(())
}

/// One-line summary shown next to the progress bar.
#[inline]
pub fn status_line(workers: usize, sample: ResourceSample, kbps: Option<f64>) -> String {
    let bitrate = kbps.map_or_else(|| "-".to_owned(), |kbps| format!("{kbps:.0} kbps"));
    format!(
        "workers {workers} | cpu {cpu:.0}% | mem {memory:.0}% | ~{bitrate}",
        cpu = sample.cpu,
        memory = sample.memory,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_is_bits_over_seconds() {
        let mut estimate = BitrateEstimate::default();
        assert_eq!(estimate.kbps(), None);
        estimate.record(125_000, 1.0);
        estimate.record(375_000, 3.0);
        assert!((estimate.kbps().unwrap() - 1000.0).abs() < 1e-9);
        estimate.record(10, 0.0);
        assert!((estimate.kbps().unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn done_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.json");

        let done = DoneJson::new(240);
        done.done.insert("00001".to_owned(), DoneChunk {
            frames:     48,
            size_bytes: 1024,
        });
        done.done.insert("00003".to_owned(), DoneChunk {
            frames:     24,
            size_bytes: 512,
        });
        done.save(&path).unwrap();

        let loaded = DoneJson::load(&path).unwrap();
        assert_eq!(loaded.frames, 240);
        assert_eq!(loaded.frames_done(), 72);
        assert!(loaded.is_done("00003"));
        assert!(!loaded.is_done("00002"));
    }

    #[test]
    fn corrupt_done_json_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.json");
        fs::write(&path, "[1, 2").unwrap();
        assert!(DoneJson::load(&path).is_none());
        assert!(DoneJson::load(&dir.path().join("missing.json")).is_none());
    }

    #[test]
    fn chunk_queue_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.json");
        let chunks = vec![
            Chunk::new(0, "in.mkv", 0, 24, 24.0),
            Chunk::new(1, "in.mkv", 24, 60, 24.0),
        ];
        save_chunk_queue(&path, &chunks).unwrap();
        assert_eq!(read_chunk_queue(&path).unwrap(), chunks);
    }

    #[test]
    fn status_line_format() {
        let sample = ResourceSample {
            cpu:    51.2,
            memory: 33.0,
            swap:   0.0,
        };
        assert_eq!(
            status_line(4, sample, Some(2500.4)),
            "workers 4 | cpu 51% | mem 33% | ~2500 kbps"
        );
        assert_eq!(
            status_line(1, sample, None),
            "workers 1 | cpu 51% | mem 33% | ~-"
        );
    }
}
