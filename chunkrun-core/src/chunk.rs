use std::path::{Path, PathBuf};

use anyhow::{bail, ensure};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index:       usize,
    pub source:      PathBuf,
    pub start_frame: usize,
    // End frame is exclusive, i.e. the range of frames is
    // `start_frame..end_frame`
    pub end_frame:   usize,
    pub frame_rate:  f64,
    /// Assigned by the caller before encoding
    pub output:      Option<PathBuf>,
}

impl Chunk {
    #[inline]
    pub fn new(
        index: usize,
        source: impl Into<PathBuf>,
        start_frame: usize,
        end_frame: usize,
        frame_rate: f64,
    ) -> Self {
        Self {
            index,
            source: source.into(),
            start_frame,
            end_frame,
            frame_rate,
            output: None,
        }
    }

    /// Returns numeric name of chunk `00001`
    #[inline]
    pub fn name(&self) -> String {
        format!("{:05}", self.index)
    }

    #[inline]
    pub const fn frames(&self) -> usize {
        self.end_frame - self.start_frame
    }

    /// Duration of the chunk in seconds
    #[inline]
    pub fn length(&self) -> f64 {
        if self.frame_rate > 0.0 {
            self.frames() as f64 / self.frame_rate
        } else {
            0.0
        }
    }

    /// Output path, defaulting to `<temp>/encode/<name>.<extension>`
    #[inline]
    pub fn output_or_default(&self, temp: &Path, extension: &str) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            temp.join("encode").join(format!("{name}.{extension}", name = self.name()))
        })
    }
}

/// Checks that `chunks` (in any order) tile `offset..total_frames` without
/// gaps or overlaps and that every index is unique.
#[inline]
pub fn validate_sequence(chunks: &[Chunk], offset: usize, total_frames: usize) -> anyhow::Result<()> {
    ensure!(!chunks.is_empty(), "Chunk sequence is empty");

    let mut sorted: Vec<&Chunk> = chunks.iter().collect();
    sorted.sort_unstable_by_key(|chunk| chunk.start_frame);

    let mut expected_start = offset;
    for chunk in &sorted {
        ensure!(
            chunk.start_frame < chunk.end_frame,
            "Chunk {} has no frames ({}..{})",
            chunk.index,
            chunk.start_frame,
            chunk.end_frame
        );
        if chunk.start_frame < expected_start {
            bail!(
                "Chunk {} overlaps its predecessor (starts at {}, expected {})",
                chunk.index,
                chunk.start_frame,
                expected_start
            );
        }
        if chunk.start_frame > expected_start {
            bail!(
                "Frames {}..{} are not covered by any chunk",
                expected_start,
                chunk.start_frame
            );
        }
        expected_start = chunk.end_frame;
    }
    ensure!(
        expected_start == total_frames,
        "Chunks end at frame {expected_start}, but the input has {total_frames} frames"
    );

    let mut indices: Vec<usize> = chunks.iter().map(|chunk| chunk.index).collect();
    indices.sort_unstable();
    indices.dedup();
    ensure!(indices.len() == chunks.len(), "Chunk indices are not unique");

    Ok(())
}
