//! Frame source that replays image files from a directory.

use crate::frame::Frame;
use crate::source::{FrameSource, FrameSourceError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "pgm", "tif"];

/// Replays every image in a directory, in file-name order, as grayscale
/// frames. Once the directory is exhausted it yields no frames.
pub struct ReplaySource {
    dir: PathBuf,
    interval: Duration,
    pending: Option<VecDeque<PathBuf>>,
    sequence: u32,
}

impl ReplaySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), interval: Duration::ZERO, pending: None, sequence: 0 }
    }

    /// Wait this long before handing out each frame, to mimic a camera's
    /// frame rate.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Frames not yet replayed.
    pub fn remaining(&self) -> usize {
        self.pending.as_ref().map_or(0, VecDeque::len)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl FrameSource for ReplaySource {
    fn open(&mut self) -> Result<(), FrameSourceError> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                files.push(path);
            }
        }
        files.sort();
        tracing::info!(dir = %self.dir.display(), frames = files.len(), "replay source opened");
        self.pending = Some(files.into());
        self.sequence = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        let pending = self.pending.as_mut().ok_or(FrameSourceError::NotOpen)?;
        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }
        let Some(path) = pending.pop_front() else {
            return Ok(None);
        };

        let decoded = image::open(&path).map_err(|source| FrameSourceError::Decode {
            path: path.display().to_string(),
            source,
        })?;
        let gray = decoded.to_luma8();
        let (width, height) = gray.dimensions();
        let frame = Frame::new(gray.into_raw(), width, height, self.sequence)?;
        self.sequence += 1;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.pending = None;
    }
}
