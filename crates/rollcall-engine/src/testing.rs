//! Scripted collaborators shared by the engine tests.

use ndarray::Array2;
use rollcall_core::{
    Detection, DetectorError, EnrollmentId, FaceDetector, PixelGrid, Prediction, Recognizer,
    RecognizerError, Region,
};
use rollcall_hw::{Frame, FrameSource, FrameSourceError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Frame whose pixels are face tags, one column per face (0 = background).
pub(crate) fn frame_with(tags: &[u8]) -> Frame {
    let cols = tags.len().max(1);
    let grid = Array2::from_shape_fn((1, cols), |(_, c)| tags.get(c).copied().unwrap_or(0));
    Frame::from_grid(&grid, 0)
}

/// Frame source that plays back a fixed script, then yields no frames.
pub(crate) struct ScriptedSource {
    script: VecDeque<Result<Option<Frame>, FrameSourceError>>,
    pub(crate) fail_open: bool,
    pub(crate) opened: bool,
    pub(crate) closed: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub(crate) fn new(script: Vec<Result<Option<Frame>, FrameSourceError>>) -> Self {
        Self {
            script: script.into(),
            fail_open: false,
            opened: false,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn frames(tags: &[&[u8]]) -> Self {
        Self::new(tags.iter().map(|t| Ok(Some(frame_with(t)))).collect())
    }

    pub(crate) fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn open(&mut self) -> Result<(), FrameSourceError> {
        if self.fail_open {
            return Err(FrameSourceError::Failed("no such device".into()));
        }
        self.opened = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        if !self.opened {
            return Err(FrameSourceError::NotOpen);
        }
        self.script.pop_front().unwrap_or(Ok(None))
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One detection per distinct non-zero pixel value, left to right.
pub(crate) struct TagDetector;

impl FaceDetector for TagDetector {
    fn detect(&mut self, frame: &PixelGrid) -> Result<Vec<Detection>, DetectorError> {
        let mut seen = Vec::new();
        for (col, &tag) in frame.row(0).iter().enumerate() {
            if tag != 0 && !seen.iter().any(|(t, _)| *t == tag) {
                seen.push((tag, col));
            }
        }
        Ok(seen
            .into_iter()
            .map(|(tag, col)| Detection {
                region: Region { x: col as u32, y: 0, width: 1, height: 1 },
                face: Array2::from_elem((1, 1), tag),
            })
            .collect())
    }
}

/// Recognizer that answers from a tag → (id, confidence) table.
pub(crate) struct TagRecognizer(pub(crate) HashMap<u8, (EnrollmentId, f64)>);

impl TagRecognizer {
    pub(crate) fn new(entries: &[(u8, EnrollmentId, f64)]) -> Arc<Self> {
        Arc::new(Self(entries.iter().map(|&(tag, id, conf)| (tag, (id, conf))).collect()))
    }
}

impl Recognizer for TagRecognizer {
    fn predict(&self, face: &PixelGrid) -> Result<Prediction, RecognizerError> {
        let tag = face[[0, 0]];
        let (enrollment_id, confidence) = self.0.get(&tag).copied().unwrap_or((0, 999.0));
        Ok(Prediction { enrollment_id, confidence })
    }
}

/// Reports one square face per listed side length, whatever the frame holds.
pub(crate) struct SizedDetector(pub(crate) Vec<u32>);

impl FaceDetector for SizedDetector {
    fn detect(&mut self, _frame: &PixelGrid) -> Result<Vec<Detection>, DetectorError> {
        Ok(self
            .0
            .iter()
            .map(|&side| Detection {
                region: Region { x: 0, y: 0, width: side, height: side },
                face: Array2::from_elem((side as usize, side as usize), 128),
            })
            .collect())
    }
}

/// Open source that never has a frame ready; counts every pull.
#[derive(Default)]
pub(crate) struct EmptySource {
    pub(crate) pulls: Arc<AtomicUsize>,
}

impl FrameSource for EmptySource {
    fn open(&mut self) -> Result<(), FrameSourceError> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }

    fn close(&mut self) {}
}
