//! Face detector seam.
//!
//! Detection itself is provided by an external model; this module defines
//! the contract the capture loop depends on and a pass-through detector for
//! frames that are already face crops.

use crate::types::{PixelGrid, Region};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detection failed: {0}")]
    Failed(String),
}

/// A face found in a frame, with its crop already extracted.
#[derive(Debug, Clone)]
pub struct Detection {
    pub region: Region,
    pub face: PixelGrid,
}

/// Finds candidate faces in a grayscale frame.
pub trait FaceDetector {
    /// Returns zero or more detections, largest face first.
    fn detect(&mut self, frame: &PixelGrid) -> Result<Vec<Detection>, DetectorError>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(&mut self, frame: &PixelGrid) -> Result<Vec<Detection>, DetectorError> {
        (**self).detect(frame)
    }
}

/// Treats every non-empty frame as a single face crop.
///
/// Used when replaying images that were cropped ahead of time, such as the
/// sample files written during enrollment.
#[derive(Debug, Default, Clone, Copy)]
pub struct WholeFrameDetector;

impl FaceDetector for WholeFrameDetector {
    fn detect(&mut self, frame: &PixelGrid) -> Result<Vec<Detection>, DetectorError> {
        let (rows, cols) = frame.dim();
        if rows == 0 || cols == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Detection {
            region: Region { x: 0, y: 0, width: cols as u32, height: rows as u32 },
            face: frame.clone(),
        }])
    }
}
