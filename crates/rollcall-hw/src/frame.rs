//! Frame type and grayscale helpers.

use ndarray::Array2;
use rollcall_core::PixelGrid;

/// Fraction of near-black pixels above which a frame is treated as dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data, row-major (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap row-major grayscale bytes, checking the length.
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize);
        if data.len() != expected {
            return Err(FrameError::InvalidLength { expected, actual: data.len() });
        }
        let is_dark = is_dark_frame(&data, DARK_FRAME_THRESHOLD);
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        })
    }

    /// Build a frame from a pixel grid.
    pub fn from_grid(grid: &PixelGrid, sequence: u32) -> Self {
        let (rows, cols) = grid.dim();
        let data: Vec<u8> = grid.iter().copied().collect();
        Self {
            is_dark: is_dark_frame(&data, DARK_FRAME_THRESHOLD),
            data,
            width: cols as u32,
            height: rows as u32,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    /// View the frame as a `[row, col]` pixel grid.
    pub fn to_grid(&self) -> Result<PixelGrid, FrameError> {
        let shape = (self.height as usize, self.width as usize);
        Array2::from_shape_vec(shape, self.data.clone()).map_err(|_| FrameError::InvalidLength {
            expected: shape.0 * shape.1,
            actual: self.data.len(),
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish()
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by keeping the Y samples.
///
/// Layout per two pixels: `[Y0, U, Y1, V]`.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: yuyv.len() });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Downscale 16-bit little-endian grayscale to 8 bits (high byte).
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    if y16.len() < pixels * 2 {
        return Err(FrameError::InvalidLength { expected: pixels * 2, actual: y16.len() });
    }
    Ok(y16[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect())
}

/// True when more than `threshold_pct` of the pixels are below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    (dark as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
