//! LBPH face recognizer.
//!
//! Each face crop is reduced to a spatial histogram of 8-neighbour local
//! binary patterns (radius 1) over an 8x8 grid of cells. Prediction returns
//! the nearest training sample under the chi-square distance, so the
//! reported confidence is a distance: 0 for an identical crop, larger for
//! less similar ones.

use crate::types::{EnrollmentId, FaceSample, PixelGrid, Prediction};
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const LBP_GRID: usize = 8;
const LBP_RADIUS: usize = 1;
const LBP_BINS: usize = 256;
const HISTOGRAM_LEN: usize = LBP_GRID * LBP_GRID * LBP_BINS;
/// Smallest crop that still gives every grid cell at least one pattern.
pub const MIN_FACE_SIZE: usize = LBP_GRID + 2 * LBP_RADIUS;

/// Neighbour offsets, clockwise from top-left. Bit `i` of a pattern is set
/// when neighbour `i` is at least as bright as the centre pixel.
const NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
    (1, 0),
    (1, -1),
    (0, -1),
];

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognition model not trained; enroll faces and run training first")]
    ModelNotTrained,
    #[error("no face samples available for training")]
    EmptyDataset,
    #[error("face crop {width}x{height} is too small (need at least {min}x{min})")]
    InvalidImage { width: usize, height: usize, min: usize },
    #[error("model artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("model artifact I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("model artifact format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("model artifact does not match this recognizer: {0}")]
    IncompatibleArtifact(String),
}

/// Maps a face crop to its closest enrolled identity.
pub trait Recognizer: Send + Sync {
    fn predict(&self, face: &PixelGrid) -> Result<Prediction, RecognizerError>;
}

/// What a training run consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStats {
    pub identities: usize,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainedSample {
    enrollment_id: EnrollmentId,
    histogram: Vec<f32>,
}

/// Trained LBPH model. Immutable once built; retraining builds a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    grid: usize,
    samples: Vec<TrainedSample>,
}

impl LbphModel {
    /// Train a model from every identity's samples in one batch.
    ///
    /// Samples smaller than [`MIN_FACE_SIZE`] are skipped. Fails with
    /// `EmptyDataset` when nothing usable remains.
    pub fn train(
        dataset: &BTreeMap<EnrollmentId, Vec<FaceSample>>,
    ) -> Result<(Self, ModelStats), RecognizerError> {
        let mut samples = Vec::new();
        let mut identities = BTreeSet::new();

        for (&enrollment_id, faces) in dataset {
            for sample in faces {
                match histogram(&sample.pixels) {
                    Ok(histogram) => {
                        identities.insert(enrollment_id);
                        samples.push(TrainedSample { enrollment_id, histogram });
                    }
                    Err(e) => {
                        tracing::warn!(
                            enrollment_id,
                            sample = sample.sample_index,
                            error = %e,
                            "skipping unusable training sample"
                        );
                    }
                }
            }
        }

        if samples.is_empty() {
            return Err(RecognizerError::EmptyDataset);
        }

        let stats = ModelStats { identities: identities.len(), samples: samples.len() };
        tracing::info!(
            identities = stats.identities,
            samples = stats.samples,
            "LBPH model trained"
        );

        Ok((Self { grid: LBP_GRID, samples }, stats))
    }

    pub fn stats(&self) -> ModelStats {
        let identities: BTreeSet<_> = self.samples.iter().map(|s| s.enrollment_id).collect();
        ModelStats { identities: identities.len(), samples: self.samples.len() }
    }

    /// Write the model as JSON. The file is replaced atomically.
    pub fn save(&self, path: &Path) -> Result<(), RecognizerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        let file = std::fs::File::create(&tmp)?;
        serde_json::to_writer(std::io::BufWriter::new(file), self)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(path = %path.display(), "model artifact written");
        Ok(())
    }

    /// Read a model previously written by [`save`](Self::save).
    pub fn load(path: &Path) -> Result<Self, RecognizerError> {
        if !path.exists() {
            return Err(RecognizerError::ArtifactNotFound(path.display().to_string()));
        }
        let file = std::fs::File::open(path)?;
        let model: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        if model.samples.is_empty() {
            return Err(RecognizerError::EmptyDataset);
        }
        model.check_layout()?;
        Ok(model)
    }

    /// The grid and every histogram length must match what [`histogram`] produces.
    fn check_layout(&self) -> Result<(), RecognizerError> {
        if self.grid != LBP_GRID {
            return Err(RecognizerError::IncompatibleArtifact(format!(
                "grid {} (expected {LBP_GRID})",
                self.grid
            )));
        }
        match self.samples.iter().find(|s| s.histogram.len() != HISTOGRAM_LEN) {
            Some(bad) => Err(RecognizerError::IncompatibleArtifact(format!(
                "histogram of {} bins for enrollment {} (expected {HISTOGRAM_LEN})",
                bad.histogram.len(),
                bad.enrollment_id
            ))),
            None => Ok(()),
        }
    }
}

impl Recognizer for LbphModel {
    fn predict(&self, face: &PixelGrid) -> Result<Prediction, RecognizerError> {
        let query = histogram(face)?;

        let mut best = Prediction { enrollment_id: 0, confidence: f64::INFINITY };
        for sample in &self.samples {
            let distance = chi_square(&query, &sample.histogram);
            if distance < best.confidence {
                best = Prediction { enrollment_id: sample.enrollment_id, confidence: distance };
            }
        }

        if best.confidence.is_infinite() {
            return Err(RecognizerError::ModelNotTrained);
        }
        Ok(best)
    }
}

/// Spatial LBP histogram: one normalized 256-bin histogram per grid cell.
fn histogram(face: &PixelGrid) -> Result<Vec<f32>, RecognizerError> {
    let (rows, cols) = face.dim();
    if rows < MIN_FACE_SIZE || cols < MIN_FACE_SIZE {
        return Err(RecognizerError::InvalidImage {
            width: cols,
            height: rows,
            min: MIN_FACE_SIZE,
        });
    }

    let codes = local_binary_patterns(face);
    let (code_rows, code_cols) = codes.dim();
    let cell_h = code_rows / LBP_GRID;
    let cell_w = code_cols / LBP_GRID;
    let cell_total = (cell_h * cell_w) as f32;

    let mut hist = vec![0f32; HISTOGRAM_LEN];
    for gy in 0..LBP_GRID {
        for gx in 0..LBP_GRID {
            let offset = (gy * LBP_GRID + gx) * LBP_BINS;
            let (y0, x0) = (gy * cell_h, gx * cell_w);
            let cell = codes.slice(s![y0..y0 + cell_h, x0..x0 + cell_w]);
            for &code in cell.iter() {
                hist[offset + code as usize] += 1.0;
            }
            for bin in &mut hist[offset..offset + LBP_BINS] {
                *bin /= cell_total;
            }
        }
    }

    Ok(hist)
}

/// Pattern image for the interior pixels (border of `LBP_RADIUS` dropped).
fn local_binary_patterns(face: &PixelGrid) -> Array2<u8> {
    let (rows, cols) = face.dim();
    let r = LBP_RADIUS as isize;
    let mut codes = Array2::<u8>::zeros((rows - 2 * LBP_RADIUS, cols - 2 * LBP_RADIUS));

    for y in LBP_RADIUS..rows - LBP_RADIUS {
        for x in LBP_RADIUS..cols - LBP_RADIUS {
            let centre = face[[y, x]];
            let mut code = 0u8;
            for (bit, &(dy, dx)) in NEIGHBOURS.iter().enumerate() {
                let ny = (y as isize + dy * r) as usize;
                let nx = (x as isize + dx * r) as usize;
                if face[[ny, nx]] >= centre {
                    code |= 1 << bit;
                }
            }
            codes[[y - LBP_RADIUS, x - LBP_RADIUS]] = code;
        }
    }

    codes
}

/// Chi-square distance `2 * Σ (a-b)² / (a+b)`, skipping empty bins.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let sum = (x + y) as f64;
            if sum > 0.0 {
                let diff = (x - y) as f64;
                2.0 * diff * diff / sum
            } else {
                0.0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard(size: usize) -> PixelGrid {
        Array2::from_shape_fn((size, size), |(r, c)| {
            if (r / 2 + c / 2) % 2 == 0 {
                20
            } else {
                220
            }
        })
    }

    fn stripes(size: usize) -> PixelGrid {
        Array2::from_shape_fn((size, size), |(_, c)| if (c / 3) % 2 == 0 { 30 } else { 200 })
    }

    fn gradient(size: usize) -> PixelGrid {
        Array2::from_shape_fn((size, size), |(r, c)| ((r * 7 + c * 3) % 256) as u8)
    }

    fn samples(id: EnrollmentId, face: PixelGrid, count: u32) -> Vec<FaceSample> {
        (1..=count)
            .map(|i| FaceSample { enrollment_id: id, pixels: face.clone(), sample_index: i })
            .collect()
    }

    #[test]
    fn test_train_empty_dataset() {
        let dataset = BTreeMap::new();
        assert!(matches!(LbphModel::train(&dataset), Err(RecognizerError::EmptyDataset)));

        let mut only_empty = BTreeMap::new();
        only_empty.insert(7, Vec::new());
        assert!(matches!(LbphModel::train(&only_empty), Err(RecognizerError::EmptyDataset)));
    }

    #[test]
    fn test_train_reports_stats() {
        let mut dataset = BTreeMap::new();
        dataset.insert(7, samples(7, checkerboard(40), 50));
        let (model, stats) = LbphModel::train(&dataset).unwrap();
        assert_eq!(stats, ModelStats { identities: 1, samples: 50 });
        assert_eq!(model.stats(), stats);
    }

    #[test]
    fn test_train_skips_small_samples() {
        let mut dataset = BTreeMap::new();
        dataset.insert(1, samples(1, checkerboard(4), 3));
        assert!(matches!(LbphModel::train(&dataset), Err(RecognizerError::EmptyDataset)));

        dataset.insert(2, samples(2, stripes(32), 2));
        let (_, stats) = LbphModel::train(&dataset).unwrap();
        assert_eq!(stats, ModelStats { identities: 1, samples: 2 });
    }

    #[test]
    fn test_predict_identical_crop_is_zero_distance() {
        let mut dataset = BTreeMap::new();
        dataset.insert(7, samples(7, checkerboard(48), 2));
        dataset.insert(9, samples(9, stripes(48), 2));
        let (model, _) = LbphModel::train(&dataset).unwrap();

        let p = model.predict(&checkerboard(48)).unwrap();
        assert_eq!(p.enrollment_id, 7);
        assert!(p.confidence.abs() < 1e-9, "got {}", p.confidence);

        let p = model.predict(&stripes(48)).unwrap();
        assert_eq!(p.enrollment_id, 9);
        assert!(p.is_match(70.0));
    }

    #[test]
    fn test_predict_picks_nearest_identity() {
        let mut dataset = BTreeMap::new();
        dataset.insert(1, samples(1, checkerboard(40), 1));
        dataset.insert(2, samples(2, stripes(40), 1));
        dataset.insert(3, samples(3, gradient(40), 1));
        let (model, stats) = LbphModel::train(&dataset).unwrap();
        assert_eq!(stats.identities, 3);

        let p = model.predict(&gradient(40)).unwrap();
        assert_eq!(p.enrollment_id, 3);
    }

    #[test]
    fn test_confidence_is_non_negative() {
        let mut dataset = BTreeMap::new();
        dataset.insert(1, samples(1, checkerboard(40), 1));
        let (model, _) = LbphModel::train(&dataset).unwrap();

        for face in [stripes(40), gradient(40), checkerboard(40)] {
            let p = model.predict(&face).unwrap();
            assert!(p.confidence >= 0.0);
        }
    }

    #[test]
    fn test_predict_rejects_tiny_crop() {
        let mut dataset = BTreeMap::new();
        dataset.insert(1, samples(1, checkerboard(40), 1));
        let (model, _) = LbphModel::train(&dataset).unwrap();

        let result = model.predict(&Array2::zeros((5, 40)));
        assert!(matches!(result, Err(RecognizerError::InvalidImage { height: 5, .. })));
    }

    #[test]
    fn test_lbp_of_flat_image_sets_every_bit() {
        let flat = Array2::from_elem((12, 12), 100u8);
        let codes = local_binary_patterns(&flat);
        assert_eq!(codes.dim(), (10, 10));
        assert!(codes.iter().all(|&c| c == 0xFF));
    }

    #[test]
    fn test_chi_square_identical_and_disjoint() {
        let a = [0.5f32, 0.5, 0.0];
        let b = [0.0f32, 0.0, 1.0];
        assert_eq!(chi_square(&a, &a), 0.0);
        assert!((chi_square(&a, &b) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models").join("lbph.json");

        let mut dataset = BTreeMap::new();
        dataset.insert(7, samples(7, checkerboard(32), 3));
        let (model, stats) = LbphModel::train(&dataset).unwrap();
        model.save(&path).unwrap();

        let loaded = LbphModel::load(&path).unwrap();
        assert_eq!(loaded.stats(), stats);
        let p = loaded.predict(&checkerboard(32)).unwrap();
        assert_eq!(p.enrollment_id, 7);
    }

    #[test]
    fn test_load_rejects_foreign_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lbph.json");
        let mut dataset = BTreeMap::new();
        dataset.insert(7, samples(7, checkerboard(32), 2));
        let (model, _) = LbphModel::train(&dataset).unwrap();
        let saved = serde_json::to_value(&model).unwrap();

        let mut other_grid = saved.clone();
        other_grid["grid"] = serde_json::json!(4);
        std::fs::write(&path, other_grid.to_string()).unwrap();
        assert!(matches!(LbphModel::load(&path), Err(RecognizerError::IncompatibleArtifact(_))));

        let mut short = saved;
        short["samples"][1]["histogram"] = serde_json::json!([0.5, 0.5]);
        std::fs::write(&path, short.to_string()).unwrap();
        let err = LbphModel::load(&path).unwrap_err();
        assert!(err.to_string().contains("histogram of 2 bins"), "got {err}");
    }

    #[test]
    fn test_load_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let result = LbphModel::load(&dir.path().join("absent.json"));
        assert!(matches!(result, Err(RecognizerError::ArtifactNotFound(_))));
    }
}
