//! Face sample store: enrollment crops as PNG files, one directory per
//! identity (`<root>/<id>/<id>_<index>.png`).

use image::GrayImage;
use ndarray::Array2;
use rollcall_core::{EnrollmentId, FaceSample, PixelGrid};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SampleStoreError {
    #[error("enrollment id {0} already has face samples; reset it before re-enrolling")]
    AlreadyEnrolled(EnrollmentId),
    #[error("enrollment id {0} is being written by another enrollment")]
    EnrollmentBusy(EnrollmentId),
    #[error("face sample is empty")]
    EmptySample,
    #[error("sample image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("sample image has an unexpected shape: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("sample store I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-identity collection of enrollment face crops.
pub struct SampleStore {
    root: PathBuf,
    max_samples: usize,
    /// Identities with an open [`EnrollmentWriter`].
    writing: Mutex<HashSet<EnrollmentId>>,
}

impl SampleStore {
    pub fn new(root: impl Into<PathBuf>, max_samples: usize) -> Self {
        Self { root: root.into(), max_samples, writing: Mutex::new(HashSet::new()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    fn identity_dir(&self, id: EnrollmentId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Start writing samples for `id`.
    ///
    /// Fails with `AlreadyEnrolled` when samples already exist and with
    /// `EnrollmentBusy` while another writer holds the same id.
    pub fn open_enrollment(
        &self,
        id: EnrollmentId,
    ) -> Result<EnrollmentWriter<'_>, SampleStoreError> {
        let mut writing = self.writing.lock().unwrap_or_else(PoisonError::into_inner);
        if writing.contains(&id) {
            return Err(SampleStoreError::EnrollmentBusy(id));
        }
        if self.sample_count(id)? > 0 {
            return Err(SampleStoreError::AlreadyEnrolled(id));
        }
        std::fs::create_dir_all(self.identity_dir(id))?;
        writing.insert(id);
        drop(writing);

        tracing::debug!(enrollment_id = id, max = self.max_samples, "enrollment opened");
        Ok(EnrollmentWriter { store: self, id, count: 0 })
    }

    /// Remove every sample of `id` so it can be enrolled again.
    pub fn reset(&self, id: EnrollmentId) -> Result<usize, SampleStoreError> {
        let writing = self.writing.lock().unwrap_or_else(PoisonError::into_inner);
        if writing.contains(&id) {
            return Err(SampleStoreError::EnrollmentBusy(id));
        }
        let removed = self.sample_count(id)?;
        let dir = self.identity_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        tracing::info!(enrollment_id = id, removed, "face samples reset");
        Ok(removed)
    }

    pub fn sample_count(&self, id: EnrollmentId) -> Result<usize, SampleStoreError> {
        Ok(self.sample_files(id)?.len())
    }

    /// Sample files for `id`, ordered by sample index.
    fn sample_files(&self, id: EnrollmentId) -> Result<Vec<(u32, PathBuf)>, SampleStoreError> {
        let dir = self.identity_dir(id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if let Some(index) = parse_sample_name(&path, id) {
                files.push((index, path));
            }
        }
        files.sort_by_key(|(index, _)| *index);
        Ok(files)
    }

    /// Lazily decode the samples of `id`, in capture order.
    pub fn samples_for(
        &self,
        id: EnrollmentId,
    ) -> Result<impl Iterator<Item = Result<FaceSample, SampleStoreError>>, SampleStoreError> {
        let files = self.sample_files(id)?;
        Ok(files.into_iter().map(move |(sample_index, path)| {
            let pixels = read_grid(&path)?;
            Ok(FaceSample { enrollment_id: id, pixels, sample_index })
        }))
    }

    /// Identities that have a sample directory, ascending.
    pub fn enrolled_ids(&self) -> Result<Vec<EnrollmentId>, SampleStoreError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Every identity's samples, as consumed by training.
    pub fn all_samples(&self) -> Result<BTreeMap<EnrollmentId, Vec<FaceSample>>, SampleStoreError> {
        let mut dataset = BTreeMap::new();
        for id in self.enrolled_ids()? {
            let samples = self.samples_for(id)?.collect::<Result<Vec<_>, _>>()?;
            if !samples.is_empty() {
                dataset.insert(id, samples);
            }
        }
        Ok(dataset)
    }
}

/// Exclusive writer for one identity's enrollment.
///
/// Dropping the writer releases the identity for other writers.
pub struct EnrollmentWriter<'a> {
    store: &'a SampleStore,
    id: EnrollmentId,
    count: usize,
}

impl EnrollmentWriter<'_> {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.store.max_samples
    }

    /// Store one face crop and return the sample count.
    ///
    /// Once the cap is reached this does nothing and keeps returning the cap.
    pub fn add_sample(&mut self, face: &PixelGrid) -> Result<usize, SampleStoreError> {
        if self.is_full() {
            return Ok(self.count);
        }
        let index = self.count as u32 + 1;
        let path = self.store.identity_dir(self.id).join(sample_name(self.id, index));
        write_grid(&path, face)?;
        self.count += 1;
        tracing::trace!(enrollment_id = self.id, index, "face sample stored");
        Ok(self.count)
    }
}

impl Drop for EnrollmentWriter<'_> {
    fn drop(&mut self) {
        self.store
            .writing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

fn sample_name(id: EnrollmentId, index: u32) -> String {
    format!("{id}_{index}.png")
}

fn parse_sample_name(path: &Path, id: EnrollmentId) -> Option<u32> {
    if path.extension()? != "png" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let (owner, index) = stem.split_once('_')?;
    if owner.parse::<EnrollmentId>().ok()? != id {
        return None;
    }
    index.parse().ok()
}

fn write_grid(path: &Path, face: &PixelGrid) -> Result<(), SampleStoreError> {
    let (rows, cols) = face.dim();
    if rows == 0 || cols == 0 {
        return Err(SampleStoreError::EmptySample);
    }
    let pixels: Vec<u8> = face.iter().copied().collect();
    let image = GrayImage::from_raw(cols as u32, rows as u32, pixels)
        .ok_or(SampleStoreError::EmptySample)?;
    image
        .save(path)
        .map_err(|source| SampleStoreError::Image { path: path.display().to_string(), source })
}

fn read_grid(path: &Path) -> Result<PixelGrid, SampleStoreError> {
    let image = image::open(path)
        .map_err(|source| SampleStoreError::Image { path: path.display().to_string(), source })?
        .to_luma8();
    let (width, height) = image.dimensions();
    Ok(Array2::from_shape_vec((height as usize, width as usize), image.into_raw())?)
}
