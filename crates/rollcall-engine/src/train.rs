//! Training orchestration: samples in, model artifact and live model out.

use rollcall_core::{LbphModel, ModelSlot, ModelStats, RecognizerError};
use rollcall_store::{SampleStore, SampleStoreError};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("cannot read face samples: {0}")]
    Samples(#[from] SampleStoreError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
}

/// Retrain from every stored sample, save the artifact, then install it.
///
/// On failure neither the artifact nor the installed model changes.
pub fn train(
    samples: &SampleStore,
    slot: &ModelSlot,
    artifact: &Path,
) -> Result<ModelStats, TrainError> {
    let dataset = samples.all_samples()?;
    let (model, stats) = LbphModel::train(&dataset)?;
    model.save(artifact)?;
    slot.install(Arc::new(model));
    tracing::info!(
        identities = stats.identities,
        samples = stats.samples,
        artifact = %artifact.display(),
        "model trained and installed"
    );
    Ok(stats)
}

/// Install the saved model at `artifact`, if there is one.
pub fn load_model(
    slot: &ModelSlot,
    artifact: &Path,
) -> Result<Option<ModelStats>, RecognizerError> {
    match LbphModel::load(artifact) {
        Ok(model) => {
            let stats = model.stats();
            slot.install(Arc::new(model));
            tracing::info!(
                identities = stats.identities,
                samples = stats.samples,
                "saved model loaded"
            );
            Ok(Some(stats))
        }
        Err(RecognizerError::ArtifactNotFound(_)) => {
            tracing::debug!(artifact = %artifact.display(), "no saved model");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
