//! Holder for the current recognition model.

use crate::recognizer::{Recognizer, RecognizerError};
use crate::types::{PixelGrid, Prediction};
use std::sync::{Arc, PoisonError, RwLock};

/// The model currently used for recognition.
///
/// Empty until the first successful training. Retraining installs a new
/// model wholesale; callers that already hold an `Arc` from [`current`]
/// keep using the model they were given.
///
/// [`current`]: ModelSlot::current
#[derive(Default)]
pub struct ModelSlot {
    current: RwLock<Option<Arc<dyn Recognizer>>>,
}

impl ModelSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current model.
    pub fn install(&self, model: Arc<dyn Recognizer>) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(model);
    }

    /// Bind to the current model, or fail if none has been trained.
    pub fn current(&self) -> Result<Arc<dyn Recognizer>, RecognizerError> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RecognizerError::ModelNotTrained)
    }

    pub fn is_trained(&self) -> bool {
        self.current.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn predict(&self, face: &PixelGrid) -> Result<Prediction, RecognizerError> {
        self.current()?.predict(face)
    }
}

impl std::fmt::Debug for ModelSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSlot").field("trained", &self.is_trained()).finish()
    }
}
