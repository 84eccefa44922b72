//! Process-wide state opened from [`Config`]: registry, stores and model slot.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::enroll::Enroller;
use crate::session::SessionContext;
use crate::train::{self, TrainError};
use rollcall_core::{ModelSlot, ModelStats, RecognizerError};
use rollcall_store::{
    AttendanceStore, IdentityRegistry, RegistryError, SampleStore, SampleStoreError,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServicesError {
    #[error("cannot create data directory {path}: {source}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("identity registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("face samples: {0}")]
    Samples(#[from] SampleStoreError),
    #[error("saved model: {0}")]
    Model(#[from] RecognizerError),
}

/// Snapshot of what is enrolled and trained.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub data_dir: PathBuf,
    pub registered: usize,
    pub enrolled: usize,
    pub model_trained: bool,
    pub model: Option<ModelStats>,
}

pub struct Services {
    config: Config,
    registry: IdentityRegistry,
    samples: SampleStore,
    attendance: AttendanceStore,
    models: ModelSlot,
    model_stats: Option<ModelStats>,
    clock: Arc<dyn Clock>,
}

impl Services {
    /// Open every store under the configured data directory and install the
    /// saved model, if any.
    pub fn open(config: Config) -> Result<Self, ServicesError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self, ServicesError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|source| ServicesError::DataDir {
            path: config.data_dir.display().to_string(),
            source,
        })?;

        let registry = IdentityRegistry::open(&config.registry_path())?;
        let samples = SampleStore::new(config.samples_dir(), config.max_samples);
        let attendance = AttendanceStore::new(config.attendance_dir());
        let models = ModelSlot::new();
        let model_stats = train::load_model(&models, &config.model_path())?;

        tracing::info!(
            data_dir = %config.data_dir.display(),
            model_loaded = model_stats.is_some(),
            "services opened"
        );
        Ok(Self { config, registry, samples, attendance, models, model_stats, clock })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn samples(&self) -> &SampleStore {
        &self.samples
    }

    pub fn attendance(&self) -> &AttendanceStore {
        &self.attendance
    }

    pub fn models(&self) -> &ModelSlot {
        &self.models
    }

    pub fn enroller(&self) -> Enroller<'_> {
        Enroller::new(
            &self.registry,
            &self.samples,
            self.clock.clone(),
            self.config.enroll_timeout(),
        )
        .with_idle_poll(self.config.idle_poll())
    }

    pub fn train(&mut self) -> Result<ModelStats, TrainError> {
        let stats = train::train(&self.samples, &self.models, &self.config.model_path())?;
        self.model_stats = Some(stats);
        Ok(stats)
    }

    pub fn session_context(&self) -> SessionContext<'_> {
        SessionContext {
            registry: &self.registry,
            models: &self.models,
            store: &self.attendance,
            clock: self.clock.clone(),
            settings: self.config.session_settings(),
        }
    }

    pub fn status(&self) -> Result<Status, ServicesError> {
        Ok(Status {
            data_dir: self.config.data_dir.clone(),
            registered: self.registry.all()?.len(),
            enrolled: self.samples.enrolled_ids()?.len(),
            model_trained: self.models.is_trained(),
            model: self.model_stats,
        })
    }
}
