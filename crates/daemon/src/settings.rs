// Daemon configuration: defaults -> optional file -> BULKIMPORT_* environment

use anyhow::{bail, Context, Result};
use bulkimport_core::application::worker::constants::{
    DEFAULT_BATCH_SIZE, DEFAULT_CANCEL_POLL_INTERVAL, DEFAULT_ERROR_CONTAINER,
    DEFAULT_MAX_CONCURRENT_PROCESSING_TASKS, DEFAULT_POLL_INTERVAL, DEFAULT_RECOVERY_WINDOW_MS,
};
use bulkimport_infra_blob::StorageBackend;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "BULKIMPORT";
const DEFAULT_DATABASE_PATH: &str = "~/.bulkimport/import.db";
const DEFAULT_STORAGE_ROOT: &str = "~/.bulkimport/storage";
const DEFAULT_PROCESSING_WORKERS: usize = 4;
const DEFAULT_ORCHESTRATOR_WORKERS: usize = 1;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_path: String,
    pub recovery_window_ms: i64,
    pub storage: StorageSettings,
    pub workers: WorkerSettings,
    pub import: ImportSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
    S3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    pub kind: StorageKind,
    pub root: String,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    pub processing: usize,
    pub orchestrator: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportSection {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub cancel_poll_interval_ms: u64,
    pub max_concurrent_processing_tasks: usize,
    pub error_container: String,
}

impl Settings {
    /// Load with the process environment
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        Self::load_from(config_file, environment())
    }

    pub fn load_from(config_file: Option<&Path>, env: Environment) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("database_path", DEFAULT_DATABASE_PATH)?
            .set_default("recovery_window_ms", DEFAULT_RECOVERY_WINDOW_MS)?
            .set_default("storage.kind", "local")?
            .set_default("storage.root", DEFAULT_STORAGE_ROOT)?
            .set_default("workers.processing", DEFAULT_PROCESSING_WORKERS as u64)?
            .set_default("workers.orchestrator", DEFAULT_ORCHESTRATOR_WORKERS as u64)?
            .set_default("import.batch_size", DEFAULT_BATCH_SIZE as u64)?
            .set_default("import.poll_interval_ms", DEFAULT_POLL_INTERVAL.as_millis() as u64)?
            .set_default(
                "import.cancel_poll_interval_ms",
                DEFAULT_CANCEL_POLL_INTERVAL.as_millis() as u64,
            )?
            .set_default(
                "import.max_concurrent_processing_tasks",
                DEFAULT_MAX_CONCURRENT_PROCESSING_TASKS as u64,
            )?
            .set_default("import.error_container", DEFAULT_ERROR_CONTAINER)?;

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let settings: Settings = builder
            .add_source(env)
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.import.batch_size == 0 {
            bail!("import.batch_size must be positive");
        }
        if self.import.max_concurrent_processing_tasks == 0 {
            bail!("import.max_concurrent_processing_tasks must be positive");
        }
        if self.workers.processing == 0 || self.workers.orchestrator == 0 {
            bail!("workers.processing and workers.orchestrator must be positive");
        }
        if self.storage.kind == StorageKind::S3 && self.storage.bucket.is_none() {
            bail!("storage.bucket is required for the s3 backend");
        }
        Ok(())
    }

    /// SQLite URL for `database_path` (`~` expanded)
    pub fn database_url(&self) -> String {
        if self.database_path.starts_with("sqlite:") {
            return self.database_path.clone();
        }
        format!("sqlite://{}", shellexpand::tilde(&self.database_path))
    }

    pub fn database_file(&self) -> Option<PathBuf> {
        if self.database_path.starts_with("sqlite:") {
            return None;
        }
        Some(PathBuf::from(shellexpand::tilde(&self.database_path).into_owned()))
    }

    pub fn storage_backend(&self) -> StorageBackend {
        match self.storage.kind {
            StorageKind::Memory => StorageBackend::Memory,
            StorageKind::Local => StorageBackend::Local {
                root: PathBuf::from(shellexpand::tilde(&self.storage.root).into_owned()),
            },
            StorageKind::S3 => StorageBackend::S3 {
                bucket: self.storage.bucket.clone().unwrap_or_default(),
                region: self.storage.region.clone(),
                endpoint: self.storage.endpoint.clone(),
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.import.poll_interval_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.import.cancel_poll_interval_ms)
    }
}

/// `BULKIMPORT_WORKERS__PROCESSING=8` -> `workers.processing`
pub fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
