//! Run settings from CLI flags with environment fallbacks.

use std::path::PathBuf;
use std::str::FromStr;

use mot_loader_database::paths::DEFAULT_DB_PATH;
use mot_loader_ingest_models::{
    DEFAULT_BATCH_SIZE, DEFAULT_MAX_WORKERS, DEFAULT_POOL_SIZE, IngestConfig, LoadStrategy,
    VehicleWriteMode,
};

use crate::IngestError;

pub const DATABASE_VAR: &str = "MOT_DATABASE";
pub const DATA_DIR_VAR: &str = "DATA_DIR";
pub const DOWNLOAD_DIR_VAR: &str = "DOWNLOAD_DIR";
pub const BATCH_SIZE_VAR: &str = "BATCH_SIZE";
pub const MAX_WORKERS_VAR: &str = "MAX_WORKERS";
pub const POOL_SIZE_VAR: &str = "POOL_SIZE";

pub const DEFAULT_DATA_DIR: &str = "data/bulk";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";

/// Values given explicitly on the command line. `None` falls back to the
/// environment, then to the default.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub database: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub pool_size: Option<u32>,
    pub strategy: Option<LoadStrategy>,
    pub mode: Option<VehicleWriteMode>,
}

/// Fully resolved settings for one command.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database: PathBuf,
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
    pub pool_size: u32,
    pub ingest: IngestConfig,
}

impl Settings {
    /// Resolves settings against the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Config`] if a numeric variable is not a
    /// positive integer.
    pub fn resolve(overrides: Overrides) -> Result<Self, IngestError> {
        Self::resolve_with(overrides, |name| std::env::var(name).ok())
    }

    /// Resolves settings through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Config`] if a numeric variable is not a
    /// positive integer.
    pub fn resolve_with(
        overrides: Overrides,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, IngestError> {
        let path = |given: Option<PathBuf>, var: &str, default: &str| {
            given
                .or_else(|| lookup(var).filter(|v| !v.trim().is_empty()).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(default))
        };

        let database = path(overrides.database, DATABASE_VAR, DEFAULT_DB_PATH);
        let data_dir = path(overrides.data_dir, DATA_DIR_VAR, DEFAULT_DATA_DIR);
        let download_dir = path(overrides.download_dir, DOWNLOAD_DIR_VAR, DEFAULT_DOWNLOAD_DIR);

        let batch_size = number(overrides.batch_size, BATCH_SIZE_VAR, DEFAULT_BATCH_SIZE, &lookup)?;
        let max_workers =
            number(overrides.max_workers, MAX_WORKERS_VAR, DEFAULT_MAX_WORKERS, &lookup)?;
        let pool_size = number(overrides.pool_size, POOL_SIZE_VAR, DEFAULT_POOL_SIZE, &lookup)?;

        Ok(Self {
            database,
            data_dir,
            download_dir,
            pool_size,
            ingest: IngestConfig {
                batch_size,
                max_workers,
                strategy: overrides.strategy.unwrap_or_default(),
                mode: overrides.mode.unwrap_or_default(),
            },
        })
    }
}

fn number<T>(
    given: Option<T>,
    var: &str,
    default: T,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<T, IngestError>
where
    T: FromStr + PartialEq + Default + std::fmt::Display + Copy,
{
    let value = match given {
        Some(v) => v,
        None => match lookup(var).map(|v| v.trim().to_string()) {
            Some(raw) if !raw.is_empty() => raw.parse().map_err(|_| IngestError::Config {
                message: format!("{var} must be a positive integer, got {raw:?}"),
            })?,
            _ => default,
        },
    };

    if value == T::default() {
        return Err(IngestError::Config {
            message: format!("{var} must be greater than zero"),
        });
    }
    Ok(value)
}
