use std::path::Path;
use std::sync::Arc;
use log::info;
use thiserror::Error;
use crate::advice::Advisor;
use crate::config::{load_config, Config, LoadConfigurationError};
use crate::logging::{setup_logger, LoggerError};
use crate::manager_day_ahead::errors::DayAheadError;
use crate::manager_day_ahead::DayAhead;
use crate::manager_forecast::errors::SolarForecastError;
use crate::manager_forecast::SolarForecast;
use crate::manager_store::errors::StoreError;
use crate::manager_store::MemoryStore;
use crate::worker::Worker;

pub struct Mgr {
    pub store: Arc<MemoryStore>,
    pub worker: Worker,
    pub advisor: Advisor,
}

/// Initializes and returns configuration and a Mgr struct holding the initialized managers
///
/// # Arguments
///
/// * 'config_path' - path to the configuration file
pub async fn init(config_path: &str) -> Result<(Config, Mgr), InitializationError> {
    // Load configuration
    let config = load_config(config_path)?;

    // Setup logging
    let _ = setup_logger(&config.general.log_path, config.general.log_level, config.general.log_to_stdout)?;

    // Print version
    info!("starting home energy advisor version: {}", env!("CARGO_PKG_VERSION"));

    // Instantiate structs
    let store = Arc::new(MemoryStore::open(Path::new(&config.store.path)).await?);
    info!("sample store opened at {}", config.store.path);

    let forecast = SolarForecast::new(&config.solar_forecast, &config.site_defaults, config.market.timezone)?;
    let day_ahead = DayAhead::new(&config.day_ahead)?;
    let worker = Worker::new(store.clone(), forecast, day_ahead, &config.market);
    let advisor = Advisor::new(store.clone(), config.market.timezone, &config.advice);

    let mgr = Mgr {
        store,
        worker,
        advisor,
    };

    Ok((config, mgr))
}

/// Error depicting errors that occur while initializing the advisor
///
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("ConfigurationError: {0}")]
    ConfigurationError(#[from] LoadConfigurationError),
    #[error("SetupLoggerError: {0}")]
    SetupLoggerError(#[from] LoggerError),
    #[error("StoreError: {0}")]
    StoreError(#[from] StoreError),
    #[error("SolarForecastSetupError: {0}")]
    SolarForecastSetupError(#[from] SolarForecastError),
    #[error("DayAheadSetupError: {0}")]
    DayAheadSetupError(#[from] DayAheadError),
}
