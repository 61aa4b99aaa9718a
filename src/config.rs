use std::fs;
use chrono_tz::Tz;
use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

#[derive(Deserialize)]
pub struct General {
    pub log_path: String,
    pub log_level: LevelFilter,
    pub log_to_stdout: bool,
}

#[derive(Deserialize)]
pub struct Market {
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default = "default_cutoff_hour")]
    pub publication_cutoff_hour: u32,
}

impl Default for Market {
    fn default() -> Self {
        Market { timezone: default_timezone(), publication_cutoff_hour: default_cutoff_hour() }
    }
}

#[derive(Deserialize)]
pub struct SolarForecastParameters {
    #[serde(default = "default_solar_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Deserialize)]
pub struct DayAheadParameters {
    #[serde(default = "default_day_ahead_url")]
    pub base_url: String,
    pub security_token: String,
    #[serde(default = "default_document_type")]
    pub document_type: String,
    pub in_domain: String,
    pub out_domain: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Site used for users without a registered solar profile
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SiteDefaults {
    pub lat: f64,
    pub long: f64,
    pub tilt: f64,
    pub azimuth: f64,
    pub kwp: f64,
}

impl Default for SiteDefaults {
    fn default() -> Self {
        SiteDefaults { lat: 51.260197, long: 4.402771, tilt: 37.0, azimuth: 0.0, kwp: 1.0 }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AdviceParameters {
    pub low_price_threshold: f64,
    pub high_price_threshold: f64,
    pub battery_capacity_wh: f64,
    /// Price used when neither a market price nor a fixed contract price is known
    pub default_price: f64,
}

impl Default for AdviceParameters {
    fn default() -> Self {
        AdviceParameters {
            low_price_threshold: 50.0,
            high_price_threshold: 150.0,
            battery_capacity_wh: 5000.0,
            default_price: 100.0,
        }
    }
}

#[derive(Deserialize)]
pub struct StoreParameters {
    pub path: String,
}

#[derive(Deserialize)]
pub struct Schedule {
    #[serde(default = "default_run_hours")]
    pub run_hours: Vec<u32>,
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule { run_hours: default_run_hours() }
    }
}

#[derive(Deserialize)]
pub struct Config {
    pub general: General,
    #[serde(default)]
    pub market: Market,
    #[serde(default)]
    pub site_defaults: SiteDefaults,
    pub solar_forecast: SolarForecastParameters,
    pub day_ahead: DayAheadParameters,
    #[serde(default)]
    pub advice: AdviceParameters,
    pub store: StoreParameters,
    #[serde(default)]
    pub schedule: Schedule,
}

fn default_timezone() -> Tz { chrono_tz::Europe::Brussels }
fn default_cutoff_hour() -> u32 { 14 }
fn default_solar_url() -> String { "https://api.forecast.solar".to_string() }
fn default_day_ahead_url() -> String { "https://web-api.tp.entsoe.eu/api".to_string() }
fn default_document_type() -> String { "A44".to_string() }
fn default_timeout_secs() -> u64 { 30 }
fn default_run_hours() -> Vec<u32> { vec![0, 14] }

/// Loads the configuration file and returns a struct with all configuration items
///
/// # Arguments
///
/// * 'config_path' - path to the configuration file
pub fn load_config(config_path: &str) -> Result<Config, LoadConfigurationError> {
    let toml = fs::read_to_string(config_path)?;

    parse_config(&toml)
}

/// Parses and validates configuration
///
/// # Arguments
///
/// * 'toml' - configuration in toml format
pub fn parse_config(toml: &str) -> Result<Config, LoadConfigurationError> {
    let config: Config = toml::from_str(toml)?;

    if config.market.publication_cutoff_hour > 23 {
        return Err(LoadConfigurationError::Invalid(format!("publication_cutoff_hour {} is not an hour of day", config.market.publication_cutoff_hour)));
    }
    if config.schedule.run_hours.is_empty() || config.schedule.run_hours.iter().any(|h| *h > 23) {
        return Err(LoadConfigurationError::Invalid(format!("run_hours {:?} must be non-empty hours of day", config.schedule.run_hours)));
    }
    if config.solar_forecast.timeout_secs == 0 || config.day_ahead.timeout_secs == 0 {
        return Err(LoadConfigurationError::Invalid("provider timeouts must be positive".to_string()));
    }

    Ok(config)
}

/// Error depicting errors that occur while loading configuration
///
#[derive(Debug, Error)]
pub enum LoadConfigurationError {
    #[error("FileError: {0}")]
    FileError(#[from] std::io::Error),
    #[error("ParseError: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid: {0}")]
    Invalid(String),
}
