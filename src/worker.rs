use std::sync::Arc;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use crate::config::Market;
use crate::manager_day_ahead::errors::DayAheadError;
use crate::manager_day_ahead::{DayAhead, PriceWindow};
use crate::manager_forecast::errors::SolarForecastError;
use crate::manager_forecast::SolarForecast;
use crate::manager_store::errors::StoreError;
use crate::manager_store::SampleStore;
use crate::models::SeriesKind;
use crate::time_key::{local_day_start, HourKey, TimeKeyError};

/// Outcome of refreshing one user
#[derive(Debug, Serialize)]
pub struct RefreshReport {
    pub forecast_count: usize,
    pub rate_count: usize,
    pub message: String,
}

/// Outcome of refreshing all users
#[derive(Debug, Default, Serialize)]
pub struct RunSummary {
    pub success_count: usize,
    pub error_count: usize,
    /// The run stopped early because a provider refused further requests
    pub rate_limited: bool,
    /// The run stopped early on request
    pub cancelled: bool,
}

/// Orchestrates ingestion of solar forecasts and day-ahead prices for users
pub struct Worker {
    store: Arc<dyn SampleStore>,
    forecast: SolarForecast,
    day_ahead: DayAhead,
    tz: Tz,
    cutoff_hour: u32,
}

impl Worker {
    /// Returns a new Worker
    ///
    /// # Arguments
    ///
    /// * 'store' - sample store
    /// * 'forecast' - solar forecast fetcher
    /// * 'day_ahead' - day-ahead price fetcher
    /// * 'market' - market timezone and publication cutoff
    pub fn new(store: Arc<dyn SampleStore>, forecast: SolarForecast, day_ahead: DayAhead, market: &Market) -> Worker {
        Worker { store, forecast, day_ahead, tz: market.timezone, cutoff_hour: market.publication_cutoff_hour }
    }

    /// Returns the price windows to fetch at the given time.
    /// Yesterday through today is always fetched, tomorrow only once the publication cutoff has passed.
    ///
    /// # Arguments
    ///
    /// * 'now' - current time
    pub fn price_windows(&self, now: DateTime<Utc>) -> Result<Vec<PriceWindow>, WorkerError> {
        let tomorrow = local_day_start(now, self.tz, 1)?;
        let mut windows = vec![PriceWindow {
            name: "yesterday-today",
            start: local_day_start(now, self.tz, -1)?,
            end: tomorrow,
        }];

        if now.with_timezone(&self.tz).hour() >= self.cutoff_hour {
            windows.push(PriceWindow { name: "tomorrow", start: tomorrow, end: local_day_start(now, self.tz, 2)? });
        }

        Ok(windows)
    }

    /// Refreshes forecast and prices for one user, forecast first
    ///
    /// # Arguments
    ///
    /// * 'user_id' - the user to refresh
    /// * 'now' - current time
    pub async fn refresh_user(&self, user_id: &str, now: DateTime<Utc>) -> Result<RefreshReport, WorkerError> {
        if self.store.user(user_id).await?.is_none() {
            return Err(WorkerError::UnknownUser(user_id.to_string()));
        }
        let profile = self.store.site_profile(user_id).await?;

        let forecast_count = self.forecast.refresh(&*self.store, user_id, profile.as_ref(), now).await?;

        let mut rate_count = 0;
        for window in self.price_windows(now)? {
            rate_count += self.day_ahead.refresh(&*self.store, user_id, &window).await?;
        }

        Ok(RefreshReport {
            forecast_count,
            rate_count,
            message: format!("stored {} forecast hours and {} prices", forecast_count, rate_count),
        })
    }

    /// Refreshes every user in turn.
    ///
    /// Per-user failures are counted and the run continues, except when a provider rate limits
    /// us, which ends the run. Samples stored before that point are kept. Cancellation is
    /// honoured between users.
    ///
    /// # Arguments
    ///
    /// * 'now' - current time
    /// * 'cancel' - token to stop the run early
    pub async fn refresh_all(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<RunSummary, WorkerError> {
        let users = self.store.users().await?;
        info!("refreshing {} users", users.len());

        let mut summary = RunSummary::default();
        for (index, user) in users.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("refresh cancelled, {} users not processed", users.len() - index);
                summary.cancelled = true;
                break;
            }

            match self.refresh_user(&user.id, now).await {
                Ok(report) => {
                    info!("user {}: {}", user.id, report.message);
                    summary.success_count += 1;
                },
                Err(e) if e.is_rate_limited() => {
                    error!("user {}: rate limited, aborting remaining users: {}", user.id, e);
                    summary.error_count += 1;
                    summary.rate_limited = true;
                    break;
                },
                Err(e) => {
                    error!("user {}: {}", user.id, e);
                    summary.error_count += 1;
                },
            }
        }

        info!("refresh done: {} succeeded, {} failed", summary.success_count, summary.error_count);

        Ok(summary)
    }

    /// Whether stored samples are missing for today, or for tomorrow's prices once they
    /// should have been published
    ///
    /// # Arguments
    ///
    /// * 'now' - current time
    pub async fn needs_refresh(&self, now: DateTime<Utc>) -> Result<bool, WorkerError> {
        let today = HourKey::from_instant(&local_day_start(now, self.tz, 0)?)?;
        let tomorrow = HourKey::from_instant(&local_day_start(now, self.tz, 1)?)?;

        if !self.store.has_samples_since(SeriesKind::Forecast, today).await? {
            info!("no solar forecast stored for today");
            return Ok(true);
        }
        if !self.store.has_samples_since(SeriesKind::Price, today).await? {
            info!("no prices stored for today");
            return Ok(true);
        }
        if now.with_timezone(&self.tz).hour() >= self.cutoff_hour
            && !self.store.has_samples_since(SeriesKind::Price, tomorrow).await? {
            info!("no prices stored for tomorrow");
            return Ok(true);
        }

        Ok(false)
    }
}

/// Error depicting errors that occur while refreshing users
///
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("UnknownUser: {0}")]
    UnknownUser(String),
    #[error("SolarForecastError: {0}")]
    SolarForecastError(#[from] SolarForecastError),
    #[error("DayAheadError: {0}")]
    DayAheadError(#[from] DayAheadError),
    #[error("StoreError: {0}")]
    StoreError(#[from] StoreError),
    #[error("TimestampError: {0}")]
    TimestampError(#[from] TimeKeyError),
}

impl WorkerError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            WorkerError::SolarForecastError(e) => e.is_rate_limited(),
            WorkerError::DayAheadError(e) => e.is_rate_limited(),
            _ => false,
        }
    }
}
