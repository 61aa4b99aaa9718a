pub mod errors;
mod models;

use std::collections::BTreeMap;
use std::time::Duration;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::{info, warn};
use reqwest::Client;
use crate::config::{SiteDefaults, SolarForecastParameters};
use crate::errors::{check_status, UpstreamError};
use crate::manager_forecast::errors::SolarForecastError;
use crate::manager_forecast::models::EstimateResponse;
use crate::manager_store::SampleStore;
use crate::models::{HourlySample, SeriesKind, SiteProfile};
use crate::time_key::{local_day_start, parse_instant, HourKey};

/// Site parameters as sent to the solar forecast provider
#[derive(Clone, Debug, PartialEq)]
pub struct SiteParameters {
    pub lat: f64,
    pub long: f64,
    pub tilt: f64,
    pub azimuth: f64,
    pub kwp: f64,
}

impl SiteParameters {
    /// Uses the user's profile when there is one, otherwise the configured default site
    ///
    /// # Arguments
    ///
    /// * 'profile' - the user's site profile, if registered
    /// * 'defaults' - fallback site
    pub fn resolve(profile: Option<&SiteProfile>, defaults: &SiteDefaults) -> SiteParameters {
        match profile {
            Some(p) => SiteParameters {
                lat: p.lat,
                long: p.long,
                tilt: p.tilt,
                azimuth: p.azimuth,
                kwp: p.installed_kwp(),
            },
            None => SiteParameters {
                lat: defaults.lat,
                long: defaults.long,
                tilt: defaults.tilt,
                azimuth: defaults.azimuth,
                kwp: defaults.kwp,
            },
        }
    }
}

/// Struct for fetching and storing hourly solar production estimates
pub struct SolarForecast {
    client: Client,
    base_url: String,
    defaults: SiteDefaults,
    tz: Tz,
}

impl SolarForecast {
    /// Returns a SolarForecast struct ready for fetching estimates
    ///
    /// # Arguments
    ///
    /// * 'config' - provider configuration
    /// * 'defaults' - site used for users without a profile
    /// * 'tz' - market timezone, used for provider timestamps lacking a timezone hint
    pub fn new(config: &SolarForecastParameters, defaults: &SiteDefaults, tz: Tz) -> Result<SolarForecast, SolarForecastError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("home_energy_advisor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SolarForecastError::ClientError(e.to_string()))?;

        Ok(SolarForecast {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            defaults: defaults.clone(),
            tz,
        })
    }

    /// Fetches the production estimate for a user's site and stores the hours not yet known.
    /// Returns the number of stored samples, zero new hours is not an error.
    ///
    /// The provider is not called at all when stored estimates already reach into tomorrow.
    ///
    /// # Arguments
    ///
    /// * 'store' - sample store
    /// * 'user_id' - the user to refresh
    /// * 'profile' - the user's site profile, if registered
    /// * 'now' - current time
    pub async fn refresh<S: SampleStore + ?Sized>(&self, store: &S, user_id: &str, profile: Option<&SiteProfile>, now: DateTime<Utc>) -> Result<usize, SolarForecastError> {
        let tomorrow = HourKey::from_instant(&local_day_start(now, self.tz, 1)?)?;
        if let Some(latest) = store.latest_hour(user_id, SeriesKind::Forecast).await? {
            if latest >= tomorrow {
                info!("solar forecast for user {} already reaches {}, skipping", user_id, latest);
                return Ok(0);
            }
        }

        let site = SiteParameters::resolve(profile, &self.defaults);
        if profile.is_none() {
            warn!("no site profile for user {}, using default site", user_id);
        }

        let body = self.get_estimate(&site).await?;
        let estimate = parse_estimate(&body, self.tz)?;

        let existing = store.existing_hours(user_id, SeriesKind::Forecast).await?;
        let samples = estimate
            .into_iter()
            .filter(|(hour, _)| !existing.contains(hour))
            .map(|(hour, value)| HourlySample { hour, value })
            .collect::<Vec<HourlySample>>();

        if samples.is_empty() {
            info!("no new solar forecast hours for user {}", user_id);
            return Ok(0);
        }

        let inserted = store.insert_samples(user_id, SeriesKind::Forecast, samples).await?;
        info!("stored {} solar forecast hours for user {}", inserted, user_id);

        Ok(inserted)
    }

    /// Requests the hourly watt-hour estimate for a site
    ///
    /// # Arguments
    ///
    /// * 'site' - the site to request an estimate for
    async fn get_estimate(&self, site: &SiteParameters) -> Result<String, UpstreamError> {
        let url = format!("{}/estimate/watthours/period/{}/{}/{}/{}/{}",
            self.base_url, site.lat, site.long, site.tilt, site.azimuth, site.kwp);
        info!("requesting solar forecast: {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        check_status(status, &body)?;

        Ok(body)
    }
}

/// Parses an estimate response into watt-hours per canonical hour.
///
/// Timestamps are site-local and carry no offset, they are read in the timezone the provider
/// reports, falling back to `fallback_tz`. Should two entries land in the same hour, the first
/// one is kept.
///
/// # Arguments
///
/// * 'body' - response body
/// * 'fallback_tz' - timezone to use when the response has no timezone hint
pub fn parse_estimate(body: &str, fallback_tz: Tz) -> Result<BTreeMap<HourKey, f64>, SolarForecastError> {
    let response: EstimateResponse = serde_json::from_str(body)
        .map_err(|e| SolarForecastError::UnrecognizedForecastFormat(e.to_string()))?;

    let tz = response.message
        .as_ref()
        .and_then(|m| m.info.as_ref())
        .and_then(|i| i.timezone.as_deref())
        .and_then(|t| t.parse::<Tz>().ok())
        .unwrap_or(fallback_tz);

    let Some(result) = response.result else {
        let text = response.message.and_then(|m| m.text).unwrap_or_default();
        return Err(SolarForecastError::UnrecognizedForecastFormat(format!("response without result: {}", text)));
    };

    let mut estimate: BTreeMap<HourKey, f64> = BTreeMap::new();
    for (timestamp, watt_hours) in result.into_watt_hours() {
        let hour = HourKey::from_instant(&parse_instant(&timestamp, tz)?)?;
        estimate.entry(hour).or_insert(watt_hours);
    }

    Ok(estimate)
}
