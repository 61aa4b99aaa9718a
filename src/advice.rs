use std::fmt;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::config::AdviceParameters;
use crate::consumption::Consumption;
use crate::manager_store::errors::StoreError;
use crate::manager_store::SampleStore;
use crate::models::{Calculation, ContractType, SeriesKind, User};
use crate::time_key::{local_day_start, HourKey, TimeKeyError};

/// Share of the purchase price paid for energy fed into the grid
const FEED_IN_FACTOR: f64 = 0.8;
/// Assumed peak price relative to the current price when stored energy is used later
const PEAK_FACTOR: f64 = 1.5;

/// What to do with the energy of an hour
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    FeedIn,
    SelfConsume,
    Store,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Action::FeedIn => write!(f, "feed-in"),
            Action::SelfConsume => write!(f, "self-consume"),
            Action::Store => write!(f, "store"),
        }
    }
}

/// Advice for one user and hour
#[derive(Debug, PartialEq, Serialize)]
pub struct Recommendation {
    pub user_id: String,
    pub hour: HourKey,
    pub action: Action,
    pub expected_savings: f64,
    pub solar_output: f64,
    pub predicted_usage: f64,
    pub price: f64,
    pub reason: String,
}

/// Picks the action for an hour.
///
/// Without solar output, cheap grid energy is stored and otherwise consumed. A deficit is
/// always self-consumed. A surplus is stored when prices are high and a battery exists,
/// otherwise fed in.
///
/// # Arguments
///
/// * 'solar_output' - forecast production in Wh
/// * 'predicted_usage' - predicted consumption in Wh
/// * 'price' - energy price for the hour
/// * 'params' - thresholds and battery capacity
pub fn decide(solar_output: f64, predicted_usage: f64, price: f64, params: &AdviceParameters) -> Action {
    let surplus = solar_output - predicted_usage;

    if solar_output == 0.0 {
        if price < params.low_price_threshold {
            Action::Store
        } else {
            Action::SelfConsume
        }
    } else if surplus < 0.0 {
        Action::SelfConsume
    } else if price > params.high_price_threshold && params.battery_capacity_wh > 0.0 {
        Action::Store
    } else {
        Action::FeedIn
    }
}

/// Expected savings of an action, never negative and rounded to two decimals
///
/// # Arguments
///
/// * 'solar_output' - forecast production in Wh
/// * 'predicted_usage' - predicted consumption in Wh
/// * 'price' - energy price for the hour
/// * 'action' - the chosen action
/// * 'battery_capacity_wh' - usable battery capacity in Wh
pub fn savings(solar_output: f64, predicted_usage: f64, price: f64, action: Action, battery_capacity_wh: f64) -> f64 {
    let surplus = solar_output - predicted_usage;

    let savings = match action {
        Action::FeedIn => surplus * price * FEED_IN_FACTOR / 1000.0,
        Action::SelfConsume => solar_output.min(predicted_usage) * price / 1000.0,
        Action::Store => surplus.min(battery_capacity_wh) * (price * PEAK_FACTOR - price) / 1000.0,
    };

    round_to_two_decimals(savings).max(0.0)
}

fn round_to_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn explain(action: Action, solar_output: f64, predicted_usage: f64, price: f64, savings: f64, params: &AdviceParameters) -> String {
    match action {
        Action::FeedIn => format!("solar surplus of {}Wh can be fed into the grid", solar_output - predicted_usage),
        Action::SelfConsume => format!("use solar output directly and save {:.2}", savings),
        Action::Store if price < params.low_price_threshold => "charge the battery with cheap grid energy for later use".to_string(),
        Action::Store => "charge the battery with solar surplus for later use".to_string(),
    }
}

fn explain_stored(action: Action) -> String {
    match action {
        Action::FeedIn => "optimal moment to feed energy into the grid",
        Action::SelfConsume => "use solar energy directly for maximum savings",
        Action::Store => "store energy in the battery for use during peak hours",
    }.to_string()
}

/// Struct for producing advice and persisted calculations from stored samples
pub struct Advisor {
    store: Arc<dyn SampleStore>,
    consumption: Consumption,
    tz: Tz,
    params: AdviceParameters,
}

impl Advisor {
    /// Returns a new Advisor
    ///
    /// # Arguments
    ///
    /// * 'store' - sample store
    /// * 'tz' - market timezone
    /// * 'params' - advice thresholds and fallbacks
    pub fn new(store: Arc<dyn SampleStore>, tz: Tz, params: &AdviceParameters) -> Advisor {
        Advisor { store, consumption: Consumption::new(tz), tz, params: params.clone() }
    }

    /// Returns the recommendation for the hour containing the given instant.
    ///
    /// A stored calculation for the hour takes precedence. Missing samples degrade to zero
    /// solar output, a fallback price and the usage predictor's estimate.
    ///
    /// # Arguments
    ///
    /// * 'user_id' - the user to advise
    /// * 'instant' - an instant within the hour to advise on
    pub async fn get_advice(&self, user_id: &str, instant: DateTime<Utc>) -> Result<Recommendation, AdviceError> {
        let hour = HourKey::from_instant(&instant)?;
        let user = self.store.user(user_id).await?;
        let solar_output = self.store.sample_at(user_id, SeriesKind::Forecast, hour).await?.unwrap_or(0.0);
        let price = match self.store.sample_at(user_id, SeriesKind::Price, hour).await? {
            Some(price) => price,
            None => {
                let price = self.fallback_price(user.as_ref());
                debug!("no price stored for user {} at {}, using {}", user_id, hour, price);
                price
            }
        };

        if let Some(calculation) = self.store.calculation(user_id, hour).await? {
            return Ok(Recommendation {
                user_id: user_id.to_string(),
                hour,
                action: calculation.action,
                expected_savings: calculation.predicted_savings,
                solar_output,
                predicted_usage: calculation.predicted_usage,
                price,
                reason: explain_stored(calculation.action),
            });
        }

        let predicted_usage = self.consumption.predict(&*self.store, user_id, hour.instant()).await;
        let action = decide(solar_output, predicted_usage, price, &self.params);
        let expected_savings = savings(solar_output, predicted_usage, price, action, self.params.battery_capacity_wh);

        Ok(Recommendation {
            user_id: user_id.to_string(),
            hour,
            action,
            expected_savings,
            solar_output,
            predicted_usage,
            price,
            reason: explain(action, solar_output, predicted_usage, price, expected_savings, &self.params),
        })
    }

    /// Persists calculations for the upcoming hours of the given number of local days,
    /// starting with today. Past hours, hours already calculated and hours without both a
    /// forecast and a price are skipped. Returns the number of calculations stored.
    ///
    /// # Arguments
    ///
    /// * 'user_id' - the user to calculate for
    /// * 'days' - number of local days to cover
    /// * 'now' - current time
    pub async fn generate_calculations(&self, user_id: &str, days: u32, now: DateTime<Utc>) -> Result<usize, AdviceError> {
        if self.store.user(user_id).await?.is_none() {
            return Err(AdviceError::UnknownUser(user_id.to_string()));
        }
        info!("generating calculations for user {} for {} days", user_id, days);

        let end = HourKey::from_instant(&local_day_start(now, self.tz, days as i64)?)?;
        let mut next = HourKey::from_instant(&local_day_start(now, self.tz, 0)?)?;
        let mut generated = 0;

        while next < end {
            let hour = next;
            next = next.add_hours(1)?;

            if hour.instant() < now || self.store.calculation(user_id, hour).await?.is_some() {
                continue;
            }

            let solar_output = self.store.sample_at(user_id, SeriesKind::Forecast, hour).await?;
            let price = self.store.sample_at(user_id, SeriesKind::Price, hour).await?;
            let (Some(solar_output), Some(price)) = (solar_output, price) else {
                debug!("missing data for user {} at {}", user_id, hour);
                continue;
            };

            let predicted_usage = self.consumption.predict(&*self.store, user_id, hour.instant()).await;
            let action = decide(solar_output, predicted_usage, price, &self.params);
            let predicted_savings = savings(solar_output, predicted_usage, price, action, self.params.battery_capacity_wh);

            let calculation = Calculation { user_id: user_id.to_string(), hour, predicted_usage, predicted_savings, action };
            if self.store.insert_calculation(calculation).await? {
                generated += 1;
            }
        }

        info!("generated {} calculations for user {}", generated, user_id);

        Ok(generated)
    }

    fn fallback_price(&self, user: Option<&User>) -> f64 {
        match user {
            Some(User { contract_type: ContractType::Fixed, fixed_price: Some(price), .. }) => *price,
            _ => self.params.default_price,
        }
    }
}

/// Error depicting errors that occur while producing advice
///
#[derive(Debug, Error)]
pub enum AdviceError {
    #[error("UnknownUser: {0}")]
    UnknownUser(String),
    #[error("StoreError: {0}")]
    StoreError(#[from] StoreError),
    #[error("TimestampError: {0}")]
    TimestampError(#[from] TimeKeyError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Brussels;
    use crate::manager_store::MemoryStore;
    use crate::models::HourlySample;

    fn params() -> AdviceParameters {
        AdviceParameters::default()
    }

    fn key(s: &str) -> HourKey {
        s.parse().unwrap()
    }

    async fn store_with_user(contract_type: ContractType, fixed_price: Option<f64>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(User { id: "a".to_string(), contract_type, fixed_price }).await.unwrap();
        store
    }

    #[test]
    fn no_solar_stores_cheap_energy_only() {
        assert_eq!(decide(0.0, 500.0, 30.0, &params()), Action::Store);
        assert_eq!(decide(0.0, 500.0, 80.0, &params()), Action::SelfConsume);
    }

    #[test]
    fn deficit_is_self_consumed_at_any_price() {
        for price in [10.0, 100.0, 400.0] {
            assert_eq!(decide(1000.0, 1500.0, price, &params()), Action::SelfConsume);
        }
    }

    #[test]
    fn expensive_surplus_is_stored() {
        let action = decide(2000.0, 500.0, 200.0, &params());
        assert_eq!(action, Action::Store);
        assert_eq!(savings(2000.0, 500.0, 200.0, action, 5000.0), 150.0);
    }

    #[test]
    fn moderate_surplus_is_fed_in() {
        let action = decide(2000.0, 500.0, 100.0, &params());
        assert_eq!(action, Action::FeedIn);
        assert_eq!(savings(2000.0, 500.0, 100.0, action, 5000.0), 120.0);
    }

    #[test]
    fn surplus_without_battery_is_fed_in() {
        let params = AdviceParameters { battery_capacity_wh: 0.0, ..AdviceParameters::default() };
        assert_eq!(decide(2000.0, 500.0, 200.0, &params), Action::FeedIn);
    }

    #[test]
    fn savings_are_floored_and_rounded() {
        assert_eq!(savings(0.0, 500.0, 30.0, Action::Store, 5000.0), 0.0);
        assert_eq!(savings(1000.0, 1500.0, 33.333, Action::SelfConsume, 5000.0), 33.33);
        assert_eq!(savings(9000.0, 1000.0, 200.0, Action::Store, 5000.0), 500.0);
    }

    #[test]
    fn actions_serialize_in_kebab_case() {
        assert_eq!(serde_json::to_string(&Action::FeedIn).unwrap(), "\"feed-in\"");
        assert_eq!(Action::SelfConsume.to_string(), "self-consume");
    }

    #[tokio::test]
    async fn advice_without_data_uses_fallbacks() {
        let store = store_with_user(ContractType::Variable, None).await;
        let advisor = Advisor::new(store, Brussels, &params());

        // Wednesday in March at 10:00 local, no history gives a usage of 500
        let instant = Utc.with_ymd_and_hms(2025, 3, 12, 9, 17, 0).unwrap();
        let advice = advisor.get_advice("a", instant).await.unwrap();

        assert_eq!(advice.hour, key("2025-03-12T09:00:00Z"));
        assert_eq!(advice.solar_output, 0.0);
        assert_eq!(advice.price, 100.0);
        assert_eq!(advice.predicted_usage, 500.0);
        assert_eq!(advice.action, Action::SelfConsume);
        assert_eq!(advice.expected_savings, 0.0);
    }

    #[tokio::test]
    async fn fixed_contract_price_is_the_fallback() {
        let store = store_with_user(ContractType::Fixed, Some(40.0)).await;
        let advisor = Advisor::new(store, Brussels, &params());

        let advice = advisor.get_advice("a", Utc.with_ymd_and_hms(2025, 3, 12, 9, 0, 0).unwrap()).await.unwrap();

        assert_eq!(advice.price, 40.0);
        assert_eq!(advice.action, Action::Store);
    }

    #[tokio::test]
    async fn stored_samples_drive_advice() {
        let store = store_with_user(ContractType::Variable, None).await;
        let hour = key("2025-03-12T09:00:00Z");
        store.insert_samples("a", SeriesKind::Forecast, vec![HourlySample { hour, value: 2000.0 }]).await.unwrap();
        store.insert_samples("a", SeriesKind::Price, vec![HourlySample { hour, value: 200.0 }]).await.unwrap();
        let advisor = Advisor::new(store, Brussels, &params());

        let advice = advisor.get_advice("a", hour.instant()).await.unwrap();

        assert_eq!(advice.action, Action::Store);
        assert_eq!(advice.expected_savings, 150.0);
        assert_eq!(advice.reason, "charge the battery with solar surplus for later use");
    }

    #[tokio::test]
    async fn calculations_cover_upcoming_hours_with_data_once() {
        let store = store_with_user(ContractType::Variable, None).await;
        let now = Brussels.with_ymd_and_hms(2025, 3, 12, 21, 30, 0).unwrap().with_timezone(&Utc);

        // 21:00 local is already underway, 22:00 has both samples, 23:00 lacks a price
        let past = key("2025-03-12T20:00:00Z");
        let next = key("2025-03-12T21:00:00Z");
        let later = key("2025-03-12T22:00:00Z");
        let forecasts = [past, next, later].map(|hour| HourlySample { hour, value: 1000.0 }).to_vec();
        store.insert_samples("a", SeriesKind::Forecast, forecasts).await.unwrap();
        let prices = [past, next].map(|hour| HourlySample { hour, value: 100.0 }).to_vec();
        store.insert_samples("a", SeriesKind::Price, prices).await.unwrap();

        let advisor = Advisor::new(store.clone(), Brussels, &params());

        assert_eq!(advisor.generate_calculations("a", 1, now).await.unwrap(), 1);
        assert_eq!(advisor.generate_calculations("a", 1, now).await.unwrap(), 0);

        let calculation = store.calculation("a", next).await.unwrap().unwrap();
        assert_eq!(calculation.action, Action::FeedIn);
        assert_eq!(calculation.predicted_usage, 500.0);
        assert_eq!(calculation.predicted_savings, 40.0);

        let advice = advisor.get_advice("a", next.instant()).await.unwrap();
        assert_eq!(advice.reason, "optimal moment to feed energy into the grid");
    }

    #[tokio::test]
    async fn calculations_for_unknown_user_fail() {
        let advisor = Advisor::new(Arc::new(MemoryStore::new()), Brussels, &params());
        let result = advisor.generate_calculations("nobody", 7, Utc::now()).await;
        assert!(matches!(result, Err(AdviceError::UnknownUser(_))));
    }
}
