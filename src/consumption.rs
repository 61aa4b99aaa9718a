use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use log::{debug, warn};
use crate::manager_store::SampleStore;
use crate::models::{UsageFilter, UsageSample};

/// Estimate used when the user has no usage history for the hour
const DEFAULT_USAGE: f64 = 500.0;
/// Exact (hour, weekday, month) matches needed before they are trusted over the hour-only mean
const MIN_EXACT_MATCHES: usize = 3;
const WEEKEND_FACTOR: f64 = 1.1;
const WINTER_FACTOR: f64 = 1.2;
const SUMMER_FACTOR: f64 = 0.9;

/// Struct for estimating household consumption for an hour from the user's usage history
///
/// The estimate is a heuristic: a mean of comparable historical hours adjusted for weekends
/// and season. Given the same history it always returns the same value.
pub struct Consumption {
    tz: Tz,
}

impl Consumption {
    /// Returns a new Consumption struct
    ///
    /// # Arguments
    ///
    /// * 'tz' - timezone in which hour of day, weekday and month are evaluated
    pub fn new(tz: Tz) -> Consumption {
        Consumption { tz }
    }

    /// Predicts usage for the hour containing the given instant.
    /// Store failures degrade to the default estimate rather than failing the caller.
    ///
    /// # Arguments
    ///
    /// * 'store' - sample store holding usage history
    /// * 'user_id' - the user to predict for
    /// * 'instant' - the instant to predict for
    pub async fn predict<S: SampleStore + ?Sized>(&self, store: &S, user_id: &str, instant: DateTime<Utc>) -> f64 {
        let local = instant.with_timezone(&self.tz);
        let (hour, weekday, month) = (local.hour(), local.weekday(), local.month());

        let base = match self.base_estimate(store, user_id, hour, weekday, month).await {
            Ok(base) => base,
            Err(e) => {
                warn!("usage history unavailable for user {}, using default: {}", user_id, e);
                DEFAULT_USAGE
            }
        };

        let usage = adjust(base, weekday, month);
        debug!("predicted usage for user {} at {}: {}", user_id, local, usage);

        usage
    }

    async fn base_estimate<S: SampleStore + ?Sized>(&self, store: &S, user_id: &str, hour: u32, weekday: Weekday, month: u32)
        -> Result<f64, crate::manager_store::errors::StoreError> {

        let exact = store.historical_usage(user_id, &UsageFilter::exact(hour, weekday, month)).await?;
        if exact.len() >= MIN_EXACT_MATCHES {
            return Ok(mean(&exact));
        }

        let by_hour = store.historical_usage(user_id, &UsageFilter::hour_only(hour)).await?;
        if by_hour.is_empty() {
            return Ok(DEFAULT_USAGE);
        }

        Ok(mean(&by_hour))
    }
}

fn mean(samples: &[UsageSample]) -> f64 {
    samples.iter().map(|s| s.usage).sum::<f64>() / samples.len() as f64
}

/// Applies weekend and seasonal multipliers and rounds to a whole unit
///
/// # Arguments
///
/// * 'base' - base estimate
/// * 'weekday' - local weekday of the hour
/// * 'month' - local month of the hour, 1 is January
fn adjust(base: f64, weekday: Weekday, month: u32) -> f64 {
    let mut usage = base;

    if matches!(weekday, Weekday::Sat | Weekday::Sun) {
        usage *= WEEKEND_FACTOR;
    }

    match month {
        11 | 12 | 1 | 2 => usage *= WINTER_FACTOR,
        5..=8 => usage *= SUMMER_FACTOR,
        _ => {},
    }

    usage.round()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use chrono_tz::Europe::Brussels;
    use crate::manager_store::MemoryStore;

    fn sample(y: i32, m: u32, d: u32, hour: u32, usage: f64) -> UsageSample {
        UsageSample { date: NaiveDate::from_ymd_opt(y, m, d).unwrap(), hour, usage }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Brussels.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn no_history_uses_adjusted_default() {
        let store = MemoryStore::new();
        let consumption = Consumption::new(Brussels);

        // Wednesday in March, no adjustment
        assert_eq!(consumption.predict(&store, "a", at(2025, 3, 12, 10)).await, 500.0);
        // Saturday in January, weekend and winter
        assert_eq!(consumption.predict(&store, "a", at(2025, 1, 11, 10)).await, 660.0);
        // Wednesday in July, summer
        assert_eq!(consumption.predict(&store, "a", at(2025, 7, 9, 10)).await, 450.0);
    }

    #[tokio::test]
    async fn exact_matches_are_used_when_there_are_enough() {
        let store = MemoryStore::new();
        // Wednesdays in March 2024 at 10:00, plus a Thursday that only counts for the hour mean
        store.add_usage("a", vec![
            sample(2024, 3, 6, 10, 300.0),
            sample(2024, 3, 13, 10, 400.0),
            sample(2024, 3, 20, 10, 500.0),
            sample(2024, 3, 21, 10, 1000.0),
        ]).await.unwrap();

        let usage = Consumption::new(Brussels).predict(&store, "a", at(2025, 3, 12, 10)).await;
        assert_eq!(usage, 400.0);
    }

    #[tokio::test]
    async fn too_few_exact_matches_fall_back_to_hour_mean() {
        let store = MemoryStore::new();
        store.add_usage("a", vec![
            sample(2024, 3, 6, 10, 300.0),
            sample(2024, 3, 13, 10, 400.0),
            sample(2024, 3, 21, 10, 800.0),
            sample(2024, 3, 21, 11, 5000.0),
        ]).await.unwrap();

        let usage = Consumption::new(Brussels).predict(&store, "a", at(2025, 3, 12, 10)).await;
        assert_eq!(usage, 500.0);
    }

    #[tokio::test]
    async fn hour_is_taken_in_local_time() {
        let store = MemoryStore::new();
        store.add_usage("a", vec![sample(2024, 3, 6, 10, 200.0)]).await.unwrap();

        // 09:00 UTC is 10:00 in Brussels during winter time
        let instant = Utc.with_ymd_and_hms(2025, 3, 12, 9, 0, 0).unwrap();
        assert_eq!(Consumption::new(Brussels).predict(&store, "a", instant).await, 200.0);
    }

    #[test]
    fn adjustments_round_to_whole_units() {
        assert_eq!(adjust(333.0, Weekday::Sun, 12), 440.0);
        assert_eq!(adjust(101.0, Weekday::Mon, 6), 91.0);
        assert_eq!(adjust(250.4, Weekday::Tue, 4), 250.0);
    }
}
