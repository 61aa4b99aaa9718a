use std::fmt;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use crate::advice::Action;
use crate::time_key::HourKey;

/// Opaque external identity of a customer, e.g. an email address
pub type UserId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContractType {
    Fixed,
    Variable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub contract_type: ContractType,
    pub fixed_price: Option<f64>,
}

/// Solar site of a user
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteProfile {
    pub lat: f64,
    pub long: f64,
    /// Panel tilt in degrees, 0 is horizontal
    pub tilt: f64,
    /// Panel azimuth in degrees, 0 is south
    pub azimuth: f64,
    /// Rated power per module in watts
    pub module_power: f64,
    pub panel_count: u32,
}

impl SiteProfile {
    /// Installed capacity in kWp
    pub fn installed_kwp(&self) -> f64 {
        self.module_power * self.panel_count as f64 / 1000.0
    }
}

/// The hourly series kept per user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesKind {
    /// Predicted solar production in Wh
    Forecast,
    /// Day-ahead market price
    Price,
}

impl fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SeriesKind::Forecast => write!(f, "forecast"),
            SeriesKind::Price => write!(f, "price"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HourlySample {
    pub hour: HourKey,
    pub value: f64,
}

/// Measured consumption for one local hour
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub date: NaiveDate,
    pub hour: u32,
    pub usage: f64,
}

/// Selects historical usage for a local hour of day, optionally narrowed by weekday and month
#[derive(Clone, Debug, PartialEq)]
pub struct UsageFilter {
    pub hour: u32,
    pub weekday: Option<Weekday>,
    pub month: Option<u32>,
}

impl UsageFilter {
    pub fn exact(hour: u32, weekday: Weekday, month: u32) -> UsageFilter {
        UsageFilter { hour, weekday: Some(weekday), month: Some(month) }
    }

    pub fn hour_only(hour: u32) -> UsageFilter {
        UsageFilter { hour, weekday: None, month: None }
    }

    pub fn matches(&self, sample: &UsageSample) -> bool {
        sample.hour == self.hour
            && self.weekday.is_none_or(|w| sample.date.weekday() == w)
            && self.month.is_none_or(|m| sample.date.month() == m)
    }
}

/// Persisted advice for one user and hour, never replaced once written
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calculation {
    pub user_id: UserId,
    pub hour: HourKey,
    pub predicted_usage: f64,
    pub predicted_savings: f64,
    pub action: Action,
}
