use std::collections::BTreeMap;
use serde::Deserialize;

/// Response of the watt-hours estimate endpoint
#[derive(Deserialize, Debug)]
pub struct EstimateResponse {
    pub result: Option<EstimateResult>,
    pub message: Option<EstimateMessage>,
}

/// The provider has used different field names for the hourly energy map over time
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum EstimateResult {
    Period { watt_hours_period: BTreeMap<String, f64> },
    Cumulative { watt_hours: BTreeMap<String, f64> },
    Plain(BTreeMap<String, f64>),
}

impl EstimateResult {
    pub fn into_watt_hours(self) -> BTreeMap<String, f64> {
        match self {
            EstimateResult::Period { watt_hours_period } => watt_hours_period,
            EstimateResult::Cumulative { watt_hours } => watt_hours,
            EstimateResult::Plain(map) => map,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct EstimateMessage {
    pub text: Option<String>,
    pub info: Option<MessageInfo>,
}

#[derive(Deserialize, Debug)]
pub struct MessageInfo {
    pub timezone: Option<String>,
}
