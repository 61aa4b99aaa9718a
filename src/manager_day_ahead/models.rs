use serde::Deserialize;

/// Market document carrying the day-ahead prices
#[derive(Deserialize, Debug)]
pub struct PublicationMarketDocument {
    #[serde(rename = "TimeSeries", default)]
    pub time_series: Vec<TimeSeries>,
}

#[derive(Deserialize, Debug)]
pub struct TimeSeries {
    #[serde(rename = "Period", default)]
    pub periods: Vec<Period>,
}

#[derive(Deserialize, Debug)]
pub struct Period {
    #[serde(rename = "timeInterval")]
    pub time_interval: TimeInterval,
    pub resolution: String,
    #[serde(rename = "Point", default)]
    pub points: Vec<Point>,
}

#[derive(Deserialize, Debug)]
pub struct TimeInterval {
    pub start: String,
    pub end: String,
}

#[derive(Deserialize, Debug)]
pub struct Point {
    pub position: u32,
    #[serde(rename = "price.amount")]
    pub price_amount: f64,
}

/// Document returned instead of prices when the provider has nothing to deliver or refuses
#[derive(Deserialize, Debug)]
pub struct AcknowledgementMarketDocument {
    #[serde(rename = "Reason", default)]
    pub reasons: Vec<Reason>,
}

#[derive(Deserialize, Debug)]
pub struct Reason {
    pub code: Option<String>,
    pub text: Option<String>,
}
