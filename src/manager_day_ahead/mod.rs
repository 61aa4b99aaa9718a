pub mod errors;
mod models;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use chrono::{DateTime, TimeDelta};
use chrono_tz::Tz;
use log::{debug, info};
use reqwest::{header, Client, StatusCode};
use crate::config::DayAheadParameters;
use crate::errors::{check_status, UpstreamError};
use crate::manager_day_ahead::errors::DayAheadError;
use crate::manager_day_ahead::models::{AcknowledgementMarketDocument, PublicationMarketDocument};
use crate::manager_store::SampleStore;
use crate::models::{HourlySample, SeriesKind};
use crate::time_key::{parse_instant, HourKey};

const ACKNOWLEDGEMENT_ROOT: &str = "Acknowledgement_MarketDocument";
const NO_DATA_TEXT: &str = "No matching data found";

/// A local time window to request prices for, end is non-inclusive
#[derive(Clone, Debug)]
pub struct PriceWindow {
    pub name: &'static str,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
}

impl PriceWindow {
    /// Window bounds in the provider's local `YYYYMMDDHHMM` form
    pub fn period(&self) -> (String, String) {
        (self.start.format("%Y%m%d%H%M").to_string(), self.end.format("%Y%m%d%H%M").to_string())
    }
}

impl fmt::Display for PriceWindow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (start, end) = self.period();
        write!(f, "{} ({} - {})", self.name, start, end)
    }
}

/// What the provider answered for a window
#[derive(Debug)]
pub enum MarketDocument {
    Publication(PublicationMarketDocument),
    /// Nothing published for the window (yet), with the provider's reason
    NoData(String),
}

/// Running mean of the points falling into one hour
#[derive(Default, Debug)]
struct HourlyMean {
    sum: f64,
    count: u32,
}

impl HourlyMean {
    fn add(&mut self, price: f64) {
        self.sum += price;
        self.count += 1;
    }

    fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }
}

/// Struct for fetching and storing day-ahead market prices
pub struct DayAhead {
    client: Client,
    base_url: String,
    security_token: String,
    document_type: String,
    in_domain: String,
    out_domain: String,
}

impl DayAhead {
    /// Returns a DayAhead struct ready for fetching prices
    ///
    /// # Arguments
    ///
    /// * 'config' - provider configuration
    pub fn new(config: &DayAheadParameters) -> Result<DayAhead, DayAheadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DayAheadError::ClientError(e.to_string()))?;

        Ok(DayAhead {
            client,
            base_url: config.base_url.clone(),
            security_token: config.security_token.clone(),
            document_type: config.document_type.clone(),
            in_domain: config.in_domain.clone(),
            out_domain: config.out_domain.clone(),
        })
    }

    /// Fetches prices for a window and stores the hours not yet known for the user.
    /// Returns the number of stored samples; a window without published prices yields zero.
    ///
    /// # Arguments
    ///
    /// * 'store' - sample store
    /// * 'user_id' - the user to store prices for
    /// * 'window' - local time window to fetch
    pub async fn refresh<S: SampleStore + ?Sized>(&self, store: &S, user_id: &str, window: &PriceWindow) -> Result<usize, DayAheadError> {
        let document = match self.get_document(window).await? {
            MarketDocument::NoData(reason) => {
                info!("no day-ahead prices available for {}: {}", window, reason);
                return Ok(0);
            },
            MarketDocument::Publication(document) => document,
        };

        let prices = hourly_prices(&document)?;
        info!("received {} hourly prices for {}", prices.len(), window);

        let existing = store.existing_hours(user_id, SeriesKind::Price).await?;
        let samples = prices
            .into_iter()
            .filter(|(hour, _)| !existing.contains(hour))
            .map(|(hour, value)| HourlySample { hour, value })
            .collect::<Vec<HourlySample>>();

        if samples.is_empty() {
            info!("no new prices to insert for {}, all already exist", window);
            return Ok(0);
        }

        let inserted = store.insert_samples(user_id, SeriesKind::Price, samples).await?;
        info!("stored {} new prices for user {} from {}", inserted, user_id, window);

        Ok(inserted)
    }

    /// Requests the market document for a window
    ///
    /// # Arguments
    ///
    /// * 'window' - local time window to fetch
    async fn get_document(&self, window: &PriceWindow) -> Result<MarketDocument, DayAheadError> {
        let (period_start, period_end) = window.period();
        info!("fetching day-ahead prices for {}", window);

        let query = [
            ("securityToken", self.security_token.as_str()),
            ("documentType", self.document_type.as_str()),
            ("in_Domain", self.in_domain.as_str()),
            ("out_Domain", self.out_domain.as_str()),
            ("periodStart", period_start.as_str()),
            ("periodEnd", period_end.as_str()),
        ];

        let response = self.client
            .get(&self.base_url)
            .header(header::ACCEPT, "application/xml")
            .query(&query)
            .send()
            .await
            .map_err(UpstreamError::from)?;
        let status = response.status();
        let body = response.text().await.map_err(UpstreamError::from)?;
        debug!("response status for {}: {}", window.name, status);

        // Refusals come as client errors carrying an acknowledgement, which holds the reason
        let acknowledged = status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS && is_acknowledgement(&body);
        if !acknowledged {
            check_status(status, &body)?;
        }

        parse_document(&body)
    }
}

fn is_acknowledgement(body: &str) -> bool {
    body.contains(ACKNOWLEDGEMENT_ROOT)
}

/// Parses either a price publication or an acknowledgement.
/// An acknowledgement saying no data matched is not an error, any other is a rejection.
///
/// # Arguments
///
/// * 'body' - the XML document
pub fn parse_document(body: &str) -> Result<MarketDocument, DayAheadError> {
    if is_acknowledgement(body) {
        let ack: AcknowledgementMarketDocument = quick_xml::de::from_str(body)?;
        let reason = ack.reasons.first();
        let text = reason
            .and_then(|r| r.text.clone())
            .unwrap_or_else(|| "Unknown error".to_string());
        debug!("acknowledgement reason: {}", text);

        if text.contains(NO_DATA_TEXT) {
            return Ok(MarketDocument::NoData(text));
        }
        let code = reason.and_then(|r| r.code.as_deref()).unwrap_or("?");
        return Err(UpstreamError::Rejected(format!("[{}] {}", code, text)).into());
    }

    Ok(MarketDocument::Publication(quick_xml::de::from_str(body)?))
}

/// Combines all points of a publication into one price per canonical hour.
///
/// A point's instant is its period start plus (position - 1) resolution steps and must fall
/// before the period end. Points sharing an hour are averaged from their running sum and
/// count, so arrival order does not matter.
/// Results are rounded to four decimals.
///
/// # Arguments
///
/// * 'document' - the price publication
pub fn hourly_prices(document: &PublicationMarketDocument) -> Result<BTreeMap<HourKey, f64>, DayAheadError> {
    let mut hourly: BTreeMap<HourKey, HourlyMean> = BTreeMap::new();

    for series in &document.time_series {
        for period in &series.periods {
            let start = parse_instant(&period.time_interval.start, chrono_tz::UTC)?;
            let end = parse_instant(&period.time_interval.end, chrono_tz::UTC)?;
            let step = parse_resolution(&period.resolution)?;
            debug!("period {} - {} at {}, {} points",
                period.time_interval.start, period.time_interval.end, period.resolution, period.points.len());

            for point in &period.points {
                if point.position == 0 {
                    return Err(DayAheadError::DocumentError("point position must start at 1".to_string()));
                }
                let out_of_range = || DayAheadError::DocumentError(format!("position {} out of range", point.position));
                let steps = i32::try_from(point.position - 1).map_err(|_| out_of_range())?;
                let instant = step
                    .checked_mul(steps)
                    .and_then(|offset| start.checked_add_signed(offset))
                    .filter(|instant| *instant < end)
                    .ok_or_else(out_of_range)?;
                let hour = HourKey::from_instant(&instant)?;

                hourly.entry(hour).or_default().add(point.price_amount);
            }
        }
    }

    Ok(hourly
        .into_iter()
        .map(|(hour, mean)| (hour, round_to_four_decimals(mean.mean())))
        .collect())
}

/// Parses an ISO 8601 resolution such as `PT15M` or `PT1H`
///
/// # Arguments
///
/// * 'resolution' - the resolution string
fn parse_resolution(resolution: &str) -> Result<TimeDelta, DayAheadError> {
    let unsupported = || DayAheadError::DocumentError(format!("unsupported resolution: {}", resolution));

    let value = resolution.strip_prefix("PT").ok_or_else(unsupported)?;
    let unit_at = value.char_indices().last().map(|(i, _)| i).ok_or_else(unsupported)?;
    let (amount, unit) = value.split_at(unit_at);
    let amount: i64 = amount.parse().map_err(|_| unsupported())?;
    if amount <= 0 {
        return Err(unsupported());
    }

    let step = match unit {
        "M" => TimeDelta::try_minutes(amount),
        "H" => TimeDelta::try_hours(amount),
        _ => None,
    };

    step.ok_or_else(unsupported)
}

/// Rounds values to four decimals
///
/// # Arguments
///
/// * 'price' - the price to round
fn round_to_four_decimals(price: f64) -> f64 {
    (price * 10000f64).round() / 10000f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Brussels;
    use mockito::{Matcher, Server};
    use crate::manager_store::MemoryStore;

    fn publication(resolution: &str, points: &[(u32, f64)]) -> String {
        let points = points
            .iter()
            .map(|(p, a)| format!("<Point><position>{}</position><price.amount>{}</price.amount></Point>", p, a))
            .collect::<String>();
        format!(r#"<?xml version="1.0" encoding="UTF-8"?>
<Publication_MarketDocument xmlns="urn:iec62325.351:tc57wg16:451-3:publicationdocument:7:3">
    <mRID>d1</mRID>
    <type>A44</type>
    <TimeSeries>
        <mRID>1</mRID>
        <currency_Unit.name>EUR</currency_Unit.name>
        <price_Measure_Unit.name>MWH</price_Measure_Unit.name>
        <curveType>A01</curveType>
        <Period>
            <timeInterval>
                <start>2024-12-31T23:00Z</start>
                <end>2025-01-01T23:00Z</end>
            </timeInterval>
            <resolution>{}</resolution>
            {}
        </Period>
    </TimeSeries>
</Publication_MarketDocument>"#, resolution, points)
    }

    fn acknowledgement(code: &str, text: &str) -> String {
        format!(r#"<?xml version="1.0" encoding="UTF-8"?>
<Acknowledgement_MarketDocument xmlns="urn:iec62325.351:tc57wg16:451-1:acknowledgementdocument:7:0">
    <mRID>a1</mRID>
    <Reason>
        <code>{}</code>
        <text>{}</text>
    </Reason>
</Acknowledgement_MarketDocument>"#, code, text)
    }

    fn prices(body: &str) -> BTreeMap<HourKey, f64> {
        match parse_document(body).unwrap() {
            MarketDocument::Publication(d) => hourly_prices(&d).unwrap(),
            MarketDocument::NoData(r) => panic!("unexpected no data: {}", r),
        }
    }

    fn key(s: &str) -> HourKey {
        s.parse().unwrap()
    }

    fn window() -> PriceWindow {
        PriceWindow {
            name: "yesterday-today",
            start: Brussels.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            end: Brussels.with_ymd_and_hms(2025, 1, 3, 0, 0, 0).unwrap(),
        }
    }

    fn day_ahead(url: &str) -> DayAhead {
        DayAhead::new(&DayAheadParameters {
            base_url: format!("{}/api", url),
            security_token: "secret".to_string(),
            document_type: "A44".to_string(),
            in_domain: "10YBE----------2".to_string(),
            out_domain: "10YBE----------2".to_string(),
            timeout_secs: 5,
        }).unwrap()
    }

    #[test]
    fn hourly_points_map_to_consecutive_hours() {
        let prices = prices(&publication("PT60M", &[(1, 85.5), (2, 80.25), (3, 70.0)]));

        assert_eq!(prices.len(), 3);
        assert_eq!(prices[&key("2024-12-31T23:00:00Z")], 85.5);
        assert_eq!(prices[&key("2025-01-01T00:00:00Z")], 80.25);
        assert_eq!(prices[&key("2025-01-01T01:00:00Z")], 70.0);
    }

    #[test]
    fn quarter_hours_are_averaged_per_hour() {
        let points = [(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0), (5, 50.0), (6, 60.0), (7, 70.0), (8, 80.0)];
        let prices = prices(&publication("PT15M", &points));

        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&key("2024-12-31T23:00:00Z")], 25.0);
        assert_eq!(prices[&key("2025-01-01T00:00:00Z")], 65.0);
    }

    #[test]
    fn averaging_ignores_point_order() {
        let ordered = prices(&publication("PT15M", &[(1, 12.0), (2, 3.5), (3, 40.0), (4, 7.25)]));
        let shuffled = prices(&publication("PT15M", &[(3, 40.0), (1, 12.0), (4, 7.25), (2, 3.5)]));

        assert_eq!(ordered, shuffled);
        assert_eq!(ordered[&key("2024-12-31T23:00:00Z")], 15.6875);
    }

    #[test]
    fn hourly_means_are_rounded_to_four_decimals() {
        let prices = prices(&publication("PT20M", &[(1, 1.0), (2, 1.0), (3, 2.0)]));
        assert_eq!(prices[&key("2024-12-31T23:00:00Z")], 1.3333);
    }

    #[test]
    fn no_matching_data_is_not_an_error() {
        let body = acknowledgement("999", "No matching data found for Data item Day-ahead Prices [12.1.D]");
        assert!(matches!(parse_document(&body).unwrap(), MarketDocument::NoData(_)));
    }

    #[test]
    fn other_acknowledgements_are_rejections() {
        let body = acknowledgement("A02", "Invalid domain");
        match parse_document(&body) {
            Err(DayAheadError::UpstreamError(UpstreamError::Rejected(m))) => assert_eq!(m, "[A02] Invalid domain"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_resolutions_are_document_errors() {
        let body = publication("P1D", &[(1, 1.0)]);
        let MarketDocument::Publication(document) = parse_document(&body).unwrap() else { panic!("expected publication") };
        assert!(matches!(hourly_prices(&document), Err(DayAheadError::DocumentError(_))));

        assert_eq!(parse_resolution("PT1H").unwrap(), TimeDelta::hours(1));
        assert_eq!(parse_resolution("PT30M").unwrap(), TimeDelta::minutes(30));
        assert!(parse_resolution("PT0M").is_err());
        assert!(parse_resolution("PTM").is_err());
    }

    #[test]
    fn out_of_range_documents_are_document_errors() {
        for (resolution, position) in [
            ("PT99999999999999999H", 1),
            ("PT100000000H", 30),
            ("PT60M", 2147483648),
            ("PT60M", u32::MAX),
            ("PT60M", 25),
        ] {
            let body = publication(resolution, &[(position, 10.0)]);
            let MarketDocument::Publication(document) = parse_document(&body).unwrap() else { panic!("expected publication") };
            assert!(matches!(hourly_prices(&document), Err(DayAheadError::DocumentError(_))), "{} at {}", resolution, position);
        }
    }

    #[test]
    fn window_period_is_local_time() {
        assert_eq!(window().period(), ("202501010000".to_string(), "202501030000".to_string()));
    }

    #[tokio::test]
    async fn refresh_inserts_once_and_is_idempotent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("securityToken".into(), "secret".into()),
                Matcher::UrlEncoded("documentType".into(), "A44".into()),
                Matcher::UrlEncoded("periodStart".into(), "202501010000".into()),
                Matcher::UrlEncoded("periodEnd".into(), "202501030000".into()),
            ]))
            .with_status(200)
            .with_body(publication("PT15M", &[(1, 10.0), (2, 20.0), (5, 50.0)]))
            .expect(2)
            .create_async()
            .await;

        let store = MemoryStore::new();
        let day_ahead = day_ahead(&server.url());

        let first = day_ahead.refresh(&store, "a", &window()).await.unwrap();
        let second = day_ahead.refresh(&store, "a", &window()).await.unwrap();

        assert_eq!((first, second), (2, 0));
        assert_eq!(store.sample_at("a", SeriesKind::Price, key("2024-12-31T23:00:00Z")).await.unwrap(), Some(15.0));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unpublished_window_yields_zero() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(acknowledgement("999", "No matching data found for Data item"))
            .create_async()
            .await;

        let store = MemoryStore::new();
        assert_eq!(day_ahead(&server.url()).refresh(&store, "a", &window()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refusal_with_acknowledgement_carries_reason() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api")
            .match_query(Matcher::Any)
            .with_status(400)
            .with_body(acknowledgement("999", "No matching data found"))
            .create_async()
            .await;
        let store = MemoryStore::new();
        assert_eq!(day_ahead(&server.url()).refresh(&store, "a", &window()).await.unwrap(), 0);

        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(acknowledgement("999", "Unauthorized. Missing or invalid security token"))
            .create_async()
            .await;
        let err = day_ahead(&server.url()).refresh(&store, "a", &window()).await.unwrap_err();
        match err {
            DayAheadError::UpstreamError(UpstreamError::Rejected(m)) => assert!(m.contains("security token")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn rate_limit_is_reported() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/api").match_query(Matcher::Any).with_status(429).create_async().await;

        let store = MemoryStore::new();
        let err = day_ahead(&server.url()).refresh(&store, "a", &window()).await.unwrap_err();

        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn server_errors_are_unavailable() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/api").match_query(Matcher::Any).with_status(503).with_body("down").create_async().await;

        let store = MemoryStore::new();
        let err = day_ahead(&server.url()).refresh(&store, "a", &window()).await.unwrap_err();

        assert!(matches!(err, DayAheadError::UpstreamError(UpstreamError::Unavailable(_))));
        assert!(store.latest_hour("a", SeriesKind::Price).await.unwrap().is_none());
    }
}
