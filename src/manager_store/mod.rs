pub mod errors;

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use crate::manager_store::errors::StoreError;
use crate::models::{Calculation, HourlySample, SeriesKind, SiteProfile, UsageFilter, UsageSample, User, UserId};
use crate::time_key::HourKey;

/// The persistence operations the ingestion pipeline and the advice layer rely on.
///
/// Samples are append only, a (user, hour) pair is stored at most once per series and
/// calculations are never replaced once written.
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn users(&self) -> Result<Vec<User>, StoreError>;

    async fn user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    async fn site_profile(&self, user_id: &str) -> Result<Option<SiteProfile>, StoreError>;

    /// The dedup set: hours already stored for the user in the given series
    async fn existing_hours(&self, user_id: &str, kind: SeriesKind) -> Result<HashSet<HourKey>, StoreError>;

    /// Inserts samples for hours not yet stored and returns how many were inserted
    async fn insert_samples(&self, user_id: &str, kind: SeriesKind, samples: Vec<HourlySample>) -> Result<usize, StoreError>;

    async fn sample_at(&self, user_id: &str, kind: SeriesKind, hour: HourKey) -> Result<Option<f64>, StoreError>;

    async fn latest_hour(&self, user_id: &str, kind: SeriesKind) -> Result<Option<HourKey>, StoreError>;

    /// Whether any user has a sample at or after `since` in the given series
    async fn has_samples_since(&self, kind: SeriesKind, since: HourKey) -> Result<bool, StoreError>;

    async fn historical_usage(&self, user_id: &str, filter: &UsageFilter) -> Result<Vec<UsageSample>, StoreError>;

    async fn calculation(&self, user_id: &str, hour: HourKey) -> Result<Option<Calculation>, StoreError>;

    /// Stores a calculation unless one exists for the same user and hour, returns whether it was stored
    async fn insert_calculation(&self, calculation: Calculation) -> Result<bool, StoreError>;
}

#[derive(Default, Clone, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    users: BTreeMap<UserId, User>,
    #[serde(default)]
    profiles: BTreeMap<UserId, SiteProfile>,
    #[serde(default)]
    forecasts: BTreeMap<UserId, BTreeMap<HourKey, f64>>,
    #[serde(default)]
    prices: BTreeMap<UserId, BTreeMap<HourKey, f64>>,
    #[serde(default)]
    usage: BTreeMap<UserId, Vec<UsageSample>>,
    #[serde(default)]
    calculations: BTreeMap<UserId, BTreeMap<HourKey, Calculation>>,
}

impl StoreState {
    fn series(&self, user_id: &str, kind: SeriesKind) -> Option<&BTreeMap<HourKey, f64>> {
        match kind {
            SeriesKind::Forecast => self.forecasts.get(user_id),
            SeriesKind::Price => self.prices.get(user_id),
        }
    }

    fn series_mut(&mut self, user_id: &str, kind: SeriesKind) -> &mut BTreeMap<HourKey, f64> {
        let all = match kind {
            SeriesKind::Forecast => &mut self.forecasts,
            SeriesKind::Price => &mut self.prices,
        };
        all.entry(user_id.to_string()).or_default()
    }

    fn all_series(&self, kind: SeriesKind) -> &BTreeMap<UserId, BTreeMap<HourKey, f64>> {
        match kind {
            SeriesKind::Forecast => &self.forecasts,
            SeriesKind::Price => &self.prices,
        }
    }
}

/// In-process store, optionally backed by a JSON snapshot file.
///
/// Every mutation is applied to a copy of the state, which rewrites the snapshot through a
/// temporary file followed by a rename. The copy replaces the live state only once the
/// snapshot is written, so a batch lands in memory and on disk completely or not at all.
pub struct MemoryStore {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl MemoryStore {
    /// Returns a store that lives in memory only
    pub fn new() -> MemoryStore {
        MemoryStore { state: RwLock::new(StoreState::default()), path: None }
    }

    /// Opens a store backed by the given snapshot file, which is created on first write
    ///
    /// # Arguments
    ///
    /// * 'path' - path to the JSON snapshot
    pub async fn open(path: &Path) -> Result<MemoryStore, StoreError> {
        let state = match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json)?,
            Err(e) if e.kind() == ErrorKind::NotFound => StoreState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(MemoryStore { state: RwLock::new(state), path: Some(path.to_path_buf()) })
    }

    /// Creates or updates a user
    pub async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.users.insert(user.id.clone(), user);
        self.commit(&mut state, next).await
    }

    /// Sets the solar site profile of a user
    pub async fn set_site_profile(&self, user_id: &str, profile: SiteProfile) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.profiles.insert(user_id.to_string(), profile);
        self.commit(&mut state, next).await
    }

    /// Appends measured usage for a user
    pub async fn add_usage(&self, user_id: &str, samples: Vec<UsageSample>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.usage.entry(user_id.to_string()).or_default().extend(samples);
        self.commit(&mut state, next).await
    }

    /// Writes the snapshot of the next state and only then makes it the live state
    ///
    /// # Arguments
    ///
    /// * 'current' - the live state, held under the write lock
    /// * 'next' - the state after the mutation
    async fn commit(&self, current: &mut StoreState, next: StoreState) -> Result<(), StoreError> {
        self.persist(&next).await?;
        *current = next;

        Ok(())
    }

    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_vec(state)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        Ok(())
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.state.read().await.users.values().cloned().collect())
    }

    async fn user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.state.read().await.users.get(user_id).cloned())
    }

    async fn site_profile(&self, user_id: &str) -> Result<Option<SiteProfile>, StoreError> {
        Ok(self.state.read().await.profiles.get(user_id).cloned())
    }

    async fn existing_hours(&self, user_id: &str, kind: SeriesKind) -> Result<HashSet<HourKey>, StoreError> {
        let state = self.state.read().await;

        Ok(state.series(user_id, kind).map(|s| s.keys().copied().collect()).unwrap_or_default())
    }

    async fn insert_samples(&self, user_id: &str, kind: SeriesKind, samples: Vec<HourlySample>) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let series = next.series_mut(user_id, kind);

        let mut inserted = 0;
        for sample in samples {
            if !series.contains_key(&sample.hour) {
                series.insert(sample.hour, sample.value);
                inserted += 1;
            }
        }

        if inserted > 0 {
            self.commit(&mut state, next).await?;
        }
        debug!("inserted {} {} samples for user {}", inserted, kind, user_id);

        Ok(inserted)
    }

    async fn sample_at(&self, user_id: &str, kind: SeriesKind, hour: HourKey) -> Result<Option<f64>, StoreError> {
        let state = self.state.read().await;

        Ok(state.series(user_id, kind).and_then(|s| s.get(&hour).copied()))
    }

    async fn latest_hour(&self, user_id: &str, kind: SeriesKind) -> Result<Option<HourKey>, StoreError> {
        let state = self.state.read().await;

        Ok(state.series(user_id, kind).and_then(|s| s.last_key_value().map(|(k, _)| *k)))
    }

    async fn has_samples_since(&self, kind: SeriesKind, since: HourKey) -> Result<bool, StoreError> {
        let state = self.state.read().await;

        Ok(state.all_series(kind).values().any(|s| s.range(since..).next().is_some()))
    }

    async fn historical_usage(&self, user_id: &str, filter: &UsageFilter) -> Result<Vec<UsageSample>, StoreError> {
        let state = self.state.read().await;

        Ok(state.usage
            .get(user_id)
            .map(|u| u.iter().filter(|s| filter.matches(s)).cloned().collect())
            .unwrap_or_default())
    }

    async fn calculation(&self, user_id: &str, hour: HourKey) -> Result<Option<Calculation>, StoreError> {
        let state = self.state.read().await;

        Ok(state.calculations.get(user_id).and_then(|c| c.get(&hour).cloned()))
    }

    async fn insert_calculation(&self, calculation: Calculation) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.calculations.get(&calculation.user_id).is_some_and(|c| c.contains_key(&calculation.hour)) {
            return Ok(false);
        }

        let mut next = state.clone();
        next.calculations.entry(calculation.user_id.clone()).or_default().insert(calculation.hour, calculation);
        self.commit(&mut state, next).await?;

        Ok(true)
    }
}
