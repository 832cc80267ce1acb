//! File-backed provider directory.
//!
//! A snapshot is a YAML or JSON document listing providers, their distances to the postal codes
//! they serve, and pre-composed teams:
//!
//! ```yaml
//! providers:
//!   - id: 0b5c3f9e-5d0a-4f7e-9a59-2d7f1f8b9a01
//!     kind: freelancer
//!     service_categories: [deep_cleaning]
//!     hourly_rate_cents: 3200
//!     rating_average: 4.7
//!     rating_count: 31
//!     eco_offering: true
//!     distances_km:
//!       "1000": 4.2
//! teams:
//!   - id: 6c1d1e4a-3b0b-4d44-8c77-0f2d7f9b0c11
//!     name: North crew
//!     preferred_size: 2
//!     members: [0b5c3f9e-5d0a-4f7e-9a59-2d7f1f8b9a01]
//! ```
//!
//! [`SnapshotDirectory`] serves both [`ProviderDirectory`] and [`GeoPriceOracle`] from it.

use anyhow::Context;
use async_trait::async_trait;
use figment::{
    Figment,
    providers::{Format, Json, Yaml},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::booking::BookingRequest;
use crate::provider::{ProviderCandidate, ProviderTeam};
use crate::types::{ProviderId, TimeWindow};

use super::{GeoPriceOracle, ProviderDirectory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotProvider {
    #[serde(flatten)]
    pub candidate: ProviderCandidate,
    /// Distance to each served postal code
    #[serde(default)]
    pub distances_km: BTreeMap<String, f64>,
    /// Flat price for any booking; otherwise hourly rate times booking length
    #[serde(default)]
    pub price_estimate_cents: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    #[serde(default)]
    pub providers: Vec<SnapshotProvider>,
    #[serde(default)]
    pub teams: Vec<ProviderTeam>,
}

#[derive(Debug, Clone)]
pub struct SnapshotDirectory {
    providers: HashMap<ProviderId, SnapshotProvider>,
    teams: Vec<ProviderTeam>,
}

impl SnapshotDirectory {
    pub fn new(snapshot: ProviderSnapshot) -> Self {
        Self {
            providers: snapshot
                .providers
                .into_iter()
                .map(|p| (p.candidate.id, p))
                .collect(),
            teams: snapshot.teams,
        }
    }

    /// Load a snapshot file; `.json` files are read as JSON, anything else as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Figment::from(Json::file_exact(path)),
            _ => Figment::from(Yaml::file_exact(path)),
        };
        let snapshot: ProviderSnapshot = figment
            .extract()
            .with_context(|| format!("failed to load provider snapshot from {}", path.display()))?;
        tracing::info!(
            providers = snapshot.providers.len(),
            teams = snapshot.teams.len(),
            path = %path.display(),
            "Loaded provider snapshot"
        );
        Ok(Self::new(snapshot))
    }

    fn provider(&self, id: ProviderId) -> anyhow::Result<&SnapshotProvider> {
        self.providers
            .get(&id)
            .with_context(|| format!("provider {id} is not in the snapshot"))
    }
}

#[async_trait]
impl ProviderDirectory for SnapshotDirectory {
    async fn list_eligible_candidates(
        &self,
        category: &str,
        eco: bool,
        _window: &TimeWindow,
    ) -> anyhow::Result<Vec<ProviderCandidate>> {
        let mut candidates: Vec<ProviderCandidate> = self
            .providers
            .values()
            .map(|p| &p.candidate)
            .filter(|c| c.offers(category) && (!eco || c.eco_offering))
            .cloned()
            .collect();
        candidates.sort_by_key(|c| c.id);
        Ok(candidates)
    }

    async fn list_teams(&self, category: &str, _window: &TimeWindow) -> anyhow::Result<Vec<ProviderTeam>> {
        Ok(self
            .teams
            .iter()
            .filter(|team| {
                team.members
                    .iter()
                    .any(|id| self.providers.get(id).is_some_and(|p| p.candidate.offers(category)))
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl GeoPriceOracle for SnapshotDirectory {
    async fn distance_km(&self, candidate: &ProviderCandidate, booking: &BookingRequest) -> anyhow::Result<Option<f64>> {
        let provider = self.provider(candidate.id)?;
        Ok(provider.distances_km.get(booking.address.postal_code.trim()).copied())
    }

    async fn price_estimate(&self, candidate: &ProviderCandidate, booking: &BookingRequest) -> anyhow::Result<Option<i64>> {
        let provider = self.provider(candidate.id)?;
        if let Some(flat) = provider.price_estimate_cents {
            return Ok(Some(flat));
        }
        let estimate = provider.candidate.hourly_rate_cents as f64 * booking.window.hours();
        Ok(Some(estimate.round() as i64))
    }
}
