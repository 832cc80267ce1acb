//! Provider snapshots as seen by the scorer.
//!
//! The provider directory owns provider records; the engine only ever sees read-only
//! [`ProviderCandidate`] snapshots taken at scoring time.

use serde::{Deserialize, Serialize};

use crate::booking::Address;
use crate::types::{ProviderId, TeamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Freelancer,
    Company,
}

/// Where a provider is willing to work.
///
/// A provider that declares nothing serves everywhere. Otherwise the booking address must match
/// at least one declared postal code, city or district, or lie within `radius_km`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceArea {
    pub postal_codes: Vec<String>,
    pub cities: Vec<String>,
    pub districts: Vec<String>,
    pub radius_km: Option<f64>,
}

impl ServiceArea {
    pub fn is_unrestricted(&self) -> bool {
        self.postal_codes.is_empty() && self.cities.is_empty() && self.districts.is_empty() && self.radius_km.is_none()
    }

    /// Whether the area covers `address`. `distance_km` is the oracle distance, if known; an
    /// unknown distance never satisfies a radius on its own.
    pub fn covers(&self, address: &Address, distance_km: Option<f64>) -> bool {
        if self.is_unrestricted() {
            return true;
        }
        if self.postal_codes.iter().any(|p| p.trim() == address.postal_code.trim()) {
            return true;
        }
        if self.cities.iter().any(|c| c.trim().eq_ignore_ascii_case(address.city.trim())) {
            return true;
        }
        if let Some(district) = &address.district
            && self.districts.iter().any(|d| d.trim().eq_ignore_ascii_case(district.trim()))
        {
            return true;
        }
        matches!((self.radius_km, distance_km), (Some(radius), Some(d)) if d <= radius)
    }
}

/// A provider's membership in a pre-composed team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamMembership {
    pub team_id: TeamId,
    pub team_size: u32,
}

/// Read-only snapshot of a provider used for one scoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCandidate {
    pub id: ProviderId,
    pub kind: ProviderKind,
    pub service_categories: Vec<String>,
    #[serde(default)]
    pub service_area: ServiceArea,
    pub hourly_rate_cents: i64,
    #[serde(default)]
    pub rating_average: f64,
    #[serde(default)]
    pub rating_count: u32,
    #[serde(default)]
    pub eco_offering: bool,
    /// Completion rate over a trailing window, in `[0, 1]`
    #[serde(default)]
    pub reliability: Option<f64>,
    #[serde(default)]
    pub team: Option<TeamMembership>,
}

impl ProviderCandidate {
    pub fn offers(&self, category: &str) -> bool {
        self.service_categories.iter().any(|c| c == category)
    }
}

/// A pre-composed team, as listed by the provider directory for fallback composition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderTeam {
    pub id: TeamId,
    pub name: String,
    pub preferred_size: u32,
    pub members: Vec<ProviderId>,
}
