//! Tunables for scoring, fan-out and escalation.
//!
//! A [`MatchingConfig`] is an immutable value. Operators replace it as a whole, which yields a
//! new [`VersionedMatchingConfig`] with a higher version; each scoring run reads the latest
//! version once and uses it throughout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::errors::{Error, Result};

/// Component of the candidate score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringFactor {
    Distance,
    Price,
    Rating,
    Reliability,
    TeamSize,
}

impl ScoringFactor {
    pub const ALL: [ScoringFactor; 5] = [
        ScoringFactor::Distance,
        ScoringFactor::Price,
        ScoringFactor::Rating,
        ScoringFactor::Reliability,
        ScoringFactor::TeamSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringFactor::Distance => "distance",
            ScoringFactor::Price => "price",
            ScoringFactor::Rating => "rating",
            ScoringFactor::Reliability => "reliability",
            ScoringFactor::TeamSize => "team_size",
        }
    }
}

impl fmt::Display for ScoringFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised team-size bonus, in `[0, 1]`, scaled by the `team_size` weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TeamSizeBonus {
    /// Applied when the booking needs exactly two providers and the candidate's team has two
    pub two_person: f64,
    /// Applied when the booking needs three or more and the candidate's team has at least three
    pub three_plus: f64,
}

impl Default for TeamSizeBonus {
    fn default() -> Self {
        Self {
            two_person: 1.0,
            three_plus: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingConfig {
    /// Hard distance ceiling for the first matching round
    pub distance_max_km: f64,
    /// Factor weights. Missing factors weigh zero.
    pub weights: BTreeMap<ScoringFactor, f64>,
    pub team_size_bonus: TeamSizeBonus,
    /// Invitations to send per round (raised to the number of providers still needed)
    pub fanout_size: u32,
    /// How long a provider has to answer; also the TTL of the HELD slot lock
    #[serde(with = "humantime_serde")]
    pub response_window: Duration,
    /// Hard cap on matching rounds; reaching it requests a fallback team even below the threshold
    pub max_retries: u32,
    /// Retry count at which a fallback team is requested
    pub escalation_threshold: u32,
    /// Added to the distance ceiling for every retry
    pub distance_relaxation_step_km: f64,
    /// Bookings starting within this window without full staffing go straight to fallback
    #[serde(with = "humantime_serde")]
    pub short_notice_window: Duration,
    /// Fallback requests are escalated once the booking starts within this lead time
    #[serde(with = "humantime_serde")]
    pub escalation_lead: Duration,
    /// Credibility constant `k` in `avg/5 * n/(n+k)`
    pub rating_credibility_k: f64,
    /// Reliability assumed for providers without history
    pub default_reliability: f64,
    /// Whether providers who declined a booking may be invited again on retry rounds
    pub reinvite_declined: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            distance_max_km: 25.0,
            weights: BTreeMap::from([
                (ScoringFactor::Distance, 0.30),
                (ScoringFactor::Price, 0.20),
                (ScoringFactor::Rating, 0.25),
                (ScoringFactor::Reliability, 0.15),
                (ScoringFactor::TeamSize, 0.10),
            ]),
            team_size_bonus: TeamSizeBonus::default(),
            fanout_size: 3,
            response_window: Duration::from_secs(15 * 60),
            max_retries: 5,
            escalation_threshold: 3,
            distance_relaxation_step_km: 5.0,
            short_notice_window: Duration::from_secs(24 * 60 * 60),
            escalation_lead: Duration::from_secs(6 * 60 * 60),
            rating_credibility_k: 5.0,
            default_reliability: 0.5,
            reinvite_declined: false,
        }
    }
}

impl MatchingConfig {
    pub fn weight(&self, factor: ScoringFactor) -> f64 {
        self.weights.get(&factor).copied().unwrap_or(0.0)
    }

    /// Distance ceiling for a booking that has been retried `retry_count` times.
    pub fn distance_ceiling_km(&self, retry_count: u32) -> f64 {
        self.distance_max_km + f64::from(retry_count) * self.distance_relaxation_step_km
    }

    pub fn response_window(&self) -> chrono::Duration {
        to_chrono(self.response_window)
    }

    pub fn short_notice_window(&self) -> chrono::Duration {
        to_chrono(self.short_notice_window)
    }

    pub fn escalation_lead(&self) -> chrono::Duration {
        to_chrono(self.escalation_lead)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::Validation { message });

        if !self.distance_max_km.is_finite() || self.distance_max_km <= 0.0 {
            return invalid(format!("distance_max_km must be positive, got {}", self.distance_max_km));
        }
        for (factor, weight) in &self.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return invalid(format!("weight for {factor} must be a non-negative number, got {weight}"));
            }
        }
        for (name, bonus) in [
            ("two_person", self.team_size_bonus.two_person),
            ("three_plus", self.team_size_bonus.three_plus),
        ] {
            if !(0.0..=1.0).contains(&bonus) {
                return invalid(format!("team_size_bonus.{name} must be within [0, 1], got {bonus}"));
            }
        }
        if self.fanout_size == 0 {
            return invalid("fanout_size must be at least 1".to_string());
        }
        if self.response_window.is_zero() {
            return invalid("response_window must be greater than zero".to_string());
        }
        if self.escalation_threshold == 0 {
            return invalid("escalation_threshold must be at least 1".to_string());
        }
        if !self.distance_relaxation_step_km.is_finite() || self.distance_relaxation_step_km < 0.0 {
            return invalid("distance_relaxation_step_km must be non-negative".to_string());
        }
        if !self.rating_credibility_k.is_finite() || self.rating_credibility_k < 0.0 {
            return invalid("rating_credibility_k must be non-negative".to_string());
        }
        if !(0.0..=1.0).contains(&self.default_reliability) {
            return invalid(format!("default_reliability must be within [0, 1], got {}", self.default_reliability));
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// A matching config together with the version it was stored under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedMatchingConfig {
    pub version: i64,
    pub config: MatchingConfig,
    pub created_at: DateTime<Utc>,
}
