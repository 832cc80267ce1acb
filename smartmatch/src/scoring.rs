//! Candidate scoring.
//!
//! [`score`] is a pure function: the engine gathers oracle distances, price estimates and lock
//! availability up front and hands them over in a [`ScoringInput`], so the ranking itself never
//! suspends and is deterministic for a given input.
//!
//! A candidate is eligible when it offers the booking's service category, offers eco products if
//! the booking asks for them, has no active slot lock overlapping the booking window, covers the
//! booking address with its service area, and is not known to be beyond the distance ceiling.
//! Eligible candidates are scored as a weighted sum of components in `[0, 1]`:
//!
//! | component   | value                                                       |
//! |-------------|-------------------------------------------------------------|
//! | distance    | `1 - d / distance_max_km`, 0 when unknown                   |
//! | price       | min-max within the pool, cheapest 1, 0 when unknown         |
//! | rating      | `avg/5 * n/(n + k)`                                         |
//! | reliability | completion rate, or the configured default                  |
//! | team_size   | two-person / three-plus bonus when the team fits the booking |

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::booking::BookingRequest;
use crate::matching_config::{MatchingConfig, ScoringFactor};
use crate::provider::ProviderCandidate;

/// A candidate with everything the scorer needs to know about it for one booking.
#[derive(Debug, Clone)]
pub struct CandidateSnapshot {
    pub candidate: ProviderCandidate,
    pub distance_km: Option<f64>,
    pub price_cents: Option<i64>,
    /// Holds a HELD/CONFIRMED lock overlapping the booking window
    pub busy: bool,
}

#[derive(Debug, Clone)]
pub struct ScoringInput<'a> {
    pub booking: &'a BookingRequest,
    pub candidates: Vec<CandidateSnapshot>,
    pub config: &'a MatchingConfig,
    /// Distance ceiling for this round; `distance_max_km` relaxed by retries
    pub distance_ceiling_km: f64,
    /// Score every candidate as if its team fit the booking (fallback team composition)
    pub force_team_bonus: bool,
}

/// Normalised score components, before weighting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub distance: f64,
    pub price: f64,
    pub rating: f64,
    pub reliability: f64,
    pub team_size: f64,
}

impl ScoreBreakdown {
    pub fn component(&self, factor: ScoringFactor) -> f64 {
        match factor {
            ScoringFactor::Distance => self.distance,
            ScoringFactor::Price => self.price,
            ScoringFactor::Rating => self.rating,
            ScoringFactor::Reliability => self.reliability,
            ScoringFactor::TeamSize => self.team_size,
        }
    }

    pub fn weighted_total(&self, config: &MatchingConfig) -> f64 {
        ScoringFactor::ALL
            .iter()
            .map(|factor| config.weight(*factor) * self.component(*factor))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: ProviderCandidate,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub distance_km: Option<f64>,
    pub price_cents: Option<i64>,
}

/// Filter and rank candidates, best first.
///
/// Ties are broken by rating count (more reviews first), then by provider id, so the ranking is
/// total and stable.
pub fn score(input: ScoringInput<'_>) -> Vec<RankedCandidate> {
    let ScoringInput {
        booking,
        candidates,
        config,
        distance_ceiling_km,
        force_team_bonus,
    } = input;

    let eligible: Vec<CandidateSnapshot> = candidates
        .into_iter()
        .filter(|snapshot| is_eligible(booking, snapshot, distance_ceiling_km))
        .collect();

    let known_prices = eligible.iter().filter_map(|s| s.price_cents);
    let price_range = known_prices.fold(None, |range: Option<(i64, i64)>, price| match range {
        None => Some((price, price)),
        Some((lo, hi)) => Some((lo.min(price), hi.max(price))),
    });

    let mut ranked: Vec<RankedCandidate> = eligible
        .into_iter()
        .map(|snapshot| {
            let breakdown = ScoreBreakdown {
                distance: distance_component(snapshot.distance_km, config.distance_max_km),
                price: price_component(snapshot.price_cents, price_range),
                rating: rating_component(&snapshot.candidate, config.rating_credibility_k),
                reliability: snapshot
                    .candidate
                    .reliability
                    .unwrap_or(config.default_reliability)
                    .clamp(0.0, 1.0),
                team_size: team_size_component(booking, &snapshot.candidate, config, force_team_bonus),
            };
            RankedCandidate {
                score: breakdown.weighted_total(config),
                breakdown,
                candidate: snapshot.candidate,
                distance_km: snapshot.distance_km,
                price_cents: snapshot.price_cents,
            }
        })
        .collect();

    ranked.sort_by(compare_ranked);
    ranked
}

/// Ranking order: score desc, rating count desc, id asc.
pub fn compare_ranked(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.candidate.rating_count.cmp(&a.candidate.rating_count))
        .then_with(|| a.candidate.id.cmp(&b.candidate.id))
}

fn is_eligible(booking: &BookingRequest, snapshot: &CandidateSnapshot, distance_ceiling_km: f64) -> bool {
    let candidate = &snapshot.candidate;
    if !candidate.offers(&booking.service_category) {
        return false;
    }
    if booking.eco_preference && !candidate.eco_offering {
        return false;
    }
    if snapshot.busy {
        return false;
    }
    // Unknown distance stays eligible and scores zero on distance
    if snapshot.distance_km.is_some_and(|d| !d.is_finite() || d > distance_ceiling_km) {
        return false;
    }
    candidate.service_area.covers(&booking.address, snapshot.distance_km)
}

fn distance_component(distance_km: Option<f64>, distance_max_km: f64) -> f64 {
    match distance_km {
        Some(d) if distance_max_km > 0.0 => (1.0 - d / distance_max_km).clamp(0.0, 1.0),
        _ => 0.0,
    }
}

fn price_component(price_cents: Option<i64>, range: Option<(i64, i64)>) -> f64 {
    match (price_cents, range) {
        (Some(_), Some((lo, hi))) if lo == hi => 1.0,
        (Some(price), Some((lo, hi))) => (hi - price) as f64 / (hi - lo) as f64,
        _ => 0.0,
    }
}

fn rating_component(candidate: &ProviderCandidate, k: f64) -> f64 {
    let count = f64::from(candidate.rating_count);
    if count + k <= 0.0 {
        return 0.0;
    }
    (candidate.rating_average / 5.0).clamp(0.0, 1.0) * count / (count + k)
}

fn team_size_component(
    booking: &BookingRequest,
    candidate: &ProviderCandidate,
    config: &MatchingConfig,
    force_team_bonus: bool,
) -> f64 {
    let bonus = &config.team_size_bonus;
    let required = booking.required_providers;
    if force_team_bonus {
        return if required >= 3 { bonus.three_plus } else { bonus.two_person };
    }
    match candidate.team {
        Some(team) if required == 2 && team.team_size == 2 => bonus.two_person,
        Some(team) if required >= 3 && team.team_size >= 3 => bonus.three_plus,
        _ => 0.0,
    }
}
