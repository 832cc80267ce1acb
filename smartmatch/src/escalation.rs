//! Retry and fallback escalation policy.
//!
//! When a booking runs out of outstanding invitations without being fully staffed, the engine
//! bumps its retry counter and asks [`decide`] what to do next: issue another round with a
//! relaxed distance ceiling, or stop and request a fallback team. Fallback teams are composed by
//! [`compose_fallback_team`] from a ranking computed with the team bonus forced on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::booking::{BookingRequest, FallbackTeamCandidate};
use crate::matching_config::MatchingConfig;
use crate::provider::ProviderTeam;
use crate::scoring::RankedCandidate;
use crate::types::{FallbackCandidateId, ProviderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// `matching_retry_count` reached the escalation threshold
    ThresholdReached,
    /// `matching_retry_count` reached the retry cap
    RetryCapReached,
    /// The booking starts within the short-notice window
    ShortNotice,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExhaustionDecision {
    /// Rescore with the relaxed ceiling and issue another round
    Reissue { round: u32, distance_ceiling_km: f64 },
    /// Stop individual matching and put the booking on the fallback queue
    RequestFallback { reason: FallbackReason, short_notice: bool },
}

/// Whether `booking` starts within the short-notice window as of `now`.
pub fn is_short_notice(booking: &BookingRequest, config: &MatchingConfig, now: DateTime<Utc>) -> bool {
    booking.window.start - now <= config.short_notice_window()
}

/// Decide the next step for an exhausted booking whose retry counter has already been bumped.
pub fn decide(booking: &BookingRequest, config: &MatchingConfig, now: DateTime<Utc>) -> ExhaustionDecision {
    let retries = booking.matching_retry_count;
    let short_notice = is_short_notice(booking, config, now);

    if retries >= config.escalation_threshold {
        return ExhaustionDecision::RequestFallback {
            reason: FallbackReason::ThresholdReached,
            short_notice,
        };
    }
    if retries >= config.max_retries {
        return ExhaustionDecision::RequestFallback {
            reason: FallbackReason::RetryCapReached,
            short_notice,
        };
    }
    if short_notice {
        return ExhaustionDecision::RequestFallback {
            reason: FallbackReason::ShortNotice,
            short_notice,
        };
    }
    ExhaustionDecision::Reissue {
        round: retries,
        distance_ceiling_km: config.distance_ceiling_km(retries),
    }
}

/// Whether the fallback request of `booking` is due for escalation to operators.
pub fn is_escalation_due(booking: &BookingRequest, config: &MatchingConfig, now: DateTime<Utc>) -> bool {
    booking.fallback_requested_at.is_some()
        && booking.fallback_escalated_at.is_none()
        && booking.is_matchable()
        && booking.window.start - now <= config.escalation_lead()
}

/// Pick the best team that can staff `booking` from its eligible members.
///
/// `ranked` must come from a scoring run with the team bonus forced on. A team qualifies when at
/// least `required_providers` of its members appear in `ranked`; its score is the mean of its
/// best `required_providers` member scores, and those members make up the proposal.
pub fn compose_fallback_team(
    booking: &BookingRequest,
    ranked: &[RankedCandidate],
    teams: &[ProviderTeam],
    now: DateTime<Utc>,
) -> Option<FallbackTeamCandidate> {
    let required = booking.required_providers as usize;
    if required == 0 {
        return None;
    }
    // `ranked` is already in ranking order, so each team's members come out best first
    let position: HashMap<ProviderId, usize> = ranked
        .iter()
        .enumerate()
        .map(|(i, r)| (r.candidate.id, i))
        .collect();

    teams
        .iter()
        .filter_map(|team| {
            let mut members: Vec<usize> = team.members.iter().filter_map(|id| position.get(id).copied()).collect();
            if members.len() < required {
                return None;
            }
            members.sort_unstable();
            members.truncate(required);
            let score = members.iter().map(|&i| ranked[i].score).sum::<f64>() / required as f64;
            Some((team, members, score))
        })
        .max_by(|(team_a, _, a), (team_b, _, b)| a.total_cmp(b).then_with(|| team_b.id.cmp(&team_a.id)))
        .map(|(team, members, score)| FallbackTeamCandidate {
            id: FallbackCandidateId::new(),
            booking_id: booking.id,
            team_id: team.id,
            name: team.name.clone(),
            preferred_size: team.preferred_size,
            members: members.into_iter().map(|i| ranked[i].candidate.id).collect(),
            score,
            created_at: now,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::ScoreBreakdown;
    use crate::test_utils::{booking_fixture, candidate_fixture};
    use crate::types::TeamId;
    use chrono::Duration;

    fn ranked(scores: &[f64]) -> Vec<RankedCandidate> {
        scores
            .iter()
            .map(|&score| RankedCandidate {
                candidate: candidate_fixture(),
                score,
                breakdown: ScoreBreakdown::default(),
                distance_km: Some(1.0),
                price_cents: Some(5000),
            })
            .collect()
    }

    fn team(name: &str, members: Vec<ProviderId>) -> ProviderTeam {
        ProviderTeam {
            id: TeamId::new(),
            name: name.to_string(),
            preferred_size: members.len() as u32,
            members,
        }
    }

    #[test]
    fn test_reissue_below_threshold_with_relaxed_ceiling() {
        let config = MatchingConfig::default();
        let mut booking = booking_fixture(1);
        booking.matching_retry_count = 1;

        let decision = decide(&booking, &config, booking.window.start - Duration::days(3));
        assert_eq!(
            decision,
            ExhaustionDecision::Reissue {
                round: 1,
                distance_ceiling_km: 30.0
            }
        );
    }

    #[test]
    fn test_threshold_requests_fallback() {
        let config = MatchingConfig::default();
        let mut booking = booking_fixture(1);
        booking.matching_retry_count = config.escalation_threshold;

        let decision = decide(&booking, &config, booking.window.start - Duration::days(3));
        assert_eq!(
            decision,
            ExhaustionDecision::RequestFallback {
                reason: FallbackReason::ThresholdReached,
                short_notice: false
            }
        );
    }

    #[test]
    fn test_retry_cap_below_threshold_requests_fallback() {
        let config = MatchingConfig {
            max_retries: 2,
            escalation_threshold: 4,
            ..Default::default()
        };
        let mut booking = booking_fixture(1);
        booking.matching_retry_count = 2;

        let decision = decide(&booking, &config, booking.window.start - Duration::days(3));
        assert_eq!(
            decision,
            ExhaustionDecision::RequestFallback {
                reason: FallbackReason::RetryCapReached,
                short_notice: false
            }
        );
    }

    #[test]
    fn test_short_notice_requests_fallback_early() {
        let config = MatchingConfig::default();
        let booking = booking_fixture(1);

        let decision = decide(&booking, &config, booking.window.start - Duration::hours(10));
        assert_eq!(
            decision,
            ExhaustionDecision::RequestFallback {
                reason: FallbackReason::ShortNotice,
                short_notice: true
            }
        );
    }

    #[test]
    fn test_escalation_due_within_lead() {
        let config = MatchingConfig::default();
        let mut booking = booking_fixture(1);
        let start = booking.window.start;
        assert!(!is_escalation_due(&booking, &config, start - Duration::hours(1)));

        booking.fallback_requested_at = Some(start - Duration::days(1));
        assert!(!is_escalation_due(&booking, &config, start - Duration::hours(7)));
        assert!(is_escalation_due(&booking, &config, start - Duration::hours(5)));

        booking.fallback_escalated_at = Some(start - Duration::hours(5));
        assert!(!is_escalation_due(&booking, &config, start - Duration::hours(4)));
    }

    #[test]
    fn test_compose_picks_best_qualifying_team() {
        let booking = booking_fixture(2);
        let pool = ranked(&[0.9, 0.8, 0.7, 0.6, 0.5]);
        let id = |i: usize| pool[i].candidate.id;

        let strong = team("strong", vec![id(0), id(3), id(1)]);
        let weak = team("weak", vec![id(2), id(4)]);
        // Only one member is eligible
        let partial = team("partial", vec![id(0), ProviderId::new()]);

        let proposal = compose_fallback_team(&booking, &pool, &[weak, partial, strong.clone()], Utc::now()).unwrap();
        assert_eq!(proposal.team_id, strong.id);
        assert_eq!(proposal.members, vec![id(0), id(1)]);
        assert!((proposal.score - 0.85).abs() < 1e-9);
        assert!(proposal.members.len() >= booking.required_providers as usize);
    }

    #[test]
    fn test_compose_without_qualifying_team() {
        let booking = booking_fixture(3);
        let pool = ranked(&[0.9, 0.8]);
        let duo = team("duo", vec![pool[0].candidate.id, pool[1].candidate.id]);
        assert!(compose_fallback_team(&booking, &pool, &[duo], Utc::now()).is_none());
    }
}
