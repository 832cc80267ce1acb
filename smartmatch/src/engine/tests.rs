use chrono::{Duration, Utc};
use std::sync::Arc;

use super::*;
use crate::booking::BookingRequest;
use crate::collaborators::{ProviderSnapshot, SnapshotDirectory};
use crate::invitation::{DeclineReason, InvitationStatus, Pending};
use crate::provider::{ProviderCandidate, ProviderTeam, TeamMembership};
use crate::slot_lock::{LockStatus, SlotLock};
use crate::storage::in_memory::InMemoryStorage;
use crate::test_utils::{
    FailingDispatch, FailingOracle, RecordingDispatch, booking_fixture, candidate_fixture, engine_with, provider_at,
};
use crate::types::{TeamId, TimeWindow};

fn invited(progress: MatchingProgress) -> Vec<Invitation<Pending>> {
    match progress {
        MatchingProgress::Invited { invitations, .. } => invitations,
        other => panic!("expected invitations, got {other:?}"),
    }
}

fn invitation_for(invitations: &[Invitation<Pending>], provider_id: ProviderId) -> InvitationId {
    invitations
        .iter()
        .find(|i| i.data.provider_id == provider_id)
        .map(|i| i.data.id)
        .unwrap()
}

async fn insert(engine: &MatchingEngine<InMemoryStorage>, booking: BookingRequest) -> BookingRequest {
    engine.storage().insert_booking(&booking).await.unwrap();
    booking
}

#[test_log::test(tokio::test)]
async fn test_first_acceptance_wins_and_supersedes_siblings() {
    let (a, b, c) = (candidate_fixture(), candidate_fixture(), candidate_fixture());
    let engine = engine_with(
        vec![provider_at(a.clone(), 2.0), provider_at(b.clone(), 4.0), provider_at(c.clone(), 6.0)],
        vec![],
        MatchingConfig::default(),
    )
    .await;
    let booking = insert(&engine, booking_fixture(1)).await;
    let now = Utc::now();

    let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());
    assert_eq!(invitations.len(), 3);
    let locks = engine.storage().locks_for_booking(booking.id).await.unwrap();
    assert_eq!(locks.len(), 3);
    assert!(locks.iter().all(|l| l.status() == LockStatus::Held));

    let accepted = engine
        .respond(invitation_for(&invitations, b.id), Decision::Accept, now + Duration::minutes(1))
        .await
        .unwrap();
    let ResponseOutcome::Accepted { commit, next } = accepted else {
        panic!("expected acceptance, got {accepted:?}");
    };
    assert!(commit.fully_staffed);
    assert!(matches!(next, MatchingProgress::Idle));
    assert_eq!(commit.assignment.provider_id, b.id);
    assert_eq!(commit.cleanup.declined.len(), 2);

    for invitation in engine.storage().list_invitations(booking.id).await.unwrap() {
        if invitation.data().provider_id == b.id {
            assert_eq!(invitation.status(), InvitationStatus::Accepted);
        } else {
            assert_eq!(invitation.status(), InvitationStatus::Declined);
            assert_eq!(invitation.decline_reason(), Some(DeclineReason::Superseded));
        }
    }
    for lock in engine.storage().locks_for_booking(booking.id).await.unwrap() {
        let expected = if lock.data().provider_id == b.id {
            LockStatus::Confirmed
        } else {
            LockStatus::Released
        };
        assert_eq!(lock.status(), expected);
    }
    let booking = engine.storage().get_booking(booking.id).await.unwrap();
    assert_eq!(booking.status, BookingStatus::Confirmed);
    assert_eq!(engine.storage().list_assignments(booking.id).await.unwrap().len(), 1);

    // A late answer from a superseded provider is a conflict, not an error
    let late = engine
        .respond(invitation_for(&invitations, a.id), Decision::Accept, now + Duration::minutes(2))
        .await
        .unwrap();
    assert!(matches!(
        late,
        ResponseOutcome::Conflict {
            status: InvitationStatus::Declined,
            ..
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acceptances_assign_once() {
    for _ in 0..50 {
        let providers: Vec<_> = (0..3).map(|i| provider_at(candidate_fixture(), 1.0 + i as f64)).collect();
        let engine = Arc::new(engine_with(providers, vec![], MatchingConfig::default()).await);
        let booking = insert(&engine, booking_fixture(1)).await;
        let now = Utc::now();
        let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());

        let at = now + Duration::minutes(1);
        let handles: Vec<_> = invitations
            .iter()
            .map(|invitation| {
                let engine = engine.clone();
                let id = invitation.data.id;
                tokio::spawn(async move { engine.respond(id, Decision::Accept, at).await })
            })
            .collect();
        let mut accepted = 0;
        for handle in handles {
            if matches!(handle.await.unwrap().unwrap(), ResponseOutcome::Accepted { .. }) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(engine.storage().list_assignments(booking.id).await.unwrap().len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_declines_count_one_retry() {
    for _ in 0..50 {
        let (a, b, far) = (candidate_fixture(), candidate_fixture(), candidate_fixture());
        let engine = Arc::new(
            engine_with(
                // `far` is only reachable once the ceiling is relaxed
                vec![provider_at(a.clone(), 2.0), provider_at(b.clone(), 4.0), provider_at(far.clone(), 28.0)],
                vec![],
                MatchingConfig::default(),
            )
            .await,
        );
        let booking = insert(&engine, booking_fixture(1)).await;
        let now = Utc::now();
        let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());
        assert_eq!(invitations.len(), 2);

        let at = now + Duration::minutes(1);
        let handles: Vec<_> = invitations
            .iter()
            .map(|invitation| {
                let engine = engine.clone();
                let id = invitation.data.id;
                tokio::spawn(async move { engine.respond(id, Decision::Decline, at).await })
            })
            .collect();
        for handle in handles {
            assert!(matches!(handle.await.unwrap().unwrap(), ResponseOutcome::Declined { .. }));
        }

        let stored = engine.storage().get_booking(booking.id).await.unwrap();
        assert_eq!(stored.matching_retry_count, 1);
        let second_round: Vec<_> = engine
            .storage()
            .list_invitations(booking.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.is_outstanding())
            .collect();
        assert_eq!(second_round.len(), 1);
        assert_eq!(second_round[0].data().provider_id, far.id);
        assert_eq!(second_round[0].data().round, 1);
    }
}

#[test_log::test(tokio::test)]
async fn test_all_expired_triggers_relaxed_second_round() {
    let far = candidate_fixture();
    let mut providers: Vec<_> = (0..3).map(|i| provider_at(candidate_fixture(), 5.0 + i as f64)).collect();
    // Only reachable once the ceiling is relaxed
    providers.push(provider_at(far.clone(), 28.0));
    let engine = engine_with(providers, vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(1)).await;
    let now = Utc::now();

    let first_round = invited(engine.start_matching(booking.id, now).await.unwrap());
    assert_eq!(first_round.len(), 3);
    assert!(first_round.iter().all(|i| i.data.provider_id != far.id));

    let report = engine.sweep(now + Duration::minutes(16)).await.unwrap();
    assert_eq!(report.invitations_expired, 3);
    assert_eq!(report.rounds_reissued, 1);

    let booking = engine.storage().get_booking(booking.id).await.unwrap();
    assert_eq!(booking.matching_retry_count, 1);

    let invitations = engine.storage().list_invitations(booking.id).await.unwrap();
    let second_round: Vec<_> = invitations.iter().filter(|i| i.data().round == 1).collect();
    assert_eq!(second_round.len(), 3);
    assert!(second_round.iter().all(|i| i.status() == InvitationStatus::Pending));

    // Every expired invitation had its lock released in the same sweep
    for invitation in invitations.iter().filter(|i| i.status() == InvitationStatus::Expired) {
        let lock = engine.storage().get_lock(invitation.data().lock_id).await.unwrap();
        assert_eq!(lock.status(), LockStatus::Released);
    }

    let config = engine.matching_config().await.unwrap().config;
    let relaxed = engine
        .rank(&booking, &config, config.distance_ceiling_km(1), false)
        .await
        .unwrap();
    assert!(relaxed.iter().any(|r| r.candidate.id == far.id));
}

#[tokio::test]
async fn test_empty_first_round_relaxes_immediately() {
    let far = candidate_fixture();
    let engine = engine_with(vec![provider_at(far.clone(), 28.0)], vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(1)).await;

    match engine.start_matching(booking.id, Utc::now()).await.unwrap() {
        MatchingProgress::Invited { round, invitations, .. } => {
            assert_eq!(round, 1);
            assert_eq!(invitations.len(), 1);
            assert_eq!(invitations[0].data.provider_id, far.id);
        }
        other => panic!("expected a relaxed round, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_bookings_race_for_one_provider() {
    for _ in 0..50 {
        let contested = candidate_fixture();
        let other = candidate_fixture();
        let engine = engine_with(
            vec![provider_at(contested.clone(), 2.0), provider_at(other.clone(), 3.0)],
            vec![],
            MatchingConfig::default(),
        )
        .await;
        let first = insert(&engine, booking_fixture(1)).await;
        let mut second = booking_fixture(1);
        second.window =
            TimeWindow::new(first.window.start + Duration::hours(1), first.window.end + Duration::hours(1)).unwrap();
        let second = insert(&engine, second).await;
        let now = Utc::now();

        let handles: Vec<_> = [&first, &second]
            .into_iter()
            .map(|booking| {
                let storage = engine.storage().clone();
                let request = LockRequest {
                    booking_id: booking.id,
                    provider_id: contested.id,
                    window: booking.window,
                    ttl: Duration::minutes(15),
                };
                tokio::spawn(async move { SlotLock::acquire(request, now, storage.as_ref()).await })
            })
            .collect();
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }
        let won = outcomes
            .iter()
            .filter(|o| matches!(o, LockAcquisition::Acquired(_)))
            .count();
        assert_eq!(won, 1);
        let loser = if matches!(outcomes[0], LockAcquisition::Acquired(_)) {
            &second
        } else {
            &first
        };

        let config = engine.matching_config().await.unwrap().config;
        let ranked = engine
            .rank(loser, &config, config.distance_max_km, false)
            .await
            .unwrap();
        let ids: Vec<ProviderId> = ranked.iter().map(|r| r.candidate.id).collect();
        assert_eq!(ids, vec![other.id]);
    }
}

#[test_log::test(tokio::test)]
async fn test_threshold_requests_fallback_with_team() {
    let team_id = TeamId::new();
    let membership = Some(TeamMembership { team_id, team_size: 2 });
    let first = ProviderCandidate {
        team: membership,
        ..candidate_fixture()
    };
    let second = ProviderCandidate {
        team: membership,
        ..candidate_fixture()
    };
    let team = ProviderTeam {
        id: team_id,
        name: "Duo".to_string(),
        preferred_size: 2,
        members: vec![first.id, second.id],
    };
    let engine = engine_with(
        vec![provider_at(first.clone(), 3.0), provider_at(second.clone(), 4.0)],
        vec![team],
        MatchingConfig::default(),
    )
    .await;
    let mut booking = booking_fixture(2);
    booking.matching_retry_count = 2;
    let booking = insert(&engine, booking).await;
    let now = Utc::now();

    let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());
    assert_eq!(invitations.len(), 2);

    // Nobody answers; the third exhaustion reaches the threshold
    let report = engine.sweep(now + Duration::minutes(16)).await.unwrap();
    assert_eq!(report.invitations_expired, 2);
    assert_eq!(report.fallbacks_requested, 1);

    let booking = engine.storage().get_booking(booking.id).await.unwrap();
    assert_eq!(booking.matching_retry_count, 3);
    assert!(booking.fallback_requested_at.is_some());
    assert_eq!(booking.status, BookingStatus::PendingProvider);

    let queue = engine.fallback_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].booking.id, booking.id);
    let proposal = &queue[0].candidates[0];
    assert_eq!(proposal.team_id, team_id);
    assert!(proposal.members.len() >= booking.required_providers as usize);

    let assigned = engine
        .force_assign_team(booking.id, TeamSelection::Candidate(proposal.id), now + Duration::minutes(20))
        .await
        .unwrap();
    assert_eq!(assigned.assignments.len(), 2);
    assert!(assigned.fully_staffed);
    assert!(engine.fallback_queue().await.unwrap().is_empty());
    assert_eq!(
        engine.storage().get_booking(booking.id).await.unwrap().status,
        BookingStatus::Confirmed
    );
}

#[tokio::test]
async fn test_fallback_without_team_still_queues() {
    let engine = engine_with(vec![], vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(1)).await;

    match engine.start_matching(booking.id, Utc::now()).await.unwrap() {
        MatchingProgress::FallbackRequested { reason, team } => {
            assert_eq!(reason, FallbackReason::ThresholdReached);
            assert!(team.is_none());
        }
        other => panic!("expected fallback, got {other:?}"),
    }
    let booking = engine.storage().get_booking(booking.id).await.unwrap();
    assert_eq!(booking.matching_retry_count, 3);
    assert_eq!(engine.fallback_queue().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_decline_excludes_provider_from_retry_rounds() {
    let only = candidate_fixture();
    let engine = engine_with(vec![provider_at(only.clone(), 2.0)], vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(1)).await;
    let now = Utc::now();
    let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());

    let outcome = engine
        .respond(invitations[0].data.id, Decision::Decline, now + Duration::minutes(1))
        .await
        .unwrap();
    let ResponseOutcome::Declined { invitation, next } = outcome else {
        panic!("expected decline, got {outcome:?}");
    };
    assert_eq!(invitation.state.reason, DeclineReason::ProviderDeclined);
    assert!(matches!(next, MatchingProgress::FallbackRequested { .. }));

    let lock = engine.storage().get_lock(invitation.data.lock_id).await.unwrap();
    assert_eq!(lock.status(), LockStatus::Released);
    let booking = engine.storage().get_booking(booking.id).await.unwrap();
    assert_eq!(booking.matching_retry_count, 3);
}

#[tokio::test]
async fn test_reinvite_declined_when_configured() {
    let only = candidate_fixture();
    let config = MatchingConfig {
        reinvite_declined: true,
        ..Default::default()
    };
    let engine = engine_with(vec![provider_at(only.clone(), 2.0)], vec![], config).await;
    let booking = insert(&engine, booking_fixture(1)).await;
    let now = Utc::now();
    let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());

    let outcome = engine
        .respond(invitations[0].data.id, Decision::Decline, now + Duration::minutes(1))
        .await
        .unwrap();
    let ResponseOutcome::Declined { next, .. } = outcome else {
        panic!("expected decline, got {outcome:?}");
    };
    let reissued = invited(next);
    assert_eq!(reissued.len(), 1);
    assert_eq!(reissued[0].data.provider_id, only.id);
    assert_eq!(reissued[0].data.round, 1);
}

#[tokio::test]
async fn test_team_mission_staffs_exactly_required() {
    let providers: Vec<_> = (0..3).map(|i| provider_at(candidate_fixture(), 1.0 + i as f64)).collect();
    let engine = engine_with(providers, vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(2)).await;
    let now = Utc::now();
    let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());
    assert_eq!(invitations.len(), 3);

    let at = now + Duration::minutes(1);
    let ResponseOutcome::Accepted { commit: first, next } = engine.respond(invitations[0].data.id, Decision::Accept, at).await.unwrap() else {
        panic!("first acceptance must succeed");
    };
    assert!(!first.fully_staffed);
    assert!(first.cleanup.is_empty());
    // Invitations are still out, so no new round yet
    assert!(matches!(next, MatchingProgress::Idle));

    let ResponseOutcome::Accepted { commit: second, .. } = engine.respond(invitations[1].data.id, Decision::Accept, at).await.unwrap() else {
        panic!("second acceptance must succeed");
    };
    assert!(second.fully_staffed);
    assert_eq!(second.cleanup.declined, vec![invitations[2].data.id]);

    let third = engine.storage().get_invitation(invitations[2].data.id).await.unwrap();
    assert_eq!(third.decline_reason(), Some(DeclineReason::NoLongerNeeded));
    assert_eq!(engine.storage().list_assignments(booking.id).await.unwrap().len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_acceptance_leaving_team_short_starts_next_round() {
    let (a, b, c, far) = (candidate_fixture(), candidate_fixture(), candidate_fixture(), candidate_fixture());
    let engine = engine_with(
        vec![
            provider_at(a.clone(), 1.0),
            provider_at(b.clone(), 2.0),
            provider_at(c.clone(), 3.0),
            provider_at(far.clone(), 28.0),
        ],
        vec![],
        MatchingConfig::default(),
    )
    .await;
    let booking = insert(&engine, booking_fixture(2)).await;
    let now = Utc::now();
    let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());
    assert_eq!(invitations.len(), 3);

    let at = now + Duration::minutes(1);
    for provider_id in [a.id, b.id] {
        let outcome = engine
            .respond(invitation_for(&invitations, provider_id), Decision::Decline, at)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ResponseOutcome::Declined {
                next: MatchingProgress::Idle,
                ..
            }
        ));
    }

    // The last outstanding answer is an acceptance that leaves the team one short
    let outcome = engine
        .respond(invitation_for(&invitations, c.id), Decision::Accept, at)
        .await
        .unwrap();
    let ResponseOutcome::Accepted { commit, next } = outcome else {
        panic!("expected acceptance, got {outcome:?}");
    };
    assert!(!commit.fully_staffed);
    let reissued = invited(next);
    assert_eq!(reissued.len(), 1);
    assert_eq!(reissued[0].data.provider_id, far.id);
    assert_eq!(reissued[0].data.round, 1);

    let booking = engine.storage().get_booking(booking.id).await.unwrap();
    assert_eq!(booking.matching_retry_count, 1);
    assert_eq!(booking.status, BookingStatus::PendingProvider);
}

#[tokio::test]
async fn test_late_acceptance_expires_invitation() {
    let engine = engine_with(vec![provider_at(candidate_fixture(), 2.0)], vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(1)).await;
    let now = Utc::now();
    let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());

    let outcome = engine
        .respond(invitations[0].data.id, Decision::Accept, now + Duration::minutes(20))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        ResponseOutcome::Conflict {
            status: InvitationStatus::Expired,
            ..
        }
    ));
    let lock = engine.storage().get_lock(invitations[0].data.lock_id).await.unwrap();
    assert_eq!(lock.status(), LockStatus::Released);
    assert!(engine.storage().list_assignments(booking.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mark_viewed_is_idempotent() {
    let engine = engine_with(vec![provider_at(candidate_fixture(), 2.0)], vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(1)).await;
    let now = Utc::now();
    let id = invited(engine.start_matching(booking.id, now).await.unwrap())[0].data.id;

    let first = engine.mark_viewed(id, now + Duration::minutes(1)).await.unwrap();
    let ViewOutcome::Viewed(viewed) = first else {
        panic!("expected first view, got {first:?}");
    };
    let again = engine.mark_viewed(id, now + Duration::minutes(2)).await.unwrap();
    let ViewOutcome::AlreadyViewed(still) = again else {
        panic!("expected repeat view, got {again:?}");
    };
    assert_eq!(still.state.viewed_at, viewed.state.viewed_at);

    engine
        .respond(id, Decision::Decline, now + Duration::minutes(3))
        .await
        .unwrap();
    assert!(matches!(
        engine.mark_viewed(id, now + Duration::minutes(4)).await.unwrap(),
        ViewOutcome::Conflict {
            status: InvitationStatus::Declined
        }
    ));
}

#[tokio::test]
async fn test_cancellation_releases_everything() {
    let providers: Vec<_> = (0..3).map(|i| provider_at(candidate_fixture(), 1.0 + i as f64)).collect();
    let engine = engine_with(providers, vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(1)).await;
    let now = Utc::now();
    let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());

    let closed = engine
        .cancel_booking(booking.id, StatusActor::Client, None, now + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(closed.previous_status, BookingStatus::PendingProvider);
    assert_eq!(closed.cleanup.declined.len(), 3);
    assert_eq!(closed.cleanup.released.len(), 3);
    assert!(
        engine
            .storage()
            .locks_for_booking(booking.id)
            .await
            .unwrap()
            .iter()
            .all(|l| l.status() == LockStatus::Released)
    );

    let late = engine
        .respond(invitations[0].data.id, Decision::Accept, now + Duration::minutes(2))
        .await
        .unwrap();
    assert!(matches!(late, ResponseOutcome::Conflict { .. }));

    // Closing twice is a conflict
    let err = engine
        .cancel_booking(booking.id, StatusActor::Operator, None, now + Duration::minutes(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_complete_releases_confirmed_lock() {
    let engine = engine_with(vec![provider_at(candidate_fixture(), 2.0)], vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(1)).await;
    let now = Utc::now();
    let id = invited(engine.start_matching(booking.id, now).await.unwrap())[0].data.id;
    engine.respond(id, Decision::Accept, now).await.unwrap();

    let closed = engine.complete_booking(booking.id, now + Duration::days(4)).await.unwrap();
    assert_eq!(closed.booking.status, BookingStatus::Completed);
    assert_eq!(closed.cleanup.released.len(), 1);
}

#[tokio::test]
async fn test_cancellation_provider_must_match_actor() {
    let provider = candidate_fixture();
    let engine = engine_with(vec![provider_at(provider.clone(), 2.0)], vec![], MatchingConfig::default()).await;
    let booking = insert(&engine, booking_fixture(1)).await;
    let now = Utc::now();
    let id = invited(engine.start_matching(booking.id, now).await.unwrap())[0].data.id;
    engine.respond(id, Decision::Accept, now).await.unwrap();

    let err = engine
        .cancel_booking(booking.id, StatusActor::Provider, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    let err = engine
        .cancel_booking(booking.id, StatusActor::Client, Some(provider.id), now)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    // Rejected requests leave the booking untouched
    let stored = engine.storage().get_booking(booking.id).await.unwrap();
    assert_eq!(stored.status, BookingStatus::Confirmed);

    let closed = engine
        .cancel_booking(booking.id, StatusActor::Provider, Some(provider.id), now)
        .await
        .unwrap();
    assert_eq!(closed.booking.status, BookingStatus::Cancelled);
    let change = engine
        .storage()
        .status_changes_between(now - Duration::minutes(1), now + Duration::minutes(1))
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.to == BookingStatus::Cancelled)
        .unwrap();
    assert_eq!(change.provider_id, Some(provider.id));
}

#[tokio::test]
async fn test_short_notice_and_escalation_sweeps() {
    let engine = engine_with(vec![provider_at(candidate_fixture(), 2.0)], vec![], MatchingConfig::default()).await;
    let now = Utc::now();
    let mut booking = booking_fixture(1);
    booking.window = TimeWindow::new(now + Duration::hours(10), now + Duration::hours(13)).unwrap();
    let booking = insert(&engine, booking).await;
    invited(engine.start_matching(booking.id, now).await.unwrap());

    let report = engine.sweep(now + Duration::minutes(1)).await.unwrap();
    assert_eq!(report.fallbacks_requested, 1);
    assert_eq!(report.escalated, 0);
    let stored = engine.storage().get_booking(booking.id).await.unwrap();
    assert!(stored.short_notice);
    assert!(stored.fallback_requested_at.is_some());

    // Within the escalation lead; the invitation also lapses but no new round starts
    let report = engine.sweep(now + Duration::hours(5)).await.unwrap();
    assert_eq!(report.escalated, 1);
    assert_eq!(report.invitations_expired, 1);
    assert_eq!(report.rounds_reissued, 0);
    let stored = engine.storage().get_booking(booking.id).await.unwrap();
    assert!(stored.fallback_escalated_at.is_some());
    assert_eq!(stored.matching_retry_count, 0);

    // Nothing left to do
    assert_eq!(engine.sweep(now + Duration::hours(6)).await.unwrap(), SweepReport::default());
}

#[tokio::test]
async fn test_oracle_outage_degrades_scoring() {
    let storage = InMemoryStorage::new();
    storage
        .ensure_matching_config(&MatchingConfig::default(), Utc::now())
        .await
        .unwrap();
    let directory = Arc::new(SnapshotDirectory::new(ProviderSnapshot {
        providers: vec![provider_at(candidate_fixture(), 2.0)],
        teams: vec![],
    }));
    let engine = MatchingEngine::builder()
        .storage(Arc::new(storage))
        .directory(directory)
        .oracle(Arc::new(FailingOracle))
        .dispatch(Arc::new(FailingDispatch))
        .build();
    let booking = insert(&engine, booking_fixture(1)).await;

    let invitations = invited(engine.start_matching(booking.id, Utc::now()).await.unwrap());
    assert_eq!(invitations.len(), 1);
    assert_eq!(invitations[0].data.metadata["breakdown"]["distance"], 0.0);
}

#[tokio::test]
async fn test_invitations_are_dispatched() {
    let storage = InMemoryStorage::new();
    storage
        .ensure_matching_config(&MatchingConfig::default(), Utc::now())
        .await
        .unwrap();
    let directory = Arc::new(SnapshotDirectory::new(ProviderSnapshot {
        providers: vec![provider_at(candidate_fixture(), 2.0), provider_at(candidate_fixture(), 3.0)],
        teams: vec![],
    }));
    let dispatch = RecordingDispatch::default();
    let engine = MatchingEngine::builder()
        .storage(Arc::new(storage))
        .directory(directory.clone())
        .oracle(directory)
        .dispatch(Arc::new(dispatch.clone()))
        .build();
    let booking = insert(&engine, booking_fixture(1)).await;

    let invitations = invited(engine.start_matching(booking.id, Utc::now()).await.unwrap());
    // Dispatch runs on detached tasks
    for _ in 0..50 {
        if dispatch.sent.lock().len() == invitations.len() {
            break;
        }
        tokio::task::yield_now().await;
    }
    let mut sent = dispatch.sent.lock().clone();
    sent.sort();
    let mut expected: Vec<InvitationId> = invitations.iter().map(|i| i.data.id).collect();
    expected.sort();
    assert_eq!(sent, expected);
}

#[tokio::test]
async fn test_force_assign_conflicts_with_other_booking() {
    let provider = candidate_fixture();
    let engine = engine_with(vec![provider_at(provider.clone(), 2.0)], vec![], MatchingConfig::default()).await;
    let first = insert(&engine, booking_fixture(1)).await;
    let mut second = booking_fixture(1);
    second.window = first.window;
    let second = insert(&engine, second).await;
    let now = Utc::now();

    engine.force_assign(first.id, provider.id, now).await.unwrap();
    let err = engine.force_assign(second.id, provider.id, now).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn test_replaced_config_applies_to_next_run() {
    let providers: Vec<_> = (0..3).map(|i| provider_at(candidate_fixture(), 1.0 + i as f64)).collect();
    let engine = engine_with(providers, vec![], MatchingConfig::default()).await;
    let now = Utc::now();

    let invalid = MatchingConfig {
        fanout_size: 0,
        ..Default::default()
    };
    assert!(matches!(
        engine.replace_matching_config(&invalid, now).await.unwrap_err(),
        Error::Validation { .. }
    ));

    let narrower = MatchingConfig {
        fanout_size: 1,
        ..Default::default()
    };
    let stored = engine.replace_matching_config(&narrower, now).await.unwrap();
    assert_eq!(stored.version, 2);

    let booking = insert(&engine, booking_fixture(1)).await;
    let invitations = invited(engine.start_matching(booking.id, now).await.unwrap());
    assert_eq!(invitations.len(), 1);
    assert_eq!(invitations[0].data.metadata["config_version"], 2);
}

#[tokio::test]
async fn test_publish_draft_starts_matching() {
    let engine = engine_with(vec![provider_at(candidate_fixture(), 2.0)], vec![], MatchingConfig::default()).await;
    let fixture = booking_fixture(1);
    let new = NewBooking {
        client_id: fixture.client_id,
        service_category: fixture.service_category,
        eco_preference: false,
        required_providers: 1,
        address: fixture.address,
        window: fixture.window,
        status: BookingStatus::Draft,
    };
    let now = Utc::now();
    let booking = engine.submit_booking(new, now).await.unwrap();
    assert!(matches!(
        engine.start_matching(booking.id, now).await.unwrap_err(),
        Error::Conflict { .. }
    ));

    let invitations = invited(engine.publish_booking(booking.id, now).await.unwrap());
    assert_eq!(invitations.len(), 1);
    // Publishing twice is a conflict
    assert!(matches!(
        engine.publish_booking(booking.id, now).await.unwrap_err(),
        Error::Conflict { .. }
    ));
}
