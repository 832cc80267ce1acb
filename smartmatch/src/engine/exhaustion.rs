use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::booking::BookingRequest;
use crate::errors::Result;
use crate::escalation::{self, ExhaustionDecision, FallbackReason};
use crate::matching_config::VersionedMatchingConfig;
use crate::slot_lock::sweep_expired;
use crate::storage::Storage;
use crate::types::BookingId;

use super::{ExpiryOutcome, IssueOutcome, MatchingEngine, MatchingProgress};

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub invitations_expired: usize,
    /// HELD locks released by the TTL sweep (locks whose invitation was already expired are not
    /// counted here)
    pub locks_released: usize,
    pub rounds_reissued: usize,
    pub fallbacks_requested: usize,
    pub escalated: usize,
}

impl SweepReport {
    fn record(&mut self, progress: &MatchingProgress) {
        match progress {
            MatchingProgress::Invited { .. } => self.rounds_reissued += 1,
            MatchingProgress::FallbackRequested { .. } => self.fallbacks_requested += 1,
            MatchingProgress::Idle => {}
        }
    }
}

impl<S: Storage> MatchingEngine<S> {
    /// Move an exhausted booking forward: count matching round `round` as exhausted, then either
    /// issue a relaxed round or request a fallback team.
    ///
    /// Does nothing while invitations are still outstanding, once the booking is fully staffed or
    /// no longer waiting for providers, after a fallback has been requested, or when `round` was
    /// already counted by a concurrent caller. A relaxed round that again finds nobody counts as
    /// another exhaustion.
    #[instrument(skip(self), fields(booking_id = %booking_id), err)]
    pub async fn handle_exhaustion(&self, booking_id: BookingId, round: u32, now: DateTime<Utc>) -> Result<MatchingProgress> {
        let config = self.matching_config().await?;
        let mut round = round;

        // Terminates: every pass raises the retry count and `decide` stops at the cap
        loop {
            let Some(booking) = self.storage.record_exhaustion(booking_id, round, now).await? else {
                debug!(round, "Round not exhausted or already counted");
                return Ok(MatchingProgress::Idle);
            };
            round = booking.matching_retry_count;
            metrics::counter!("smartmatch_matching_retries_total").increment(1);
            info!(retry_count = booking.matching_retry_count, "Matching exhausted");

            match escalation::decide(&booking, &config.config, now) {
                ExhaustionDecision::Reissue {
                    round,
                    distance_ceiling_km,
                } => {
                    let ranked = self.rank(&booking, &config.config, distance_ceiling_km, false).await?;
                    match self.issue(&booking, &ranked, &config, now).await? {
                        IssueOutcome::Issued { invitations, conflicts } => {
                            return Ok(MatchingProgress::Invited {
                                round,
                                invitations,
                                conflicts,
                            });
                        }
                        IssueOutcome::Exhausted { .. } => {
                            debug!(round, distance_ceiling_km, "Relaxed round found nobody either");
                        }
                    }
                }
                ExhaustionDecision::RequestFallback { reason, short_notice } => {
                    return self.request_fallback(&booking, &config, reason, short_notice, now).await;
                }
            }
        }
    }

    /// Put a booking on the fallback queue and attach the best team that can staff it.
    ///
    /// The team proposal is only computed the first time; a booking without any qualifying team
    /// still lands on the queue.
    #[instrument(skip(self, booking, config), fields(booking_id = %booking.id, reason = ?reason), err)]
    pub(super) async fn request_fallback(
        &self,
        booking: &BookingRequest,
        config: &VersionedMatchingConfig,
        reason: FallbackReason,
        short_notice: bool,
        now: DateTime<Utc>,
    ) -> Result<MatchingProgress> {
        let booking = self.storage.request_fallback(booking.id, short_notice, now).await?;
        metrics::counter!("smartmatch_fallbacks_requested_total").increment(1);

        let existing = self.storage.list_fallback_candidates(booking.id).await?;
        if let Some(team) = existing.into_iter().next() {
            return Ok(MatchingProgress::FallbackRequested { reason, team: Some(team) });
        }

        let teams = self.directory.list_teams(&booking.service_category, &booking.window).await?;
        let ceiling = config.config.distance_ceiling_km(booking.matching_retry_count);
        let ranked = self.rank(&booking, &config.config, ceiling, true).await?;
        let team = escalation::compose_fallback_team(&booking, &ranked, &teams, now);

        match &team {
            Some(team) => {
                self.storage.insert_fallback_candidate(team).await?;
                info!(
                    team_id = %team.team_id,
                    team = %team.name,
                    members = team.members.len(),
                    score = team.score,
                    "Fallback requested with team proposal"
                );
            }
            None => warn!(teams = teams.len(), "Fallback requested, no team can staff the booking"),
        }
        Ok(MatchingProgress::FallbackRequested { reason, team })
    }

    /// One pass of every periodic duty. Each step is idempotent, so overlapping passes (two
    /// leaders for a moment, a manual run next to the daemon) are harmless.
    ///
    /// 1. expire invitations whose response window elapsed, releasing their locks
    /// 2. release HELD locks past their TTL that no invitation accounted for
    /// 3. request fallback for unstaffed bookings starting within the short-notice window
    /// 4. escalate fallback requests whose booking starts within the escalation lead
    ///
    /// Per-record failures are logged and skipped so one bad record cannot stall the sweep.
    #[instrument(skip(self), err)]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let config = self.matching_config().await?;
        let mut report = SweepReport::default();

        for invitation in self.storage.outstanding_invitations_expired_before(now).await? {
            match self.expire(invitation.id(), now).await {
                Ok(ExpiryOutcome::Expired { next, .. }) => {
                    report.invitations_expired += 1;
                    report.record(&next);
                }
                Ok(_) => {}
                Err(e) => warn!(invitation_id = %invitation.id(), error = %e, "Failed to expire invitation"),
            }
        }

        for lock in sweep_expired(self.storage.as_ref(), now).await? {
            report.locks_released += 1;
            let booking_id = lock.data.booking_id;
            let Some(invitation) = self
                .storage
                .list_invitations(booking_id)
                .await?
                .into_iter()
                .find(|i| i.data().lock_id == lock.data.id)
            else {
                debug!(lock_id = %lock.data.id, "Swept lock had no invitation");
                continue;
            };
            // Normally the invitation expired above; this catches one the first pass failed on
            if invitation.is_outstanding() {
                match self.expire(invitation.id(), now).await {
                    Ok(ExpiryOutcome::Expired { next, .. }) => {
                        report.invitations_expired += 1;
                        report.record(&next);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(invitation_id = %invitation.id(), error = %e, "Failed to expire invitation of swept lock"),
                }
            }
            let round = invitation.data().round;
            match self.handle_exhaustion(booking_id, round, now).await {
                Ok(progress) => report.record(&progress),
                Err(e) => warn!(booking_id = %booking_id, error = %e, "Failed to handle exhaustion after lock sweep"),
            }
        }

        let short_notice_cutoff = now + config.config.short_notice_window();
        for booking in self.storage.bookings_needing_fallback(short_notice_cutoff).await? {
            let assigned = self.storage.list_assignments(booking.id).await?.len();
            if assigned >= booking.required_providers as usize {
                continue;
            }
            match self
                .request_fallback(&booking, &config, FallbackReason::ShortNotice, true, now)
                .await
            {
                Ok(progress) => report.record(&progress),
                Err(e) => warn!(booking_id = %booking.id, error = %e, "Failed to request short-notice fallback"),
            }
        }

        let escalation_cutoff = now + config.config.escalation_lead();
        for booking in self.storage.bookings_pending_escalation(escalation_cutoff).await? {
            if self.storage.mark_fallback_escalated(booking.id, now).await? {
                report.escalated += 1;
                metrics::counter!("smartmatch_fallbacks_escalated_total").increment(1);
                warn!(
                    booking_id = %booking.id,
                    starts_at = %booking.window.start,
                    retry_count = booking.matching_retry_count,
                    "Fallback booking escalated to operators"
                );
            }
        }

        if report != SweepReport::default() {
            info!(
                invitations_expired = report.invitations_expired,
                locks_released = report.locks_released,
                rounds_reissued = report.rounds_reissued,
                fallbacks_requested = report.fallbacks_requested,
                escalated = report.escalated,
                "Sweep finished"
            );
        }
        Ok(report)
    }
}
