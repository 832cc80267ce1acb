//! The matching engine: ties scoring, invitations, slot locks and escalation together.
//!
//! Request-path operations ([`MatchingEngine::start_matching`], [`MatchingEngine::respond`], ...)
//! never block waiting for a timeout. Expiry is detected by [`MatchingEngine::sweep`], which the
//! background sweeper runs on an interval.
//!
//! ```ignore
//! let engine = MatchingEngine::builder()
//!     .storage(Arc::new(InMemoryStorage::new()))
//!     .directory(directory.clone())
//!     .oracle(directory)
//!     .dispatch(Arc::new(LoggingDispatch))
//!     .build();
//! let progress = engine.start_matching(booking.id, Utc::now()).await?;
//! ```

use bon::Builder;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::booking::{BookingRequest, BookingStatus, FallbackTeamCandidate, NewBooking, StatusActor};
use crate::collaborators::{GeoPriceOracle, NotificationDispatch, ProviderDirectory};
use crate::errors::{Error, Result};
use crate::escalation::FallbackReason;
use crate::guardrails::{GuardrailMonitor, GuardrailThresholds};
use crate::invitation::{
    AnyInvitation, DeclineReason, Declined, Expired, Invitation, InvitationData, InvitationStatus, Outstanding, Pending,
    Viewed,
};
use crate::matching_config::{MatchingConfig, VersionedMatchingConfig};
use crate::scoring::{self, CandidateSnapshot, RankedCandidate, ScoringInput};
use crate::slot_lock::{LockAcquisition, LockRequest, ReleaseReason, SlotLock, release_lock};
use crate::storage::{AcceptCommit, StatusUpdate, Storage, StorageError};
use crate::types::{BookingId, InvitationId, ProviderId};

mod console;
mod exhaustion;

#[cfg(test)]
mod tests;

pub use console::{FallbackQueueEntry, TeamSelection};
pub use exhaustion::SweepReport;

/// The Smart Match engine.
///
/// Holds no matching state of its own: everything lives in `storage`, so any number of engines
/// (in one process or many) can serve the same bookings.
#[derive(Builder)]
pub struct MatchingEngine<S: Storage> {
    storage: Arc<S>,
    directory: Arc<dyn ProviderDirectory>,
    oracle: Arc<dyn GeoPriceOracle>,
    dispatch: Arc<dyn NotificationDispatch>,
    #[builder(default = Arc::new(GuardrailMonitor::new(GuardrailThresholds::default())))]
    guardrails: Arc<GuardrailMonitor>,
}

/// Result of one invitation round.
#[derive(Debug, Clone)]
pub enum IssueOutcome {
    /// The booking has outstanding invitations (possibly none new, when the fanout was already met)
    Issued {
        invitations: Vec<Invitation<Pending>>,
        /// Ranked providers skipped because someone else holds their slot
        conflicts: Vec<ProviderId>,
    },
    /// Nobody could be invited and nothing is outstanding
    Exhausted { conflicts: Vec<ProviderId> },
}

/// What matching did next for a booking.
#[derive(Debug, Clone)]
pub enum MatchingProgress {
    /// A round of invitations went out
    Invited {
        round: u32,
        invitations: Vec<Invitation<Pending>>,
        conflicts: Vec<ProviderId>,
    },
    /// Individual matching stopped; the booking is on the fallback queue
    FallbackRequested {
        reason: FallbackReason,
        team: Option<FallbackTeamCandidate>,
    },
    /// Nothing to do: invitations still outstanding, booking staffed, closed or already in fallback
    Idle,
}

#[derive(Debug, Clone)]
pub enum ViewOutcome {
    Viewed(Invitation<Viewed>),
    AlreadyViewed(Invitation<Viewed>),
    /// The invitation was already answered or expired
    Conflict { status: InvitationStatus },
}

/// A provider's answer to an invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Decline,
}

#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    Accepted {
        commit: AcceptCommit,
        /// What matching did next for a booking still short of providers
        next: MatchingProgress,
    },
    Declined {
        invitation: Invitation<Declined>,
        next: MatchingProgress,
    },
    /// The invitation can no longer be answered
    Conflict { status: InvitationStatus, message: String },
}

#[derive(Debug, Clone)]
pub enum ExpiryOutcome {
    Expired {
        invitation: Invitation<Expired>,
        next: MatchingProgress,
    },
    /// The response window is still open
    NotDue,
    AlreadyResolved { status: InvitationStatus },
}

impl<S: Storage> MatchingEngine<S> {
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn guardrails(&self) -> &Arc<GuardrailMonitor> {
        &self.guardrails
    }

    /// The matching config for a new scoring run.
    pub async fn matching_config(&self) -> Result<VersionedMatchingConfig> {
        Ok(self.storage.current_matching_config().await?)
    }

    /// Validate and store a new booking. Bookings registered as `pending_provider` still need
    /// [`Self::start_matching`] to get invitations out.
    #[instrument(skip(self, new), fields(client_id = %new.client_id), err)]
    pub async fn submit_booking(&self, new: NewBooking, now: DateTime<Utc>) -> Result<BookingRequest> {
        let booking = BookingRequest::create(new, now)?;
        self.storage.insert_booking(&booking).await?;
        info!(booking_id = %booking.id, status = %booking.status, "Booking registered");
        Ok(booking)
    }

    /// Publish a draft booking and start matching it.
    #[instrument(skip(self), fields(booking_id = %booking_id), err)]
    pub async fn publish_booking(&self, booking_id: BookingId, now: DateTime<Utc>) -> Result<MatchingProgress> {
        self.storage
            .set_booking_status(
                booking_id,
                &[BookingStatus::Draft],
                StatusUpdate::new(BookingStatus::PendingProvider, StatusActor::Client),
                now,
            )
            .await
            .map_err(into_conflict)?;
        self.start_matching(booking_id, now).await
    }

    /// Rank candidates for a booking and invite the best of them.
    ///
    /// A round that finds nobody to invite is handed straight to the escalation policy.
    #[instrument(skip(self), fields(booking_id = %booking_id), err)]
    pub async fn start_matching(&self, booking_id: BookingId, now: DateTime<Utc>) -> Result<MatchingProgress> {
        let booking = self.storage.get_booking(booking_id).await?;
        if !booking.is_matchable() {
            return Err(Error::Conflict {
                message: format!("booking {} is {}, not waiting for providers", booking.id, booking.status),
            });
        }
        let config = self.matching_config().await?;
        let ceiling = config.config.distance_ceiling_km(booking.matching_retry_count);
        let ranked = self.rank(&booking, &config.config, ceiling, false).await?;

        match self.issue(&booking, &ranked, &config, now).await? {
            IssueOutcome::Issued { invitations, conflicts } => Ok(MatchingProgress::Invited {
                round: booking.matching_retry_count,
                invitations,
                conflicts,
            }),
            IssueOutcome::Exhausted { conflicts } => {
                debug!(conflicts = conflicts.len(), "Initial round found nobody to invite");
                self.handle_exhaustion(booking.id, booking.matching_retry_count, now).await
            }
        }
    }

    /// Rank candidates for `booking`.
    ///
    /// Fetches candidates from the directory, looks up distance and price concurrently and
    /// checks availability against active slot locks. Providers who declined this booking are
    /// left out unless the config allows re-inviting them. Oracle failures count as unknown
    /// values; a directory failure is an error.
    #[instrument(skip(self, booking, config), fields(booking_id = %booking.id), err)]
    pub async fn rank(
        &self,
        booking: &BookingRequest,
        config: &MatchingConfig,
        distance_ceiling_km: f64,
        force_team_bonus: bool,
    ) -> Result<Vec<RankedCandidate>> {
        let candidates = self
            .directory
            .list_eligible_candidates(&booking.service_category, booking.eco_preference, &booking.window)
            .await?;

        let declined: HashSet<ProviderId> = if config.reinvite_declined {
            HashSet::new()
        } else {
            self.storage
                .list_invitations(booking.id)
                .await?
                .iter()
                .filter(|i| i.is_provider_decline())
                .map(|i| i.data().provider_id)
                .collect()
        };
        let candidates: Vec<_> = candidates.into_iter().filter(|c| !declined.contains(&c.id)).collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<ProviderId> = candidates.iter().map(|c| c.id).collect();
        let busy: HashSet<ProviderId> = self
            .storage
            .active_locks_overlapping(&ids, booking.window)
            .await?
            .iter()
            .map(|lock| lock.data().provider_id)
            .collect();

        let busy = &busy;
        let snapshots = join_all(candidates.into_iter().map(|candidate| async move {
            let (distance, price) = tokio::join!(
                self.oracle.distance_km(&candidate, booking),
                self.oracle.price_estimate(&candidate, booking)
            );
            let distance_km = distance.unwrap_or_else(|e| {
                warn!(provider_id = %candidate.id, error = %e, "Distance lookup failed, treating as unknown");
                None
            });
            let price_cents = price.unwrap_or_else(|e| {
                warn!(provider_id = %candidate.id, error = %e, "Price lookup failed, treating as unknown");
                None
            });
            CandidateSnapshot {
                busy: busy.contains(&candidate.id),
                candidate,
                distance_km,
                price_cents,
            }
        }))
        .await;

        let ranked = scoring::score(ScoringInput {
            booking,
            candidates: snapshots,
            config,
            distance_ceiling_km,
            force_team_bonus,
        });
        debug!(ranked = ranked.len(), distance_ceiling_km, "Candidates ranked");
        Ok(ranked)
    }

    /// Invite the top of `ranked` until the round's fanout is met.
    ///
    /// Each invitation is created only after its slot lock is held. Providers whose slot is taken
    /// are skipped and reported in `conflicts`.
    #[instrument(skip(self, booking, ranked, config), fields(booking_id = %booking.id, round = booking.matching_retry_count), err)]
    pub async fn issue(
        &self,
        booking: &BookingRequest,
        ranked: &[RankedCandidate],
        config: &VersionedMatchingConfig,
        now: DateTime<Utc>,
    ) -> Result<IssueOutcome> {
        let outstanding = self
            .storage
            .list_invitations(booking.id)
            .await?
            .iter()
            .filter(|i| i.is_outstanding())
            .count();
        let assigned = self.storage.list_assignments(booking.id).await?.len();
        let still_needed = (booking.required_providers as usize).saturating_sub(assigned);
        let fanout = (config.config.fanout_size as usize).max(still_needed);
        let wanted = fanout.saturating_sub(outstanding);

        let mut invitations = Vec::new();
        let mut conflicts = Vec::new();
        for candidate in ranked {
            if invitations.len() >= wanted {
                break;
            }
            let provider_id = candidate.candidate.id;
            let request = LockRequest {
                booking_id: booking.id,
                provider_id,
                window: booking.window,
                ttl: config.config.response_window(),
            };
            let lock = match SlotLock::acquire(request, now, self.storage.as_ref()).await? {
                LockAcquisition::Acquired(lock) => lock,
                LockAcquisition::Conflict { conflicting } => {
                    metrics::counter!("smartmatch_lock_conflicts_total").increment(1);
                    debug!(provider_id = %provider_id, conflicting = %conflicting, "Slot already locked, skipping candidate");
                    conflicts.push(provider_id);
                    continue;
                }
            };

            let data = InvitationData {
                id: InvitationId::new(),
                booking_id: booking.id,
                provider_id,
                lock_id: lock.data.id,
                round: booking.matching_retry_count,
                created_at: now,
                expires_at: lock.data.expires_at,
                metadata: serde_json::json!({
                    "score": candidate.score,
                    "breakdown": candidate.breakdown,
                    "distance_km": candidate.distance_km,
                    "price_cents": candidate.price_cents,
                    "config_version": config.version,
                }),
            };
            let lock_id = lock.data.id;
            match Invitation::issue(data, self.storage.as_ref()).await {
                Ok(invitation) => {
                    self.notify(&invitation.data);
                    invitations.push(invitation);
                }
                Err(e) => {
                    // Never leave a lock behind without its invitation
                    if let Err(release_err) =
                        release_lock(self.storage.as_ref(), lock_id, ReleaseReason::Superseded, now).await
                    {
                        warn!(lock_id = %lock_id, error = %release_err, "Failed to release lock of failed invitation");
                    }
                    match e {
                        Error::Storage(StorageError::UniqueViolation { .. }) => {
                            debug!(provider_id = %provider_id, "Provider already has an open invitation, skipping");
                            conflicts.push(provider_id);
                        }
                        other => return Err(other),
                    }
                }
            }
        }

        metrics::counter!("smartmatch_invitations_issued_total").increment(invitations.len() as u64);
        if invitations.is_empty() && outstanding == 0 {
            info!(conflicts = conflicts.len(), "No candidate could be invited");
            return Ok(IssueOutcome::Exhausted { conflicts });
        }
        info!(
            issued = invitations.len(),
            outstanding = outstanding + invitations.len(),
            conflicts = conflicts.len(),
            "Invitations issued"
        );
        Ok(IssueOutcome::Issued { invitations, conflicts })
    }

    fn notify(&self, invitation: &InvitationData) {
        let dispatch = Arc::clone(&self.dispatch);
        let invitation = invitation.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatch.notify(&invitation).await {
                warn!(invitation_id = %invitation.id, provider_id = %invitation.provider_id, error = %e, "Failed to dispatch invitation");
            }
        });
    }

    /// Record that the provider opened the invitation. Idempotent.
    #[instrument(skip(self), fields(invitation_id = %invitation_id), err)]
    pub async fn mark_viewed(&self, invitation_id: InvitationId, now: DateTime<Utc>) -> Result<ViewOutcome> {
        match self.storage.get_invitation(invitation_id).await? {
            AnyInvitation::Pending(invitation) => match invitation.mark_viewed(now, self.storage.as_ref()).await {
                Ok(viewed) => Ok(ViewOutcome::Viewed(viewed)),
                Err(Error::Storage(StorageError::InvalidState { .. })) => {
                    // Raced another view or a response
                    match self.storage.get_invitation(invitation_id).await? {
                        AnyInvitation::Viewed(viewed) => Ok(ViewOutcome::AlreadyViewed(viewed)),
                        other => Ok(ViewOutcome::Conflict { status: other.status() }),
                    }
                }
                Err(e) => Err(e),
            },
            AnyInvitation::Viewed(viewed) => Ok(ViewOutcome::AlreadyViewed(viewed)),
            other => Ok(ViewOutcome::Conflict { status: other.status() }),
        }
    }

    /// Apply a provider's answer.
    ///
    /// Accepting confirms the slot lock, records the assignment and, once the booking is fully
    /// staffed, retires the remaining invitations, all in one storage operation. Declining
    /// releases the lock; if that leaves nothing outstanding the escalation policy takes over.
    #[instrument(skip(self), fields(invitation_id = %invitation_id), err)]
    pub async fn respond(
        &self,
        invitation_id: InvitationId,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<ResponseOutcome> {
        match self.storage.get_invitation(invitation_id).await? {
            AnyInvitation::Pending(invitation) => self.respond_outstanding(invitation, decision, now).await,
            AnyInvitation::Viewed(invitation) => self.respond_outstanding(invitation, decision, now).await,
            other => Ok(ResponseOutcome::Conflict {
                status: other.status(),
                message: format!("invitation {invitation_id} is already {}", other.status()),
            }),
        }
    }

    async fn respond_outstanding<T>(
        &self,
        invitation: Invitation<T>,
        decision: Decision,
        now: DateTime<Utc>,
    ) -> Result<ResponseOutcome>
    where
        T: Outstanding + Clone,
        AnyInvitation: From<Invitation<T>>,
    {
        let id = invitation.data.id;
        let booking_id = invitation.data.booking_id;
        let round = invitation.data.round;

        if now >= invitation.data.expires_at {
            // The sweep has not caught up yet; expire it here instead of accepting late
            if self.expire_outstanding(invitation, now).await?.is_some() {
                self.handle_exhaustion(booking_id, round, now).await?;
            }
            let status = self.storage.get_invitation(id).await?.status();
            return Ok(ResponseOutcome::Conflict {
                status,
                message: format!("invitation {id} expired before the response arrived"),
            });
        }

        match decision {
            Decision::Accept => match invitation.accept(now, self.storage.as_ref()).await {
                Ok(commit) => {
                    metrics::counter!("smartmatch_invitations_accepted_total").increment(1);
                    info!(
                        booking_id = %booking_id,
                        provider_id = %commit.assignment.provider_id,
                        fully_staffed = commit.fully_staffed,
                        siblings_declined = commit.cleanup.declined.len(),
                        "Invitation accepted"
                    );
                    // A team mission can run out of invitations on an acceptance too
                    let next = if commit.fully_staffed {
                        MatchingProgress::Idle
                    } else {
                        self.handle_exhaustion(booking_id, round, now).await?
                    };
                    Ok(ResponseOutcome::Accepted { commit, next })
                }
                Err(Error::Storage(
                    e @ (StorageError::InvalidState { .. } | StorageError::UniqueViolation { .. }),
                )) => {
                    let status = self.storage.get_invitation(id).await?.status();
                    debug!(error = %e, status = %status, "Acceptance lost a race");
                    Ok(ResponseOutcome::Conflict {
                        status,
                        message: e.to_string(),
                    })
                }
                Err(e) => Err(e),
            },
            Decision::Decline => {
                let declined = match invitation
                    .decline(DeclineReason::ProviderDeclined, now, self.storage.as_ref())
                    .await
                {
                    Ok(declined) => declined,
                    Err(Error::Storage(e @ StorageError::InvalidState { .. })) => {
                        let status = self.storage.get_invitation(id).await?.status();
                        return Ok(ResponseOutcome::Conflict {
                            status,
                            message: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                };
                release_lock(
                    self.storage.as_ref(),
                    declined.data.lock_id,
                    ReleaseReason::InvitationDeclined,
                    now,
                )
                .await?;
                metrics::counter!("smartmatch_invitations_declined_total").increment(1);
                info!(booking_id = %booking_id, provider_id = %declined.data.provider_id, "Invitation declined");

                let next = self.handle_exhaustion(booking_id, round, now).await?;
                Ok(ResponseOutcome::Declined {
                    invitation: declined,
                    next,
                })
            }
        }
    }

    /// Expire an invitation whose response window has elapsed, release its lock and, if it was
    /// the last outstanding one, hand the booking to the escalation policy.
    #[instrument(skip(self), fields(invitation_id = %invitation_id), err)]
    pub async fn expire(&self, invitation_id: InvitationId, now: DateTime<Utc>) -> Result<ExpiryOutcome> {
        let invitation = self.storage.get_invitation(invitation_id).await?;
        if !invitation.is_outstanding() {
            return Ok(ExpiryOutcome::AlreadyResolved {
                status: invitation.status(),
            });
        }
        if now < invitation.data().expires_at {
            return Ok(ExpiryOutcome::NotDue);
        }
        let booking_id = invitation.data().booking_id;
        let expired = match invitation {
            AnyInvitation::Pending(invitation) => self.expire_outstanding(invitation, now).await?,
            AnyInvitation::Viewed(invitation) => self.expire_outstanding(invitation, now).await?,
            _ => None,
        };
        let Some(invitation) = expired else {
            let status = self.storage.get_invitation(invitation_id).await?.status();
            return Ok(ExpiryOutcome::AlreadyResolved { status });
        };

        let next = self.handle_exhaustion(booking_id, invitation.data.round, now).await?;
        Ok(ExpiryOutcome::Expired { invitation, next })
    }

    /// Expire and release. Returns `None` when something else resolved the invitation first.
    async fn expire_outstanding<T>(&self, invitation: Invitation<T>, now: DateTime<Utc>) -> Result<Option<Invitation<Expired>>>
    where
        T: Outstanding + Clone,
        AnyInvitation: From<Invitation<T>>,
    {
        let expired = match invitation.expire(now, self.storage.as_ref()).await {
            Ok(expired) => expired,
            Err(Error::Storage(StorageError::InvalidState { .. })) => return Ok(None),
            Err(e) => return Err(e),
        };
        release_lock(
            self.storage.as_ref(),
            expired.data.lock_id,
            ReleaseReason::InvitationExpired,
            now,
        )
        .await?;
        metrics::counter!("smartmatch_invitations_expired_total").increment(1);
        debug!(
            booking_id = %expired.data.booking_id,
            provider_id = %expired.data.provider_id,
            "Invitation expired"
        );
        Ok(Some(expired))
    }
}

/// Storage conflicts on operations without a typed outcome surface as [`Error::Conflict`].
fn into_conflict(err: StorageError) -> Error {
    match err {
        e @ (StorageError::InvalidState { .. }
        | StorageError::UniqueViolation { .. }
        | StorageError::ExclusionViolation { .. }) => Error::Conflict { message: e.to_string() },
        other => Error::Storage(other),
    }
}
