//! Operator console operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::booking::{BookingRequest, BookingStatus, FallbackTeamCandidate, StatusActor};
use crate::errors::{Error, Result};
use crate::guardrails::GuardrailReport;
use crate::matching_config::{MatchingConfig, VersionedMatchingConfig};
use crate::storage::{ClosedBooking, DirectAssignment, StatusUpdate, Storage};
use crate::types::{BookingId, FallbackCandidateId, ProviderId};

use super::{MatchingEngine, into_conflict};

/// A booking on the operator fallback queue with its team proposals.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackQueueEntry {
    pub booking: BookingRequest,
    pub candidates: Vec<FallbackTeamCandidate>,
}

/// Which team an operator force-assigns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamSelection {
    /// A proposal attached by the escalation policy
    Candidate(FallbackCandidateId),
    /// An ad-hoc team
    Members(Vec<ProviderId>),
}

impl<S: Storage> MatchingEngine<S> {
    /// Bookings awaiting operator attention, escalated first.
    pub async fn fallback_queue(&self) -> Result<Vec<FallbackQueueEntry>> {
        let bookings = self.storage.fallback_queue().await?;
        let mut entries = Vec::with_capacity(bookings.len());
        for booking in bookings {
            let candidates = self.storage.list_fallback_candidates(booking.id).await?;
            entries.push(FallbackQueueEntry { booking, candidates });
        }
        Ok(entries)
    }

    /// Assign a provider directly, bypassing invitations.
    #[instrument(skip(self), fields(booking_id = %booking_id, provider_id = %provider_id), err)]
    pub async fn force_assign(
        &self,
        booking_id: BookingId,
        provider_id: ProviderId,
        now: DateTime<Utc>,
    ) -> Result<DirectAssignment> {
        self.assign_directly(booking_id, &[provider_id], now).await
    }

    /// Assign a whole team directly, bypassing invitations.
    #[instrument(skip(self, selection), fields(booking_id = %booking_id), err)]
    pub async fn force_assign_team(
        &self,
        booking_id: BookingId,
        selection: TeamSelection,
        now: DateTime<Utc>,
    ) -> Result<DirectAssignment> {
        let members = match selection {
            TeamSelection::Candidate(id) => {
                self.storage
                    .list_fallback_candidates(booking_id)
                    .await?
                    .into_iter()
                    .find(|c| c.id == id)
                    .ok_or_else(|| Error::NotFound {
                        resource: "fallback team candidate".to_string(),
                        id: id.to_string(),
                    })?
                    .members
            }
            TeamSelection::Members(members) => members,
        };
        if members.is_empty() {
            return Err(Error::Validation {
                message: "a team needs at least one member".to_string(),
            });
        }
        self.assign_directly(booking_id, &members, now).await
    }

    async fn assign_directly(
        &self,
        booking_id: BookingId,
        providers: &[ProviderId],
        now: DateTime<Utc>,
    ) -> Result<DirectAssignment> {
        let assigned = self
            .storage
            .assign_directly(booking_id, providers, now)
            .await
            .map_err(into_conflict)?;
        metrics::counter!("smartmatch_operator_assignments_total").increment(assigned.assignments.len() as u64);
        info!(
            assigned = assigned.assignments.len(),
            fully_staffed = assigned.fully_staffed,
            invitations_declined = assigned.cleanup.declined.len(),
            "Operator assignment"
        );
        Ok(assigned)
    }

    /// Cancel a booking, retiring its invitations and releasing its locks in one operation.
    ///
    /// `provider_id` names the cancelling provider and is required exactly when `actor` is
    /// [`StatusActor::Provider`]; guardrails count cancellations per provider.
    #[instrument(skip(self), fields(booking_id = %booking_id), err)]
    pub async fn cancel_booking(
        &self,
        booking_id: BookingId,
        actor: StatusActor,
        provider_id: Option<ProviderId>,
        now: DateTime<Utc>,
    ) -> Result<ClosedBooking> {
        match (actor, provider_id) {
            (StatusActor::Provider, None) => {
                return Err(Error::Validation {
                    message: "a provider cancellation must name the provider".to_string(),
                });
            }
            (StatusActor::Provider, Some(_)) | (_, None) => {}
            (other, Some(provider_id)) => {
                return Err(Error::Validation {
                    message: format!("provider {provider_id} given for a cancellation by {}", other.as_str()),
                });
            }
        }
        let update = StatusUpdate {
            to: BookingStatus::Cancelled,
            actor,
            provider_id,
        };
        let closed = self
            .storage
            .close_booking(booking_id, update, now)
            .await
            .map_err(into_conflict)?;
        info!(
            previous = %closed.previous_status,
            actor = actor.as_str(),
            invitations_declined = closed.cleanup.declined.len(),
            locks_released = closed.cleanup.released.len(),
            "Booking cancelled"
        );
        Ok(closed)
    }

    /// Mark a booking completed and release its confirmed locks.
    #[instrument(skip(self), fields(booking_id = %booking_id), err)]
    pub async fn complete_booking(&self, booking_id: BookingId, now: DateTime<Utc>) -> Result<ClosedBooking> {
        let update = StatusUpdate::new(BookingStatus::Completed, StatusActor::Operator);
        let closed = self
            .storage
            .close_booking(booking_id, update, now)
            .await
            .map_err(into_conflict)?;
        info!(locks_released = closed.cleanup.released.len(), "Booking completed");
        Ok(closed)
    }

    /// Store a new matching config version. Invitations already out keep their terms.
    #[instrument(skip(self, config), err)]
    pub async fn replace_matching_config(
        &self,
        config: &MatchingConfig,
        now: DateTime<Utc>,
    ) -> Result<VersionedMatchingConfig> {
        config.validate()?;
        let stored = self.storage.replace_matching_config(config, now).await?;
        info!(version = stored.version, "Matching config replaced");
        Ok(stored)
    }

    /// Guardrail report for `[from, to)`.
    pub async fn guardrail_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<GuardrailReport> {
        self.guardrails.report(self.storage.as_ref(), from, to, now).await
    }

    /// The report last computed by the guardrail monitor task, if any.
    pub fn latest_guardrail_report(&self) -> Option<Arc<GuardrailReport>> {
        self.guardrails.latest()
    }

    /// Recompute the trailing guardrail report and keep it as the latest.
    pub async fn refresh_guardrails(&self, period: chrono::Duration, now: DateTime<Utc>) -> Result<Arc<GuardrailReport>> {
        self.guardrails.refresh(self.storage.as_ref(), period, now).await
    }
}
