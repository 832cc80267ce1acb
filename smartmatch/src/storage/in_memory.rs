//! In-memory storage implementation.
//!
//! All tables live behind a single `RwLock`, so every multi-record operation (acceptance,
//! cancellation, operator assignment) is trivially atomic. A per-provider lock index keeps
//! availability checks from scanning every lock ever taken. Suitable for tests, the CLI and
//! single-process deployments; state is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::booking::{
    Assignment, AssignmentSource, BookingRequest, BookingStatus, BookingStatusChange, FallbackTeamCandidate, StatusActor,
};
use crate::invitation::{
    Accepted, AnyInvitation, DeclineReason, Declined, Invitation, InvitationState, InvitationStatus, Pending,
};
use crate::matching_config::{MatchingConfig, VersionedMatchingConfig};
use crate::slot_lock::{
    AnySlotLock, Confirmed, Held, LockAcquisition, LockState, LockStatus, ReleaseReason, Released, SlotLock,
    SlotLockData,
};
use crate::types::{AssignmentId, BookingId, InvitationId, LockId, ProviderId, TimeWindow};

use super::{
    AcceptCommit, ClosedBooking, DirectAssignment, Result, SiblingCleanup, StatusUpdate, Storage, StorageError,
    sort_fallback_queue,
};

#[derive(Default)]
struct Tables {
    bookings: HashMap<BookingId, BookingRequest>,
    invitations: HashMap<InvitationId, AnyInvitation>,
    locks: HashMap<LockId, AnySlotLock>,
    assignments: Vec<Assignment>,
    fallback_candidates: Vec<FallbackTeamCandidate>,
    status_changes: Vec<BookingStatusChange>,
}

/// In-memory implementation of the [`Storage`] trait.
///
/// # Example
/// ```ignore
/// let storage = InMemoryStorage::new();
/// storage.ensure_matching_config(&MatchingConfig::default(), Utc::now()).await?;
/// storage.insert_booking(&booking).await?;
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
    /// HELD/CONFIRMED lock ids per provider. Always locked after `tables`.
    provider_locks: Arc<DashMap<ProviderId, Vec<LockId>>>,
    matching_config: Arc<ArcSwapOption<VersionedMatchingConfig>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop released locks from the availability index.
    fn unindex(&self, tables: &Tables, released: &[LockId]) {
        for lock_id in released {
            let Some(lock) = tables.locks.get(lock_id) else {
                continue;
            };
            let provider_id = lock.data().provider_id;
            if let Some(mut ids) = self.provider_locks.get_mut(&provider_id) {
                ids.retain(|id| id != lock_id);
            }
            self.provider_locks.remove_if(&provider_id, |_, ids| ids.is_empty());
        }
    }

    #[cfg(test)]
    fn indexed_locks(&self, provider_id: ProviderId) -> usize {
        self.provider_locks.get(&provider_id).map_or(0, |ids| ids.len())
    }
}

impl Tables {
    fn booking(&self, id: BookingId) -> Result<&BookingRequest> {
        self.bookings.get(&id).ok_or_else(|| StorageError::not_found("booking", id))
    }

    fn booking_mut(&mut self, id: BookingId) -> Result<&mut BookingRequest> {
        self.bookings.get_mut(&id).ok_or_else(|| StorageError::not_found("booking", id))
    }

    fn assignment_count(&self, booking_id: BookingId) -> usize {
        self.assignments.iter().filter(|a| a.booking_id == booking_id).count()
    }

    fn transition_booking(
        &mut self,
        id: BookingId,
        expected: &[BookingStatus],
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<BookingRequest> {
        let booking = self.booking_mut(id)?;
        if !expected.contains(&booking.status) {
            let expected = expected.iter().map(BookingStatus::as_str).collect::<Vec<_>>().join(" or ");
            return Err(StorageError::invalid_state("booking", id, booking.status.as_str(), &expected));
        }
        let from = booking.status;
        booking.status = update.to;
        booking.updated_at = now;
        let updated = booking.clone();

        self.status_changes.push(BookingStatusChange {
            booking_id: id,
            client_id: updated.client_id,
            provider_id: update.provider_id,
            from,
            to: update.to,
            actor: update.actor,
            changed_at: now,
        });
        Ok(updated)
    }

    fn release_in_place(&mut self, lock_id: LockId, reason: ReleaseReason, now: DateTime<Utc>) -> bool {
        let Some(lock) = self.locks.remove(&lock_id) else {
            return false;
        };
        let (released, changed) = match released(lock, reason, now) {
            Ok(lock) => (AnySlotLock::Released(lock), true),
            Err(unchanged) => (unchanged, false),
        };
        self.locks.insert(lock_id, released);
        changed
    }

    fn decline_in_place(&mut self, invitation_id: InvitationId, reason: DeclineReason, now: DateTime<Utc>) -> Option<LockId> {
        let invitation = self.invitations.remove(&invitation_id)?;
        let lock_id = invitation.data().lock_id;
        match declined(invitation, reason, now) {
            Ok(declined) => {
                self.invitations.insert(invitation_id, declined.into());
                Some(lock_id)
            }
            Err(unchanged) => {
                self.invitations.insert(invitation_id, unchanged);
                None
            }
        }
    }

    /// Decline every outstanding invitation of `booking_id` and release their locks.
    fn decline_outstanding(
        &mut self,
        booking_id: BookingId,
        reason: DeclineReason,
        release_reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> SiblingCleanup {
        let mut outstanding: Vec<InvitationId> = self
            .invitations
            .values()
            .filter(|i| i.data().booking_id == booking_id && i.is_outstanding())
            .map(|i| i.id())
            .collect();
        outstanding.sort();

        let mut cleanup = SiblingCleanup::default();
        for invitation_id in outstanding {
            if let Some(lock_id) = self.decline_in_place(invitation_id, reason, now) {
                cleanup.declined.push(invitation_id);
                if self.release_in_place(lock_id, release_reason, now) {
                    cleanup.released.push(lock_id);
                }
            }
        }
        cleanup
    }

    fn cleanup_siblings(&mut self, booking_id: BookingId, now: DateTime<Utc>) -> Result<SiblingCleanup> {
        let required = self.booking(booking_id)?.required_providers;
        if self.assignment_count(booking_id) < required as usize {
            return Ok(SiblingCleanup::default());
        }
        Ok(self.decline_outstanding(
            booking_id,
            DeclineReason::for_sibling(required),
            ReleaseReason::Superseded,
            now,
        ))
    }

    fn first_blocking_lock(
        &self,
        index: &DashMap<ProviderId, Vec<LockId>>,
        provider_id: ProviderId,
        window: &TimeWindow,
    ) -> Option<LockId> {
        let ids = index.get(&provider_id)?;
        ids.iter()
            .filter_map(|id| self.locks.get(id))
            .find(|lock| lock.blocks(window))
            .map(AnySlotLock::id)
    }
}

/// Move an outstanding invitation to declined, or hand it back unchanged.
fn declined(
    invitation: AnyInvitation,
    reason: DeclineReason,
    now: DateTime<Utc>,
) -> std::result::Result<Invitation<Declined>, AnyInvitation> {
    let viewed_at = invitation.viewed_at();
    match invitation {
        AnyInvitation::Pending(Invitation { data, .. }) | AnyInvitation::Viewed(Invitation { data, .. }) => Ok(Invitation {
            state: Declined {
                viewed_at,
                responded_at: now,
                reason,
            },
            data,
        }),
        other => Err(other),
    }
}

/// Move an active lock to released, or hand it back unchanged.
fn released(lock: AnySlotLock, reason: ReleaseReason, now: DateTime<Utc>) -> std::result::Result<SlotLock<Released>, AnySlotLock> {
    let confirmed_at = lock.confirmed_at();
    match lock {
        AnySlotLock::Held(SlotLock { data, .. }) | AnySlotLock::Confirmed(SlotLock { data, .. }) => Ok(SlotLock {
            state: Released {
                confirmed_at,
                released_at: now,
                reason,
            },
            data,
        }),
        other => Err(other),
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_booking(&self, booking: &BookingRequest) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.bookings.contains_key(&booking.id) {
            return Err(StorageError::UniqueViolation {
                constraint: Some("bookings_pkey".to_string()),
                table: Some("bookings".to_string()),
                message: format!("booking {} already exists", booking.id),
            });
        }
        tables.bookings.insert(booking.id, booking.clone());
        Ok(())
    }

    async fn get_booking(&self, id: BookingId) -> Result<BookingRequest> {
        self.tables.read().booking(id).cloned()
    }

    async fn set_booking_status(
        &self,
        id: BookingId,
        expected: &[BookingStatus],
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<BookingRequest> {
        self.tables.write().transition_booking(id, expected, update, now)
    }

    async fn record_exhaustion(&self, id: BookingId, round: u32, now: DateTime<Utc>) -> Result<Option<BookingRequest>> {
        let mut tables = self.tables.write();
        let booking = tables.booking(id)?;
        let exhausted = booking.matching_retry_count == round
            && booking.is_matchable()
            && booking.fallback_requested_at.is_none()
            && tables.assignment_count(id) < booking.required_providers as usize
            && !tables
                .invitations
                .values()
                .any(|i| i.data().booking_id == id && i.is_outstanding());
        if !exhausted {
            return Ok(None);
        }

        let booking = tables.booking_mut(id)?;
        booking.matching_retry_count = round.saturating_add(1);
        booking.updated_at = now;
        Ok(Some(booking.clone()))
    }

    async fn request_fallback(&self, id: BookingId, short_notice: bool, now: DateTime<Utc>) -> Result<BookingRequest> {
        let mut tables = self.tables.write();
        let booking = tables.booking_mut(id)?;
        if booking.fallback_requested_at.is_none() {
            booking.fallback_requested_at = Some(now);
        }
        booking.short_notice |= short_notice;
        booking.updated_at = now;
        Ok(booking.clone())
    }

    async fn mark_fallback_escalated(&self, id: BookingId, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.write();
        let booking = tables.booking_mut(id)?;
        if booking.fallback_escalated_at.is_some() {
            return Ok(false);
        }
        booking.fallback_escalated_at = Some(now);
        booking.updated_at = now;
        Ok(true)
    }

    async fn bookings_needing_fallback(&self, starts_before: DateTime<Utc>) -> Result<Vec<BookingRequest>> {
        let tables = self.tables.read();
        let mut bookings: Vec<BookingRequest> = tables
            .bookings
            .values()
            .filter(|b| b.is_matchable() && b.fallback_requested_at.is_none() && b.window.start <= starts_before)
            .cloned()
            .collect();
        bookings.sort_by_key(|b| (b.window.start, b.id));
        Ok(bookings)
    }

    async fn bookings_pending_escalation(&self, starts_before: DateTime<Utc>) -> Result<Vec<BookingRequest>> {
        let tables = self.tables.read();
        let mut bookings: Vec<BookingRequest> = tables
            .bookings
            .values()
            .filter(|b| {
                b.is_matchable()
                    && b.fallback_requested_at.is_some()
                    && b.fallback_escalated_at.is_none()
                    && b.window.start <= starts_before
            })
            .cloned()
            .collect();
        bookings.sort_by_key(|b| (b.window.start, b.id));
        Ok(bookings)
    }

    async fn fallback_queue(&self) -> Result<Vec<BookingRequest>> {
        let tables = self.tables.read();
        let mut queue: Vec<BookingRequest> = tables
            .bookings
            .values()
            .filter(|b| b.is_matchable() && b.fallback_requested_at.is_some())
            .cloned()
            .collect();
        sort_fallback_queue(&mut queue);
        Ok(queue)
    }

    async fn close_booking(&self, id: BookingId, update: StatusUpdate, now: DateTime<Utc>) -> Result<ClosedBooking> {
        let (expected, release_reason) = match update.to {
            BookingStatus::Cancelled => (update.to.closing_sources(), ReleaseReason::BookingCancelled),
            BookingStatus::Completed => (update.to.closing_sources(), ReleaseReason::BookingCompleted),
            other => {
                return Err(StorageError::CheckViolation {
                    constraint: None,
                    table: Some("bookings".to_string()),
                    message: format!("{other} is not a closing status"),
                });
            }
        };
        let expected = expected.unwrap_or_default();

        let mut tables = self.tables.write();
        let previous_status = tables.booking(id)?.status;
        let booking = tables.transition_booking(id, expected, update, now)?;

        let mut cleanup = tables.decline_outstanding(id, DeclineReason::BookingCancelled, release_reason, now);
        let active: Vec<LockId> = tables
            .locks
            .values()
            .filter(|l| l.data().booking_id == id && l.is_active())
            .map(AnySlotLock::id)
            .collect();
        for lock_id in active {
            if tables.release_in_place(lock_id, release_reason, now) {
                cleanup.released.push(lock_id);
            }
        }
        self.unindex(&tables, &cleanup.released);

        Ok(ClosedBooking {
            booking,
            previous_status,
            cleanup,
        })
    }

    async fn create_invitation(&self, invitation: &Invitation<Pending>) -> Result<()> {
        let mut tables = self.tables.write();
        let data = &invitation.data;

        let duplicate = tables.invitations.values().any(|i| {
            i.is_outstanding() && i.data().booking_id == data.booking_id && i.data().provider_id == data.provider_id
        });
        if duplicate || tables.invitations.contains_key(&data.id) {
            return Err(StorageError::UniqueViolation {
                constraint: Some("invitations_one_outstanding_per_provider".to_string()),
                table: Some("invitations".to_string()),
                message: format!("provider {} already has an open invitation for booking {}", data.provider_id, data.booking_id),
            });
        }
        if !tables.bookings.contains_key(&data.booking_id) {
            return Err(StorageError::ForeignKeyViolation {
                constraint: Some("invitations_booking_id_fkey".to_string()),
                table: Some("invitations".to_string()),
                message: format!("booking {} does not exist", data.booking_id),
            });
        }
        match tables.locks.get(&data.lock_id) {
            Some(AnySlotLock::Held(_)) => {}
            Some(other) => {
                return Err(StorageError::invalid_state("slot_lock", data.lock_id, other.status().as_str(), "held"));
            }
            None => {
                return Err(StorageError::ForeignKeyViolation {
                    constraint: Some("invitations_lock_id_fkey".to_string()),
                    table: Some("invitations".to_string()),
                    message: format!("slot lock {} does not exist", data.lock_id),
                });
            }
        }

        tables.invitations.insert(data.id, invitation.clone().into());
        Ok(())
    }

    async fn get_invitation(&self, id: InvitationId) -> Result<AnyInvitation> {
        self.tables
            .read()
            .invitations
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("invitation", id))
    }

    async fn list_invitations(&self, booking_id: BookingId) -> Result<Vec<AnyInvitation>> {
        let tables = self.tables.read();
        let mut invitations: Vec<AnyInvitation> = tables
            .invitations
            .values()
            .filter(|i| i.data().booking_id == booking_id)
            .cloned()
            .collect();
        invitations.sort_by_key(|i| (i.data().created_at, i.id()));
        Ok(invitations)
    }

    async fn persist_invitation<T: InvitationState + Clone>(&self, invitation: &Invitation<T>) -> Result<()>
    where
        AnyInvitation: From<Invitation<T>>,
    {
        let id = invitation.data.id;
        let next = AnyInvitation::from(invitation.clone());

        let mut tables = self.tables.write();
        let current = tables
            .invitations
            .get(&id)
            .ok_or_else(|| StorageError::not_found("invitation", id))?
            .status();
        if !current.can_transition_to(next.status()) {
            return Err(StorageError::invalid_state(
                "invitation",
                id,
                current.as_str(),
                &format!("a state that can become {}", next.status()),
            ));
        }
        tables.invitations.insert(id, next);
        Ok(())
    }

    async fn outstanding_invitations_expired_before(&self, now: DateTime<Utc>) -> Result<Vec<AnyInvitation>> {
        let tables = self.tables.read();
        let mut expired: Vec<AnyInvitation> = tables
            .invitations
            .values()
            .filter(|i| i.is_outstanding() && i.data().expires_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|i| (i.data().expires_at, i.id()));
        Ok(expired)
    }

    async fn invitations_responded_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AnyInvitation>> {
        let tables = self.tables.read();
        Ok(tables
            .invitations
            .values()
            .filter(|i| i.responded_at().is_some_and(|at| from <= at && at < to))
            .cloned()
            .collect())
    }

    async fn accept_invitation(&self, invitation: &Invitation<Accepted>, now: DateTime<Utc>) -> Result<AcceptCommit> {
        let data = &invitation.data;
        let mut tables = self.tables.write();

        // Check everything before touching anything
        let current = tables
            .invitations
            .get(&data.id)
            .ok_or_else(|| StorageError::not_found("invitation", data.id))?
            .status();
        if !current.can_transition_to(InvitationStatus::Accepted) {
            return Err(StorageError::invalid_state("invitation", data.id, current.as_str(), "pending or viewed"));
        }
        let lock_data = match tables.locks.get(&data.lock_id) {
            Some(AnySlotLock::Held(lock)) if !lock.data.is_expired(now) => lock.data.clone(),
            Some(AnySlotLock::Held(_)) => {
                return Err(StorageError::invalid_state("slot_lock", data.lock_id, "expired", "held"));
            }
            Some(other) => {
                return Err(StorageError::invalid_state("slot_lock", data.lock_id, other.status().as_str(), "held"));
            }
            None => return Err(StorageError::not_found("slot_lock", data.lock_id)),
        };
        let booking = tables.booking(data.booking_id)?;
        if !booking.is_matchable() {
            return Err(StorageError::invalid_state("booking", booking.id, booking.status.as_str(), "pending_provider"));
        }
        let required = booking.required_providers as usize;
        if tables
            .assignments
            .iter()
            .any(|a| a.booking_id == data.booking_id && a.provider_id == data.provider_id)
        {
            return Err(StorageError::UniqueViolation {
                constraint: Some("assignments_booking_id_provider_id_key".to_string()),
                table: Some("assignments".to_string()),
                message: format!("provider {} is already assigned to booking {}", data.provider_id, data.booking_id),
            });
        }
        let assigned = tables.assignment_count(data.booking_id);

        // Commit
        let lock = SlotLock {
            state: Confirmed { confirmed_at: now },
            data: lock_data,
        };
        tables.locks.insert(lock.data.id, lock.clone().into());
        tables.invitations.insert(data.id, invitation.clone().into());

        let assignment = Assignment {
            id: AssignmentId::new(),
            booking_id: data.booking_id,
            provider_id: data.provider_id,
            lock_id: data.lock_id,
            source: AssignmentSource::Invitation,
            created_at: now,
        };
        tables.assignments.push(assignment.clone());

        let fully_staffed = assigned + 1 >= required;
        let cleanup = if fully_staffed {
            tables.transition_booking(
                data.booking_id,
                &[BookingStatus::PendingProvider],
                StatusUpdate::by_provider(BookingStatus::Confirmed, data.provider_id),
                now,
            )?;
            tables.cleanup_siblings(data.booking_id, now)?
        } else {
            SiblingCleanup::default()
        };
        self.unindex(&tables, &cleanup.released);

        Ok(AcceptCommit {
            assignment,
            lock,
            fully_staffed,
            cleanup,
        })
    }

    async fn cleanup_siblings(&self, booking_id: BookingId, now: DateTime<Utc>) -> Result<SiblingCleanup> {
        let mut tables = self.tables.write();
        let cleanup = tables.cleanup_siblings(booking_id, now)?;
        self.unindex(&tables, &cleanup.released);
        Ok(cleanup)
    }

    async fn try_acquire_lock(&self, lock: SlotLock<Held>) -> Result<LockAcquisition> {
        let mut tables = self.tables.write();
        let provider_id = lock.data.provider_id;

        if let Some(conflicting) = tables.first_blocking_lock(&self.provider_locks, provider_id, &lock.data.window) {
            return Ok(LockAcquisition::Conflict { conflicting });
        }

        tables.locks.insert(lock.data.id, lock.clone().into());
        self.provider_locks.entry(provider_id).or_default().push(lock.data.id);
        Ok(LockAcquisition::Acquired(lock))
    }

    async fn get_lock(&self, id: LockId) -> Result<AnySlotLock> {
        self.tables
            .read()
            .locks
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("slot_lock", id))
    }

    async fn persist_lock<T: LockState + Clone>(&self, lock: &SlotLock<T>) -> Result<()>
    where
        AnySlotLock: From<SlotLock<T>>,
    {
        let id = lock.data.id;
        let next = AnySlotLock::from(lock.clone());

        let mut tables = self.tables.write();
        let current = tables
            .locks
            .get(&id)
            .ok_or_else(|| StorageError::not_found("slot_lock", id))?
            .status();
        if !current.can_transition_to(next.status()) {
            return Err(StorageError::invalid_state(
                "slot_lock",
                id,
                current.as_str(),
                &format!("a state that can become {}", next.status()),
            ));
        }
        let released = next.status() == LockStatus::Released;
        tables.locks.insert(id, next);
        if released {
            self.unindex(&tables, &[id]);
        }
        Ok(())
    }

    async fn active_locks_overlapping(&self, providers: &[ProviderId], window: TimeWindow) -> Result<Vec<AnySlotLock>> {
        let tables = self.tables.read();
        let mut active = Vec::new();
        for provider_id in providers {
            if let Some(ids) = self.provider_locks.get(provider_id) {
                active.extend(
                    ids.iter()
                        .filter_map(|id| tables.locks.get(id))
                        .filter(|lock| lock.blocks(&window))
                        .cloned(),
                );
            }
        }
        Ok(active)
    }

    async fn held_locks_expired_before(&self, now: DateTime<Utc>) -> Result<Vec<SlotLock<Held>>> {
        let tables = self.tables.read();
        let mut expired: Vec<SlotLock<Held>> = tables
            .locks
            .values()
            .filter_map(|lock| match lock {
                AnySlotLock::Held(held) if held.data.is_expired(now) => Some(held.clone()),
                _ => None,
            })
            .collect();
        expired.sort_by_key(|l| (l.data.expires_at, l.data.id));
        Ok(expired)
    }

    async fn locks_for_booking(&self, booking_id: BookingId) -> Result<Vec<AnySlotLock>> {
        let tables = self.tables.read();
        let mut locks: Vec<AnySlotLock> = tables
            .locks
            .values()
            .filter(|l| l.data().booking_id == booking_id)
            .cloned()
            .collect();
        locks.sort_by_key(|l| (l.data().created_at, l.id()));
        Ok(locks)
    }

    async fn assign_directly(
        &self,
        booking_id: BookingId,
        providers: &[ProviderId],
        now: DateTime<Utc>,
    ) -> Result<DirectAssignment> {
        let mut tables = self.tables.write();
        let booking = tables.booking(booking_id)?.clone();
        if !booking.is_matchable() {
            return Err(StorageError::invalid_state("booking", booking_id, booking.status.as_str(), "pending_provider"));
        }

        let assigned = tables.assignment_count(booking_id);
        if assigned + providers.len() > booking.required_providers as usize {
            return Err(StorageError::invalid_state(
                "booking",
                booking_id,
                &format!("staffed {assigned}/{}", booking.required_providers),
                &format!("room for {} more providers", providers.len()),
            ));
        }

        // Plan: reuse the provider's open invitation for this booking, or take a fresh lock
        enum Plan {
            Reuse { invitation_id: InvitationId, lock_id: LockId },
            Fresh,
        }
        let mut plans = Vec::with_capacity(providers.len());
        for (position, provider_id) in providers.iter().enumerate() {
            if providers[..position].contains(provider_id)
                || tables
                    .assignments
                    .iter()
                    .any(|a| a.booking_id == booking_id && a.provider_id == *provider_id)
            {
                return Err(StorageError::UniqueViolation {
                    constraint: Some("assignments_booking_id_provider_id_key".to_string()),
                    table: Some("assignments".to_string()),
                    message: format!("provider {provider_id} is already assigned to booking {booking_id}"),
                });
            }

            let open = tables.invitations.values().find(|i| {
                i.is_outstanding() && i.data().booking_id == booking_id && i.data().provider_id == *provider_id
            });
            let reusable = open.and_then(|i| match tables.locks.get(&i.data().lock_id) {
                Some(AnySlotLock::Held(_)) => Some(Plan::Reuse {
                    invitation_id: i.id(),
                    lock_id: i.data().lock_id,
                }),
                _ => None,
            });
            match reusable {
                Some(plan) => plans.push((*provider_id, plan)),
                None => {
                    if let Some(conflicting) =
                        tables.first_blocking_lock(&self.provider_locks, *provider_id, &booking.window)
                    {
                        return Err(StorageError::ExclusionViolation {
                            constraint: Some("slot_locks_no_overlap".to_string()),
                            message: format!("provider {provider_id} is blocked by slot lock {conflicting}"),
                        });
                    }
                    plans.push((*provider_id, Plan::Fresh));
                }
            }
        }

        // Commit
        let mut assignments = Vec::with_capacity(plans.len());
        for (provider_id, plan) in plans {
            let lock_id = match plan {
                Plan::Reuse { invitation_id, lock_id } => {
                    if let Some(AnySlotLock::Held(held)) = tables.locks.remove(&lock_id) {
                        let confirmed = SlotLock {
                            state: Confirmed { confirmed_at: now },
                            data: held.data,
                        };
                        tables.locks.insert(lock_id, confirmed.into());
                    }
                    if let Some(open) = tables.invitations.remove(&invitation_id) {
                        let viewed_at = open.viewed_at();
                        let accepted = Invitation {
                            state: Accepted {
                                viewed_at,
                                responded_at: now,
                            },
                            data: open.data().clone(),
                        };
                        tables.invitations.insert(invitation_id, accepted.into());
                    }
                    lock_id
                }
                Plan::Fresh => {
                    let lock = SlotLock {
                        state: Confirmed { confirmed_at: now },
                        data: SlotLockData {
                            id: LockId::new(),
                            booking_id,
                            provider_id,
                            window: booking.window,
                            created_at: now,
                            expires_at: now,
                        },
                    };
                    let lock_id = lock.data.id;
                    tables.locks.insert(lock_id, lock.into());
                    self.provider_locks.entry(provider_id).or_default().push(lock_id);
                    lock_id
                }
            };

            let assignment = Assignment {
                id: AssignmentId::new(),
                booking_id,
                provider_id,
                lock_id,
                source: AssignmentSource::Operator,
                created_at: now,
            };
            tables.assignments.push(assignment.clone());
            assignments.push(assignment);
        }

        let fully_staffed = assigned + assignments.len() >= booking.required_providers as usize;
        let cleanup = if fully_staffed {
            tables.transition_booking(
                booking_id,
                &[BookingStatus::PendingProvider],
                StatusUpdate::new(BookingStatus::Confirmed, StatusActor::Operator),
                now,
            )?;
            tables.cleanup_siblings(booking_id, now)?
        } else {
            SiblingCleanup::default()
        };
        self.unindex(&tables, &cleanup.released);

        Ok(DirectAssignment {
            assignments,
            fully_staffed,
            cleanup,
        })
    }

    async fn list_assignments(&self, booking_id: BookingId) -> Result<Vec<Assignment>> {
        let tables = self.tables.read();
        Ok(tables
            .assignments
            .iter()
            .filter(|a| a.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn insert_fallback_candidate(&self, candidate: &FallbackTeamCandidate) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.bookings.contains_key(&candidate.booking_id) {
            return Err(StorageError::ForeignKeyViolation {
                constraint: Some("fallback_team_candidates_booking_id_fkey".to_string()),
                table: Some("fallback_team_candidates".to_string()),
                message: format!("booking {} does not exist", candidate.booking_id),
            });
        }
        tables.fallback_candidates.push(candidate.clone());
        Ok(())
    }

    async fn list_fallback_candidates(&self, booking_id: BookingId) -> Result<Vec<FallbackTeamCandidate>> {
        let tables = self.tables.read();
        Ok(tables
            .fallback_candidates
            .iter()
            .filter(|c| c.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn status_changes_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<BookingStatusChange>> {
        let tables = self.tables.read();
        Ok(tables
            .status_changes
            .iter()
            .filter(|c| from <= c.changed_at && c.changed_at < to)
            .cloned()
            .collect())
    }

    async fn bookings_created_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<BookingRequest>> {
        let tables = self.tables.read();
        Ok(tables
            .bookings
            .values()
            .filter(|b| from <= b.created_at && b.created_at < to)
            .cloned()
            .collect())
    }

    async fn current_matching_config(&self) -> Result<VersionedMatchingConfig> {
        self.matching_config
            .load_full()
            .map(|config| (*config).clone())
            .ok_or_else(|| StorageError::not_found("matching_config", "latest"))
    }

    async fn replace_matching_config(&self, config: &MatchingConfig, now: DateTime<Utc>) -> Result<VersionedMatchingConfig> {
        let next = |current: &Option<Arc<VersionedMatchingConfig>>| VersionedMatchingConfig {
            version: current.as_ref().map_or(1, |c| c.version + 1),
            config: config.clone(),
            created_at: now,
        };
        let previous = self.matching_config.rcu(|current| Some(Arc::new(next(current))));
        Ok(next(&previous))
    }

    async fn ensure_matching_config(&self, config: &MatchingConfig, now: DateTime<Utc>) -> Result<VersionedMatchingConfig> {
        let initial = VersionedMatchingConfig {
            version: 1,
            config: config.clone(),
            created_at: now,
        };
        let previous = self.matching_config.rcu(|current| match current {
            Some(existing) => Some(Arc::clone(existing)),
            None => Some(Arc::new(initial.clone())),
        });
        Ok(previous.map(|existing| (*existing).clone()).unwrap_or(initial))
    }
}
