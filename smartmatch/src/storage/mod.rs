//! Persistence for bookings, invitations, slot locks and everything attached to them.
//!
//! The [`Storage`] trait is the only place engine state lives. Two backends ship with the crate:
//! [`in_memory::InMemoryStorage`] and, behind the `postgres` feature, `postgres::PostgresStorage`.
//!
//! Implementations are responsible for the atomic operations the engine relies on:
//! - [`Storage::try_acquire_lock`] is a check-and-create per provider
//! - [`Storage::accept_invitation`] confirms the lock, creates the assignment and cleans up
//!   siblings as one unit
//! - [`Storage::close_booking`] releases everything attached to a booking as one unit
//! - `persist_*` refuse to overwrite a record whose stored state no longer allows the transition,
//!   returning [`StorageError::InvalidState`]

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::booking::{Assignment, BookingRequest, BookingStatus, BookingStatusChange, FallbackTeamCandidate, StatusActor};
use crate::invitation::{Accepted, AnyInvitation, Invitation, InvitationState, Pending};
use crate::matching_config::{MatchingConfig, VersionedMatchingConfig};
use crate::slot_lock::{AnySlotLock, Confirmed, Held, LockAcquisition, LockState, SlotLock};
use crate::types::{BookingId, InvitationId, LockId, ProviderId, TimeWindow};

pub mod errors;
pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;


pub use errors::{Result, StorageError};

/// A booking status change requested by some actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub to: BookingStatus,
    pub actor: StatusActor,
    /// Provider the change is attributed to (provider cancellations, acceptances)
    pub provider_id: Option<ProviderId>,
}

impl StatusUpdate {
    pub fn new(to: BookingStatus, actor: StatusActor) -> Self {
        Self {
            to,
            actor,
            provider_id: None,
        }
    }

    pub fn by_provider(to: BookingStatus, provider_id: ProviderId) -> Self {
        Self {
            to,
            actor: StatusActor::Provider,
            provider_id: Some(provider_id),
        }
    }
}

/// Invitations declined and locks released because a booking no longer needs them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiblingCleanup {
    pub declined: Vec<InvitationId>,
    pub released: Vec<LockId>,
}

impl SiblingCleanup {
    pub fn is_empty(&self) -> bool {
        self.declined.is_empty() && self.released.is_empty()
    }
}

/// Everything [`Storage::accept_invitation`] changed.
#[derive(Debug, Clone)]
pub struct AcceptCommit {
    pub assignment: Assignment,
    pub lock: SlotLock<Confirmed>,
    /// The booking reached `required_providers` assignments and moved to confirmed
    pub fully_staffed: bool,
    pub cleanup: SiblingCleanup,
}

/// Everything [`Storage::assign_directly`] changed.
#[derive(Debug, Clone)]
pub struct DirectAssignment {
    pub assignments: Vec<Assignment>,
    pub fully_staffed: bool,
    pub cleanup: SiblingCleanup,
}

/// Everything [`Storage::close_booking`] changed.
#[derive(Debug, Clone)]
pub struct ClosedBooking {
    pub booking: BookingRequest,
    pub previous_status: BookingStatus,
    pub cleanup: SiblingCleanup,
}

/// Storage trait for engine state.
///
/// The typestate transitions in [`crate::invitation`] and [`crate::slot_lock`] decide which
/// moves are legal; implementations re-check the stored state so that concurrent writers (an
/// acceptance racing the expiry sweep, say) cannot both win.
#[async_trait]
pub trait Storage: Send + Sync {
    // Bookings

    async fn insert_booking(&self, booking: &BookingRequest) -> Result<()>;

    async fn get_booking(&self, id: BookingId) -> Result<BookingRequest>;

    /// Move a booking to `update.to` if it is currently in one of `expected`, recording the change.
    async fn set_booking_status(
        &self,
        id: BookingId,
        expected: &[BookingStatus],
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<BookingRequest>;

    /// Count matching round `round` as exhausted: raise `matching_retry_count` from `round` to
    /// `round + 1`, returning the updated booking.
    ///
    /// Only applies while the count still equals `round` and the booking is waiting for
    /// providers, has no fallback request, no outstanding invitations and is not fully staffed.
    /// Returns `None` otherwise, e.g. when a concurrent caller already counted this round.
    async fn record_exhaustion(&self, id: BookingId, round: u32, now: DateTime<Utc>) -> Result<Option<BookingRequest>>;

    /// Set `fallback_requested_at` unless already set; `short_notice` is only ever raised.
    async fn request_fallback(&self, id: BookingId, short_notice: bool, now: DateTime<Utc>) -> Result<BookingRequest>;

    /// Set `fallback_escalated_at` unless already set. Returns whether this call set it.
    async fn mark_fallback_escalated(&self, id: BookingId, now: DateTime<Utc>) -> Result<bool>;

    /// Unstaffed bookings without a fallback request that start at or before `starts_before`.
    async fn bookings_needing_fallback(&self, starts_before: DateTime<Utc>) -> Result<Vec<BookingRequest>>;

    /// Unstaffed bookings with a fallback request but no escalation that start at or before
    /// `starts_before`.
    async fn bookings_pending_escalation(&self, starts_before: DateTime<Utc>) -> Result<Vec<BookingRequest>>;

    /// Unstaffed bookings with a fallback request: escalated first (oldest escalation first),
    /// then by `fallback_requested_at`, then by id.
    async fn fallback_queue(&self) -> Result<Vec<BookingRequest>>;

    /// Cancel or complete a booking, declining its outstanding invitations and releasing its
    /// active locks in the same unit.
    async fn close_booking(&self, id: BookingId, update: StatusUpdate, now: DateTime<Utc>) -> Result<ClosedBooking>;

    // Invitations

    /// Store a new pending invitation.
    ///
    /// # Errors
    /// - `UniqueViolation` if the provider already has an outstanding invitation for the booking
    async fn create_invitation(&self, invitation: &Invitation<Pending>) -> Result<()>;

    async fn get_invitation(&self, id: InvitationId) -> Result<AnyInvitation>;

    async fn list_invitations(&self, booking_id: BookingId) -> Result<Vec<AnyInvitation>>;

    /// Update an invitation's state.
    ///
    /// # Errors
    /// - `InvalidState` if the stored invitation cannot move to the new state (already answered)
    async fn persist_invitation<T: InvitationState + Clone>(&self, invitation: &Invitation<T>) -> Result<()>
    where
        AnyInvitation: From<Invitation<T>>;

    /// Pending or viewed invitations whose `expires_at` is at or before `now`.
    async fn outstanding_invitations_expired_before(&self, now: DateTime<Utc>) -> Result<Vec<AnyInvitation>>;

    /// Accepted or declined invitations answered within `[from, to)`.
    async fn invitations_responded_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AnyInvitation>>;

    /// Accept an invitation: confirm its lock, create the assignment and, when the booking is now
    /// fully staffed, decline the remaining outstanding invitations, release their locks and move
    /// the booking to confirmed. All or nothing.
    ///
    /// # Errors
    /// - `InvalidState` if the invitation is no longer outstanding, its lock is not an unexpired
    ///   HELD lock, or the booking is not waiting for providers
    async fn accept_invitation(&self, invitation: &Invitation<Accepted>, now: DateTime<Utc>) -> Result<AcceptCommit>;

    /// Decline outstanding invitations of a fully staffed booking and release their locks.
    /// A no-op for bookings still waiting for providers; safe to re-run.
    async fn cleanup_siblings(&self, booking_id: BookingId, now: DateTime<Utc>) -> Result<SiblingCleanup>;

    // Slot locks

    /// Store `lock` unless the provider already holds an overlapping HELD/CONFIRMED lock.
    async fn try_acquire_lock(&self, lock: SlotLock<Held>) -> Result<LockAcquisition>;

    async fn get_lock(&self, id: LockId) -> Result<AnySlotLock>;

    /// Update a lock's state.
    ///
    /// # Errors
    /// - `InvalidState` if the stored lock cannot move to the new state
    async fn persist_lock<T: LockState + Clone>(&self, lock: &SlotLock<T>) -> Result<()>
    where
        AnySlotLock: From<SlotLock<T>>;

    /// HELD/CONFIRMED locks of any of `providers` overlapping `window`.
    async fn active_locks_overlapping(&self, providers: &[ProviderId], window: TimeWindow) -> Result<Vec<AnySlotLock>>;

    /// HELD locks whose `expires_at` is at or before `now`.
    async fn held_locks_expired_before(&self, now: DateTime<Utc>) -> Result<Vec<SlotLock<Held>>>;

    async fn locks_for_booking(&self, booking_id: BookingId) -> Result<Vec<AnySlotLock>>;

    // Assignments

    /// Operator assignment of one or more providers, bypassing invitations. Providers holding an
    /// outstanding invitation for the booking have it accepted; everyone else gets a fresh
    /// CONFIRMED lock. All or nothing.
    ///
    /// # Errors
    /// - `ExclusionViolation` if a provider is booked elsewhere in the window
    /// - `UniqueViolation` if a provider is already assigned to the booking
    /// - `InvalidState` if the booking is not waiting for providers or would be over-staffed
    async fn assign_directly(
        &self,
        booking_id: BookingId,
        providers: &[ProviderId],
        now: DateTime<Utc>,
    ) -> Result<DirectAssignment>;

    async fn list_assignments(&self, booking_id: BookingId) -> Result<Vec<Assignment>>;

    // Fallback team candidates

    async fn insert_fallback_candidate(&self, candidate: &FallbackTeamCandidate) -> Result<()>;

    async fn list_fallback_candidates(&self, booking_id: BookingId) -> Result<Vec<FallbackTeamCandidate>>;

    // History for guardrails

    async fn status_changes_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<BookingStatusChange>>;

    async fn bookings_created_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<BookingRequest>>;

    // Matching config

    /// The latest matching config.
    ///
    /// # Errors
    /// - `NotFound` if no config was ever stored
    async fn current_matching_config(&self) -> Result<VersionedMatchingConfig>;

    /// Store `config` as a new version.
    async fn replace_matching_config(&self, config: &MatchingConfig, now: DateTime<Utc>) -> Result<VersionedMatchingConfig>;

    /// Store `config` as version 1 if nothing is stored yet; otherwise return the current version.
    async fn ensure_matching_config(&self, config: &MatchingConfig, now: DateTime<Utc>) -> Result<VersionedMatchingConfig>;
}

/// Sort bookings into operator fallback queue order.
pub(crate) fn sort_fallback_queue(bookings: &mut [BookingRequest]) {
    bookings.sort_by(|a, b| {
        // Escalated (Some) before not escalated (None), oldest escalation first
        let escalated = match (a.fallback_escalated_at, b.fallback_escalated_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        escalated
            .then(a.fallback_requested_at.cmp(&b.fallback_requested_at))
            .then(a.id.cmp(&b.id))
    });
}
