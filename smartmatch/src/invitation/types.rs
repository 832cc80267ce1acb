//! Invitation lifecycle types.
//!
//! Invitations use the typestate pattern: an `Invitation<Pending>` can be viewed, accepted,
//! declined or expired; an `Invitation<Accepted>` can do nothing at all. The legal transitions
//! live in [`super::transitions`].
//!
//! ```text
//! pending ──> viewed ──> accepted | declined | expired
//!    └──────────────────> accepted | declined | expired
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};
use crate::types::{BookingId, InvitationId, LockId, ProviderId};

/// Marker trait for valid invitation states.
pub trait InvitationState: Send + Sync {}

/// States from which a provider can still answer.
pub trait Outstanding: InvitationState {
    fn viewed_at(&self) -> Option<DateTime<Utc>>;
}

/// An invitation offered to one provider for one booking.
#[derive(Debug, Clone)]
pub struct Invitation<T: InvitationState> {
    pub state: T,
    pub data: InvitationData,
}

/// State-independent invitation data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvitationData {
    pub id: InvitationId,
    pub booking_id: BookingId,
    pub provider_id: ProviderId,
    /// The HELD slot lock backing this invitation. Every invitation has one.
    pub lock_id: LockId,
    /// Matching round (the booking's retry count when it was issued)
    pub round: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Score breakdown and other context, for auditing
    pub metadata: serde_json::Value,
}

// ============================================================================
// Invitation States
// ============================================================================

/// Waiting for the provider to open it.
#[derive(Debug, Clone)]
pub struct Pending {}

impl InvitationState for Pending {}

impl Outstanding for Pending {
    fn viewed_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Opened but not answered.
#[derive(Debug, Clone)]
pub struct Viewed {
    pub viewed_at: DateTime<Utc>,
}

impl InvitationState for Viewed {}

impl Outstanding for Viewed {
    fn viewed_at(&self) -> Option<DateTime<Utc>> {
        Some(self.viewed_at)
    }
}

#[derive(Debug, Clone)]
pub struct Accepted {
    pub viewed_at: Option<DateTime<Utc>>,
    pub responded_at: DateTime<Utc>,
}

impl InvitationState for Accepted {}

#[derive(Debug, Clone)]
pub struct Declined {
    pub viewed_at: Option<DateTime<Utc>>,
    pub responded_at: DateTime<Utc>,
    pub reason: DeclineReason,
}

impl InvitationState for Declined {}

/// The response window elapsed without an answer.
#[derive(Debug, Clone)]
pub struct Expired {
    pub viewed_at: Option<DateTime<Utc>>,
    pub expired_at: DateTime<Utc>,
}

impl InvitationState for Expired {}

/// Why an invitation ended up declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// The provider said no
    ProviderDeclined,
    /// Another provider accepted a single-provider booking first
    Superseded,
    /// A team mission reached its required provider count
    NoLongerNeeded,
    BookingCancelled,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::ProviderDeclined => "provider_declined",
            DeclineReason::Superseded => "superseded",
            DeclineReason::NoLongerNeeded => "no_longer_needed",
            DeclineReason::BookingCancelled => "booking_cancelled",
        }
    }

    /// Reason given to the remaining invitees once a booking is fully staffed.
    pub fn for_sibling(required_providers: u32) -> Self {
        if required_providers > 1 {
            DeclineReason::NoLongerNeeded
        } else {
            DeclineReason::Superseded
        }
    }
}

impl FromStr for DeclineReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "provider_declined" => Ok(DeclineReason::ProviderDeclined),
            "superseded" => Ok(DeclineReason::Superseded),
            "no_longer_needed" => Ok(DeclineReason::NoLongerNeeded),
            "booking_cancelled" => Ok(DeclineReason::BookingCancelled),
            other => Err(Error::Validation {
                message: format!("unknown decline reason '{other}'"),
            }),
        }
    }
}

/// Flat status, as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Viewed,
    Accepted,
    Declined,
    Expired,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Viewed => "viewed",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Declined => "declined",
            InvitationStatus::Expired => "expired",
        }
    }

    pub fn is_outstanding(&self) -> bool {
        matches!(self, InvitationStatus::Pending | InvitationStatus::Viewed)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_outstanding()
    }

    /// Whether a stored invitation in `self` may be overwritten with `next`.
    pub fn can_transition_to(&self, next: InvitationStatus) -> bool {
        match (self, next) {
            (InvitationStatus::Pending, InvitationStatus::Viewed) => true,
            (current, next) => current.is_outstanding() && next.is_terminal(),
        }
    }
}

impl fmt::Display for InvitationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvitationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(InvitationStatus::Pending),
            "viewed" => Ok(InvitationStatus::Viewed),
            "accepted" => Ok(InvitationStatus::Accepted),
            "declined" => Ok(InvitationStatus::Declined),
            "expired" => Ok(InvitationStatus::Expired),
            other => Err(Error::Validation {
                message: format!("unknown invitation status '{other}'"),
            }),
        }
    }
}

// ============================================================================
// Unified Invitation Representation
// ============================================================================

/// An invitation in any state, for storage and listings.
#[derive(Debug, Clone)]
pub enum AnyInvitation {
    Pending(Invitation<Pending>),
    Viewed(Invitation<Viewed>),
    Accepted(Invitation<Accepted>),
    Declined(Invitation<Declined>),
    Expired(Invitation<Expired>),
}

impl AnyInvitation {
    pub fn data(&self) -> &InvitationData {
        match self {
            AnyInvitation::Pending(i) => &i.data,
            AnyInvitation::Viewed(i) => &i.data,
            AnyInvitation::Accepted(i) => &i.data,
            AnyInvitation::Declined(i) => &i.data,
            AnyInvitation::Expired(i) => &i.data,
        }
    }

    pub fn id(&self) -> InvitationId {
        self.data().id
    }

    pub fn status(&self) -> InvitationStatus {
        match self {
            AnyInvitation::Pending(_) => InvitationStatus::Pending,
            AnyInvitation::Viewed(_) => InvitationStatus::Viewed,
            AnyInvitation::Accepted(_) => InvitationStatus::Accepted,
            AnyInvitation::Declined(_) => InvitationStatus::Declined,
            AnyInvitation::Expired(_) => InvitationStatus::Expired,
        }
    }

    pub fn is_outstanding(&self) -> bool {
        self.status().is_outstanding()
    }

    pub fn viewed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnyInvitation::Pending(_) => None,
            AnyInvitation::Viewed(i) => Some(i.state.viewed_at),
            AnyInvitation::Accepted(i) => i.state.viewed_at,
            AnyInvitation::Declined(i) => i.state.viewed_at,
            AnyInvitation::Expired(i) => i.state.viewed_at,
        }
    }

    /// When the provider answered. Expiry is not an answer.
    pub fn responded_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnyInvitation::Accepted(i) => Some(i.state.responded_at),
            AnyInvitation::Declined(i) => Some(i.state.responded_at),
            _ => None,
        }
    }

    pub fn decline_reason(&self) -> Option<DeclineReason> {
        match self {
            AnyInvitation::Declined(i) => Some(i.state.reason),
            _ => None,
        }
    }

    /// Declined by the provider themselves, as opposed to by the engine.
    pub fn is_provider_decline(&self) -> bool {
        self.decline_reason() == Some(DeclineReason::ProviderDeclined)
    }
}

impl From<Invitation<Pending>> for AnyInvitation {
    fn from(i: Invitation<Pending>) -> Self {
        AnyInvitation::Pending(i)
    }
}

impl From<Invitation<Viewed>> for AnyInvitation {
    fn from(i: Invitation<Viewed>) -> Self {
        AnyInvitation::Viewed(i)
    }
}

impl From<Invitation<Accepted>> for AnyInvitation {
    fn from(i: Invitation<Accepted>) -> Self {
        AnyInvitation::Accepted(i)
    }
}

impl From<Invitation<Declined>> for AnyInvitation {
    fn from(i: Invitation<Declined>) -> Self {
        AnyInvitation::Declined(i)
    }
}

impl From<Invitation<Expired>> for AnyInvitation {
    fn from(i: Invitation<Expired>) -> Self {
        AnyInvitation::Expired(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use InvitationStatus::*;
        assert!(Pending.can_transition_to(Viewed));
        assert!(Pending.can_transition_to(Accepted));
        assert!(Viewed.can_transition_to(Declined));
        assert!(Viewed.can_transition_to(Expired));
        assert!(!Viewed.can_transition_to(Pending));
        assert!(!Viewed.can_transition_to(Viewed));
        assert!(!Accepted.can_transition_to(Declined));
        assert!(!Expired.can_transition_to(Accepted));
        assert!(!Declined.can_transition_to(Expired));
    }

    #[test]
    fn test_sibling_decline_reason() {
        assert_eq!(DeclineReason::for_sibling(1), DeclineReason::Superseded);
        assert_eq!(DeclineReason::for_sibling(3), DeclineReason::NoLongerNeeded);
    }
}
