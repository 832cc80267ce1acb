//! Slot lock lifecycle types.
//!
//! A slot lock reserves a provider's time window while an invitation or assignment is
//! outstanding. For one provider, no two HELD/CONFIRMED locks may overlap.
//!
//! ```text
//! held ──> confirmed ──> released
//!   └────────────────────> released
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};
use crate::types::{BookingId, LockId, ProviderId, TimeWindow};

/// Marker trait for valid lock states.
pub trait LockState: Send + Sync {}

#[derive(Debug, Clone)]
pub struct SlotLock<T: LockState> {
    pub state: T,
    pub data: SlotLockData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotLockData {
    pub id: LockId,
    pub booking_id: BookingId,
    pub provider_id: ProviderId,
    pub window: TimeWindow,
    pub created_at: DateTime<Utc>,
    /// Only meaningful while HELD; confirmed locks never expire
    pub expires_at: DateTime<Utc>,
}

impl SlotLockData {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Reserved while an invitation is outstanding.
#[derive(Debug, Clone)]
pub struct Held {}

impl LockState for Held {}

/// Backing an assignment.
#[derive(Debug, Clone)]
pub struct Confirmed {
    pub confirmed_at: DateTime<Utc>,
}

impl LockState for Confirmed {}

#[derive(Debug, Clone)]
pub struct Released {
    pub confirmed_at: Option<DateTime<Utc>>,
    pub released_at: DateTime<Utc>,
    pub reason: ReleaseReason,
}

impl LockState for Released {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    InvitationDeclined,
    InvitationExpired,
    /// A sibling invitation filled the booking
    Superseded,
    /// Swept after its TTL elapsed
    LockExpired,
    BookingCancelled,
    BookingCompleted,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseReason::InvitationDeclined => "invitation_declined",
            ReleaseReason::InvitationExpired => "invitation_expired",
            ReleaseReason::Superseded => "superseded",
            ReleaseReason::LockExpired => "lock_expired",
            ReleaseReason::BookingCancelled => "booking_cancelled",
            ReleaseReason::BookingCompleted => "booking_completed",
        }
    }
}

impl FromStr for ReleaseReason {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "invitation_declined" => Ok(ReleaseReason::InvitationDeclined),
            "invitation_expired" => Ok(ReleaseReason::InvitationExpired),
            "superseded" => Ok(ReleaseReason::Superseded),
            "lock_expired" => Ok(ReleaseReason::LockExpired),
            "booking_cancelled" => Ok(ReleaseReason::BookingCancelled),
            "booking_completed" => Ok(ReleaseReason::BookingCompleted),
            other => Err(Error::Validation {
                message: format!("unknown release reason '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Held,
    Confirmed,
    Released,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Held => "held",
            LockStatus::Confirmed => "confirmed",
            LockStatus::Released => "released",
        }
    }

    /// HELD and CONFIRMED locks block overlapping acquisitions.
    pub fn is_active(&self) -> bool {
        !matches!(self, LockStatus::Released)
    }

    pub fn can_transition_to(&self, next: LockStatus) -> bool {
        matches!(
            (self, next),
            (LockStatus::Held, LockStatus::Confirmed)
                | (LockStatus::Held, LockStatus::Released)
                | (LockStatus::Confirmed, LockStatus::Released)
        )
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "held" => Ok(LockStatus::Held),
            "confirmed" => Ok(LockStatus::Confirmed),
            "released" => Ok(LockStatus::Released),
            other => Err(Error::Validation {
                message: format!("unknown lock status '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum AnySlotLock {
    Held(SlotLock<Held>),
    Confirmed(SlotLock<Confirmed>),
    Released(SlotLock<Released>),
}

impl AnySlotLock {
    pub fn data(&self) -> &SlotLockData {
        match self {
            AnySlotLock::Held(l) => &l.data,
            AnySlotLock::Confirmed(l) => &l.data,
            AnySlotLock::Released(l) => &l.data,
        }
    }

    pub fn id(&self) -> LockId {
        self.data().id
    }

    pub fn status(&self) -> LockStatus {
        match self {
            AnySlotLock::Held(_) => LockStatus::Held,
            AnySlotLock::Confirmed(_) => LockStatus::Confirmed,
            AnySlotLock::Released(_) => LockStatus::Released,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Whether this lock blocks `window` for its provider.
    pub fn blocks(&self, window: &TimeWindow) -> bool {
        self.is_active() && self.data().window.overlaps(window)
    }

    pub fn confirmed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AnySlotLock::Held(_) => None,
            AnySlotLock::Confirmed(l) => Some(l.state.confirmed_at),
            AnySlotLock::Released(l) => l.state.confirmed_at,
        }
    }

    pub fn into_held(self) -> Option<SlotLock<Held>> {
        match self {
            AnySlotLock::Held(l) => Some(l),
            _ => None,
        }
    }
}

impl From<SlotLock<Held>> for AnySlotLock {
    fn from(l: SlotLock<Held>) -> Self {
        AnySlotLock::Held(l)
    }
}

impl From<SlotLock<Confirmed>> for AnySlotLock {
    fn from(l: SlotLock<Confirmed>) -> Self {
        AnySlotLock::Confirmed(l)
    }
}

impl From<SlotLock<Released>> for AnySlotLock {
    fn from(l: SlotLock<Released>) -> Self {
        AnySlotLock::Released(l)
    }
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone)]
pub enum LockAcquisition {
    Acquired(SlotLock<Held>),
    /// The provider already holds an overlapping HELD/CONFIRMED lock
    Conflict { conflicting: LockId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lock(start_hour: i64, end_hour: i64) -> SlotLockData {
        let base = Utc::now();
        SlotLockData {
            id: LockId::new(),
            booking_id: BookingId::new(),
            provider_id: ProviderId::new(),
            window: TimeWindow::new(base + Duration::hours(start_hour), base + Duration::hours(end_hour)).unwrap(),
            created_at: base,
            expires_at: base + Duration::minutes(15),
        }
    }

    #[test]
    fn test_released_lock_blocks_nothing() {
        let data = lock(1, 3);
        let window = data.window;
        let held = AnySlotLock::from(SlotLock { state: Held {}, data: data.clone() });
        assert!(held.blocks(&window));

        let released = AnySlotLock::from(SlotLock {
            state: Released {
                confirmed_at: None,
                released_at: Utc::now(),
                reason: ReleaseReason::InvitationDeclined,
            },
            data,
        });
        assert!(!released.blocks(&window));
    }

    #[test]
    fn test_lock_transition_table() {
        assert!(LockStatus::Held.can_transition_to(LockStatus::Confirmed));
        assert!(LockStatus::Confirmed.can_transition_to(LockStatus::Released));
        assert!(!LockStatus::Released.can_transition_to(LockStatus::Held));
        assert!(!LockStatus::Released.can_transition_to(LockStatus::Released));
        assert!(!LockStatus::Confirmed.can_transition_to(LockStatus::Held));
    }
}
