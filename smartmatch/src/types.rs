//! Common type definitions shared across the engine.
//!
//! This module defines:
//! - Identifier newtypes for every persisted entity (bookings, providers, invitations, ...)
//! - [`TimeWindow`], the half-open interval used by bookings and slot locks
//!
//! # ID Types
//!
//! All entity IDs are UUIDs wrapped in newtypes so a `ProviderId` can never be passed where a
//! `BookingId` is expected. They display as the first 8 hex characters for readable logs;
//! use [`Uuid`] formatting via `Deref` when the full value is needed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{Error, Result};

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl std::ops::Deref for $name {
            type Target = Uuid;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", abbrev_uuid(&self.0))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a client's booking request.
    BookingId
);
uuid_id!(
    /// Identifier of a provider (freelancer or company).
    ProviderId
);
uuid_id!(
    /// Identifier of the client who owns a booking.
    ClientId
);
uuid_id!(
    /// Identifier of a pre-composed provider team.
    TeamId
);
uuid_id!(
    /// Identifier of one invitation offered to one provider.
    InvitationId
);
uuid_id!(
    /// Identifier of a slot lock.
    LockId
);
uuid_id!(
    /// Identifier of a booking/provider assignment.
    AssignmentId
);
uuid_id!(
    /// Identifier of a fallback team proposal attached to a booking.
    FallbackCandidateId
);

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// A half-open time interval `[start, end)`.
///
/// Half-open so that back-to-back bookings (one ending at 12:00, the next starting at 12:00)
/// never count as overlapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Build a window, rejecting empty or inverted intervals.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(Error::Validation {
                message: format!("time window start ({start}) must be before end ({end})"),
            });
        }
        Ok(Self { start, end })
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Duration in fractional hours, used by price estimates.
    pub fn hours(&self) -> f64 {
        self.duration().num_seconds() as f64 / 3600.0
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}
