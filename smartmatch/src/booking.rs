//! Booking aggregate and the records the engine attaches to it.
//!
//! The booking itself is owned by the surrounding application; the engine only moves it through
//! the matching-related transitions (retry counter, fallback timestamps, staffing status) and
//! records [`Assignment`]s, [`FallbackTeamCandidate`]s and [`BookingStatusChange`]s against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};
use crate::types::{AssignmentId, BookingId, ClientId, FallbackCandidateId, LockId, ProviderId, TeamId, TimeWindow};

/// Booking lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Draft,
    PendingProvider,
    PendingClient,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    Disputed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Draft => "draft",
            BookingStatus::PendingProvider => "pending_provider",
            BookingStatus::PendingClient => "pending_client",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Disputed => "disputed",
        }
    }

    /// Statuses from which a cancellation counts as a post-confirmation cancellation.
    pub fn is_confirmed_or_later(&self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::InProgress)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// For a closing status (`cancelled`, `completed`), the statuses a booking may be closed from.
    pub fn closing_sources(&self) -> Option<&'static [BookingStatus]> {
        match self {
            BookingStatus::Cancelled => Some(&[
                BookingStatus::Draft,
                BookingStatus::PendingProvider,
                BookingStatus::PendingClient,
                BookingStatus::Confirmed,
                BookingStatus::InProgress,
                BookingStatus::Disputed,
            ]),
            BookingStatus::Completed => Some(&[BookingStatus::Confirmed, BookingStatus::InProgress]),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "draft" => BookingStatus::Draft,
            "pending_provider" => BookingStatus::PendingProvider,
            "pending_client" => BookingStatus::PendingClient,
            "confirmed" => BookingStatus::Confirmed,
            "in_progress" => BookingStatus::InProgress,
            "completed" => BookingStatus::Completed,
            "cancelled" => BookingStatus::Cancelled,
            "disputed" => BookingStatus::Disputed,
            other => {
                return Err(Error::Validation {
                    message: format!("unknown booking status '{other}'"),
                });
            }
        })
    }
}

/// Where the service takes place. Geocoding is external; the engine only compares these
/// strings against provider service areas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub city: String,
    pub postal_code: String,
    #[serde(default)]
    pub district: Option<String>,
}

/// A client's request for service at a place and time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: BookingId,
    pub client_id: ClientId,
    pub service_category: String,
    pub eco_preference: bool,
    pub required_providers: u32,
    pub address: Address,
    pub window: TimeWindow,
    pub status: BookingStatus,
    pub matching_retry_count: u32,
    pub short_notice: bool,
    pub fallback_requested_at: Option<DateTime<Utc>>,
    pub fallback_escalated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for registering a booking with the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBooking {
    pub client_id: ClientId,
    pub service_category: String,
    #[serde(default)]
    pub eco_preference: bool,
    pub required_providers: u32,
    pub address: Address,
    pub window: TimeWindow,
    /// Either `draft` or `pending_provider`
    pub status: BookingStatus,
}

impl BookingRequest {
    /// Validate a new booking and build its initial record.
    pub fn create(new: NewBooking, now: DateTime<Utc>) -> Result<Self> {
        if new.service_category.trim().is_empty() {
            return Err(Error::Validation {
                message: "service category must not be empty".to_string(),
            });
        }
        if new.required_providers == 0 {
            return Err(Error::Validation {
                message: "a booking requires at least one provider".to_string(),
            });
        }
        if new.address.postal_code.trim().is_empty() || new.address.city.trim().is_empty() {
            return Err(Error::Validation {
                message: "booking address needs a city and postal code".to_string(),
            });
        }
        if !matches!(new.status, BookingStatus::Draft | BookingStatus::PendingProvider) {
            return Err(Error::Validation {
                message: format!("bookings can only be registered as draft or pending_provider, got {}", new.status),
            });
        }
        // Re-validate: TimeWindow fields are public and may have been built without `new`
        let window = TimeWindow::new(new.window.start, new.window.end)?;

        Ok(Self {
            id: BookingId::new(),
            client_id: new.client_id,
            service_category: new.service_category,
            eco_preference: new.eco_preference,
            required_providers: new.required_providers,
            address: new.address,
            window,
            status: new.status,
            matching_retry_count: 0,
            short_notice: false,
            fallback_requested_at: None,
            fallback_escalated_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_team_mission(&self) -> bool {
        self.required_providers > 1
    }

    /// Only bookings waiting for a provider take part in Smart Match.
    pub fn is_matchable(&self) -> bool {
        self.status == BookingStatus::PendingProvider
    }
}

/// How an assignment came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentSource {
    Invitation,
    Operator,
}

impl AssignmentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentSource::Invitation => "invitation",
            AssignmentSource::Operator => "operator",
        }
    }
}

impl FromStr for AssignmentSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "invitation" => Ok(AssignmentSource::Invitation),
            "operator" => Ok(AssignmentSource::Operator),
            other => Err(Error::Validation {
                message: format!("unknown assignment source '{other}'"),
            }),
        }
    }
}

/// The durable link between a booking and a provider who will perform it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: AssignmentId,
    pub booking_id: BookingId,
    pub provider_id: ProviderId,
    pub lock_id: LockId,
    pub source: AssignmentSource,
    pub created_at: DateTime<Utc>,
}

/// A pre-composed team proposed by the escalation policy once individual matching stalls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackTeamCandidate {
    pub id: FallbackCandidateId,
    pub booking_id: BookingId,
    pub team_id: TeamId,
    pub name: String,
    pub preferred_size: u32,
    pub members: Vec<ProviderId>,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// Who moved a booking from one status to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusActor {
    Client,
    Provider,
    Operator,
    System,
}

impl StatusActor {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusActor::Client => "client",
            StatusActor::Provider => "provider",
            StatusActor::Operator => "operator",
            StatusActor::System => "system",
        }
    }
}

impl FromStr for StatusActor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client" => Ok(StatusActor::Client),
            "provider" => Ok(StatusActor::Provider),
            "operator" => Ok(StatusActor::Operator),
            "system" => Ok(StatusActor::System),
            other => Err(Error::Validation {
                message: format!("unknown status actor '{other}'"),
            }),
        }
    }
}

/// One entry of the booking status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingStatusChange {
    pub booking_id: BookingId,
    pub client_id: ClientId,
    /// Provider the change is attributed to, when `actor` is a provider
    pub provider_id: Option<ProviderId>,
    pub from: BookingStatus,
    pub to: BookingStatus,
    pub actor: StatusActor,
    pub changed_at: DateTime<Utc>,
}

impl BookingStatusChange {
    pub fn is_post_confirmation_cancellation(&self) -> bool {
        self.to == BookingStatus::Cancelled && self.from.is_confirmed_or_later()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_booking() -> NewBooking {
        let start = Utc::now() + Duration::days(3);
        NewBooking {
            client_id: ClientId::new(),
            service_category: "deep_cleaning".to_string(),
            eco_preference: false,
            required_providers: 1,
            address: Address {
                city: "Brussels".to_string(),
                postal_code: "1000".to_string(),
                district: None,
            },
            window: TimeWindow::new(start, start + Duration::hours(3)).unwrap(),
            status: BookingStatus::PendingProvider,
        }
    }

    #[test]
    fn test_create_booking_starts_with_clean_matching_state() {
        let booking = BookingRequest::create(new_booking(), Utc::now()).unwrap();
        assert_eq!(booking.matching_retry_count, 0);
        assert!(booking.fallback_requested_at.is_none());
        assert!(booking.is_matchable());
        assert!(!booking.is_team_mission());
    }

    #[test]
    fn test_create_booking_validation() {
        let mut zero_providers = new_booking();
        zero_providers.required_providers = 0;
        assert!(BookingRequest::create(zero_providers, Utc::now()).is_err());

        let mut blank_category = new_booking();
        blank_category.service_category = "  ".to_string();
        assert!(BookingRequest::create(blank_category, Utc::now()).is_err());

        let mut confirmed = new_booking();
        confirmed.status = BookingStatus::Confirmed;
        assert!(BookingRequest::create(confirmed, Utc::now()).is_err());

        let mut inverted = new_booking();
        std::mem::swap(&mut inverted.window.start, &mut inverted.window.end);
        assert!(BookingRequest::create(inverted, Utc::now()).is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            BookingStatus::Draft,
            BookingStatus::PendingProvider,
            BookingStatus::PendingClient,
            BookingStatus::Confirmed,
            BookingStatus::InProgress,
            BookingStatus::Completed,
            BookingStatus::Cancelled,
            BookingStatus::Disputed,
        ] {
            assert_eq!(status.as_str().parse::<BookingStatus>().unwrap(), status);
        }
        assert!("archived".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn test_post_confirmation_cancellation() {
        let change = |from| BookingStatusChange {
            booking_id: BookingId::new(),
            client_id: ClientId::new(),
            provider_id: None,
            from,
            to: BookingStatus::Cancelled,
            actor: StatusActor::Client,
            changed_at: Utc::now(),
        };
        assert!(change(BookingStatus::Confirmed).is_post_confirmation_cancellation());
        assert!(change(BookingStatus::InProgress).is_post_confirmation_cancellation());
        assert!(!change(BookingStatus::PendingProvider).is_post_confirmation_cancellation());
    }
}
