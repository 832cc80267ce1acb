//! PostgreSQL implementation of [`Storage`].
//!
//! The database enforces the invariants that matter under concurrency: the `slot_locks_no_overlap`
//! exclusion constraint keeps a provider from holding two overlapping active slots, and partial
//! unique indexes keep one outstanding invitation per provider and booking. Multi-record
//! operations run in a transaction that locks the booking row first, so acceptances, operator
//! assignments and cancellations of the same booking are serialised.
//!
//! # Example
//! ```ignore
//! let pool = PgPool::connect("postgresql://localhost/smartmatch").await?;
//! smartmatch::storage::postgres::migrator().run(&pool).await?;
//! let storage = Arc::new(PostgresStorage::new(pool));
//! ```

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::booking::{
    Address, Assignment, AssignmentSource, BookingRequest, BookingStatus, BookingStatusChange, FallbackTeamCandidate,
    StatusActor,
};
use crate::invitation::{
    Accepted, AnyInvitation, DeclineReason, Declined, Expired, Invitation, InvitationData, InvitationState,
    InvitationStatus, Pending, Viewed,
};
use crate::matching_config::{MatchingConfig, VersionedMatchingConfig};
use crate::slot_lock::{
    AnySlotLock, Confirmed, Held, LockAcquisition, LockState, LockStatus, ReleaseReason, Released, SlotLock, SlotLockData,
};
use crate::types::{AssignmentId, BookingId, InvitationId, LockId, ProviderId, TimeWindow};

use super::{
    AcceptCommit, ClosedBooking, DirectAssignment, Result, SiblingCleanup, StatusUpdate, Storage, StorageError,
    sort_fallback_queue,
};

/// Embedded schema migrations.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Attempts at inserting a lock when the conflicting lock vanishes between the failed insert and
/// the lookup.
const LOCK_INSERT_ATTEMPTS: usize = 3;

/// PostgreSQL-backed engine state.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Rows
// ============================================================================

fn corrupt(entity: &str, id: Uuid, problem: impl std::fmt::Display) -> StorageError {
    StorageError::Other(anyhow::anyhow!("{entity} {id} has corrupt data: {problem}"))
}

fn parse<T: FromStr<Err = crate::errors::Error>>(entity: &str, id: Uuid, value: &str) -> Result<T> {
    value.parse().map_err(|e| corrupt(entity, id, e))
}

fn required<T>(entity: &str, id: Uuid, column: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| corrupt(entity, id, format!("{column} is missing")))
}

#[derive(FromRow)]
struct BookingRow {
    id: Uuid,
    client_id: Uuid,
    service_category: String,
    eco_preference: bool,
    required_providers: i32,
    city: String,
    postal_code: String,
    district: Option<String>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    status: String,
    matching_retry_count: i32,
    short_notice: bool,
    fallback_requested_at: Option<DateTime<Utc>>,
    fallback_escalated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for BookingRequest {
    type Error = StorageError;

    fn try_from(row: BookingRow) -> Result<Self> {
        Ok(BookingRequest {
            id: BookingId(row.id),
            client_id: row.client_id.into(),
            service_category: row.service_category,
            eco_preference: row.eco_preference,
            required_providers: row.required_providers as u32,
            address: Address {
                city: row.city,
                postal_code: row.postal_code,
                district: row.district,
            },
            window: TimeWindow {
                start: row.window_start,
                end: row.window_end,
            },
            status: parse("booking", row.id, &row.status)?,
            matching_retry_count: row.matching_retry_count as u32,
            short_notice: row.short_notice,
            fallback_requested_at: row.fallback_requested_at,
            fallback_escalated_at: row.fallback_escalated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn bookings(rows: Vec<BookingRow>) -> Result<Vec<BookingRequest>> {
    rows.into_iter().map(BookingRequest::try_from).collect()
}

#[derive(FromRow)]
struct InvitationRow {
    id: Uuid,
    booking_id: Uuid,
    provider_id: Uuid,
    lock_id: Uuid,
    round: i32,
    status: String,
    decline_reason: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    viewed_at: Option<DateTime<Utc>>,
    responded_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
    metadata: serde_json::Value,
}

impl TryFrom<InvitationRow> for AnyInvitation {
    type Error = StorageError;

    fn try_from(row: InvitationRow) -> Result<Self> {
        let id = row.id;
        let status: InvitationStatus = parse("invitation", id, &row.status)?;
        let data = InvitationData {
            id: InvitationId(id),
            booking_id: BookingId(row.booking_id),
            provider_id: ProviderId(row.provider_id),
            lock_id: LockId(row.lock_id),
            round: row.round as u32,
            created_at: row.created_at,
            expires_at: row.expires_at,
            metadata: row.metadata,
        };
        let viewed_at = row.viewed_at;

        Ok(match status {
            InvitationStatus::Pending => Invitation { state: Pending {}, data }.into(),
            InvitationStatus::Viewed => Invitation {
                state: Viewed {
                    viewed_at: required("invitation", id, "viewed_at", viewed_at)?,
                },
                data,
            }
            .into(),
            InvitationStatus::Accepted => Invitation {
                state: Accepted {
                    viewed_at,
                    responded_at: required("invitation", id, "responded_at", row.responded_at)?,
                },
                data,
            }
            .into(),
            InvitationStatus::Declined => {
                let reason = required("invitation", id, "decline_reason", row.decline_reason)?;
                Invitation {
                    state: Declined {
                        viewed_at,
                        responded_at: required("invitation", id, "responded_at", row.responded_at)?,
                        reason: parse("invitation", id, &reason)?,
                    },
                    data,
                }
                .into()
            }
            InvitationStatus::Expired => Invitation {
                state: Expired {
                    viewed_at,
                    expired_at: required("invitation", id, "expired_at", row.expired_at)?,
                },
                data,
            }
            .into(),
        })
    }
}

fn invitations(rows: Vec<InvitationRow>) -> Result<Vec<AnyInvitation>> {
    rows.into_iter().map(AnyInvitation::try_from).collect()
}

/// The state-dependent invitation columns.
struct InvitationColumns {
    status: InvitationStatus,
    viewed_at: Option<DateTime<Utc>>,
    responded_at: Option<DateTime<Utc>>,
    expired_at: Option<DateTime<Utc>>,
    decline_reason: Option<&'static str>,
}

impl From<&AnyInvitation> for InvitationColumns {
    fn from(invitation: &AnyInvitation) -> Self {
        Self {
            status: invitation.status(),
            viewed_at: invitation.viewed_at(),
            responded_at: invitation.responded_at(),
            expired_at: match invitation {
                AnyInvitation::Expired(i) => Some(i.state.expired_at),
                _ => None,
            },
            decline_reason: invitation.decline_reason().map(|r| r.as_str()),
        }
    }
}

#[derive(FromRow)]
struct SlotLockRow {
    id: Uuid,
    booking_id: Uuid,
    provider_id: Uuid,
    slot_start: DateTime<Utc>,
    slot_end: DateTime<Utc>,
    status: String,
    release_reason: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    released_at: Option<DateTime<Utc>>,
}

impl TryFrom<SlotLockRow> for AnySlotLock {
    type Error = StorageError;

    fn try_from(row: SlotLockRow) -> Result<Self> {
        let id = row.id;
        let status: LockStatus = parse("slot_lock", id, &row.status)?;
        let data = SlotLockData {
            id: LockId(id),
            booking_id: BookingId(row.booking_id),
            provider_id: ProviderId(row.provider_id),
            window: TimeWindow {
                start: row.slot_start,
                end: row.slot_end,
            },
            created_at: row.created_at,
            expires_at: row.expires_at,
        };

        Ok(match status {
            LockStatus::Held => SlotLock { state: Held {}, data }.into(),
            LockStatus::Confirmed => SlotLock {
                state: Confirmed {
                    confirmed_at: required("slot_lock", id, "confirmed_at", row.confirmed_at)?,
                },
                data,
            }
            .into(),
            LockStatus::Released => {
                let reason = required("slot_lock", id, "release_reason", row.release_reason)?;
                SlotLock {
                    state: Released {
                        confirmed_at: row.confirmed_at,
                        released_at: required("slot_lock", id, "released_at", row.released_at)?,
                        reason: parse("slot_lock", id, &reason)?,
                    },
                    data,
                }
                .into()
            }
        })
    }
}

fn locks(rows: Vec<SlotLockRow>) -> Result<Vec<AnySlotLock>> {
    rows.into_iter().map(AnySlotLock::try_from).collect()
}

#[derive(FromRow)]
struct AssignmentRow {
    id: Uuid,
    booking_id: Uuid,
    provider_id: Uuid,
    lock_id: Uuid,
    source: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<AssignmentRow> for Assignment {
    type Error = StorageError;

    fn try_from(row: AssignmentRow) -> Result<Self> {
        Ok(Assignment {
            id: AssignmentId(row.id),
            booking_id: BookingId(row.booking_id),
            provider_id: ProviderId(row.provider_id),
            lock_id: LockId(row.lock_id),
            source: parse::<AssignmentSource>("assignment", row.id, &row.source)?,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct FallbackCandidateRow {
    id: Uuid,
    booking_id: Uuid,
    team_id: Uuid,
    name: String,
    preferred_size: i32,
    members: Vec<Uuid>,
    score: f64,
    created_at: DateTime<Utc>,
}

impl From<FallbackCandidateRow> for FallbackTeamCandidate {
    fn from(row: FallbackCandidateRow) -> Self {
        FallbackTeamCandidate {
            id: row.id.into(),
            booking_id: BookingId(row.booking_id),
            team_id: row.team_id.into(),
            name: row.name,
            preferred_size: row.preferred_size as u32,
            members: row.members.into_iter().map(ProviderId).collect(),
            score: row.score,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct StatusChangeRow {
    booking_id: Uuid,
    client_id: Uuid,
    provider_id: Option<Uuid>,
    from_status: String,
    to_status: String,
    actor: String,
    changed_at: DateTime<Utc>,
}

impl TryFrom<StatusChangeRow> for BookingStatusChange {
    type Error = StorageError;

    fn try_from(row: StatusChangeRow) -> Result<Self> {
        let id = row.booking_id;
        Ok(BookingStatusChange {
            booking_id: BookingId(id),
            client_id: row.client_id.into(),
            provider_id: row.provider_id.map(ProviderId),
            from: parse("booking_status_change", id, &row.from_status)?,
            to: parse("booking_status_change", id, &row.to_status)?,
            actor: parse::<StatusActor>("booking_status_change", id, &row.actor)?,
            changed_at: row.changed_at,
        })
    }
}

#[derive(FromRow)]
struct MatchingConfigRow {
    version: i64,
    config: Json<MatchingConfig>,
    created_at: DateTime<Utc>,
}

impl From<MatchingConfigRow> for VersionedMatchingConfig {
    fn from(row: MatchingConfigRow) -> Self {
        VersionedMatchingConfig {
            version: row.version,
            config: row.config.0,
            created_at: row.created_at,
        }
    }
}

fn provider_uuids(providers: &[ProviderId]) -> Vec<Uuid> {
    providers.iter().map(|p| p.0).collect()
}

// ============================================================================
// Transaction helpers
// ============================================================================

async fn booking_for_update(conn: &mut PgConnection, id: BookingId) -> Result<BookingRequest> {
    sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE id = $1 FOR UPDATE")
        .bind(*id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StorageError::not_found("booking", id))?
        .try_into()
}

/// Move a booking to `update.to` if it is in one of `expected`, recording the change.
async fn transition_booking(
    conn: &mut PgConnection,
    id: BookingId,
    expected: &[BookingStatus],
    update: StatusUpdate,
    now: DateTime<Utc>,
) -> Result<BookingRequest> {
    let current = booking_for_update(conn, id).await?;
    if !expected.contains(&current.status) {
        let expected = expected.iter().map(BookingStatus::as_str).collect::<Vec<_>>().join(" or ");
        return Err(StorageError::invalid_state("booking", id, current.status.as_str(), &expected));
    }

    let updated: BookingRequest =
        sqlx::query_as::<_, BookingRow>("UPDATE bookings SET status = $2, updated_at = $3 WHERE id = $1 RETURNING *")
            .bind(*id)
            .bind(update.to.as_str())
            .bind(now)
            .fetch_one(&mut *conn)
            .await?
            .try_into()?;

    sqlx::query(
        r#"
        INSERT INTO booking_status_changes (booking_id, client_id, provider_id, from_status, to_status, actor, changed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(*id)
    .bind(*updated.client_id)
    .bind(update.provider_id.map(|p| p.0))
    .bind(current.status.as_str())
    .bind(update.to.as_str())
    .bind(update.actor.as_str())
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(updated)
}

/// Release the given active locks, returning the ones this call released.
async fn release_locks(
    conn: &mut PgConnection,
    lock_ids: &[Uuid],
    reason: ReleaseReason,
    now: DateTime<Utc>,
) -> Result<Vec<LockId>> {
    if lock_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut released: Vec<LockId> = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE slot_locks
        SET status = 'released', released_at = $2, release_reason = $3
        WHERE id = ANY($1) AND status IN ('held', 'confirmed')
        RETURNING id
        "#,
    )
    .bind(lock_ids)
    .bind(now)
    .bind(reason.as_str())
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(LockId)
    .collect();
    released.sort();
    Ok(released)
}

/// Decline every outstanding invitation of a booking and release their locks.
async fn decline_outstanding(
    conn: &mut PgConnection,
    booking_id: BookingId,
    reason: DeclineReason,
    release_reason: ReleaseReason,
    now: DateTime<Utc>,
) -> Result<SiblingCleanup> {
    let mut declined: Vec<(Uuid, Uuid)> = sqlx::query_as(
        r#"
        UPDATE invitations
        SET status = 'declined', decline_reason = $2, responded_at = $3
        WHERE booking_id = $1 AND status IN ('pending', 'viewed')
        RETURNING id, lock_id
        "#,
    )
    .bind(*booking_id)
    .bind(reason.as_str())
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;
    declined.sort();

    let lock_ids: Vec<Uuid> = declined.iter().map(|(_, lock_id)| *lock_id).collect();
    let released = release_locks(conn, &lock_ids, release_reason, now).await?;

    Ok(SiblingCleanup {
        declined: declined.into_iter().map(|(id, _)| InvitationId(id)).collect(),
        released,
    })
}

async fn assignment_count(conn: &mut PgConnection, booking_id: BookingId) -> Result<usize> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assignments WHERE booking_id = $1")
        .bind(*booking_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as usize)
}

async fn cleanup_siblings_in(conn: &mut PgConnection, booking: &BookingRequest, now: DateTime<Utc>) -> Result<SiblingCleanup> {
    if assignment_count(conn, booking.id).await? < booking.required_providers as usize {
        return Ok(SiblingCleanup::default());
    }
    decline_outstanding(
        conn,
        booking.id,
        DeclineReason::for_sibling(booking.required_providers),
        ReleaseReason::Superseded,
        now,
    )
    .await
}

async fn insert_lock(conn: &mut PgConnection, data: &SlotLockData, status: LockStatus, confirmed_at: Option<DateTime<Utc>>) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO slot_locks (id, booking_id, provider_id, slot_start, slot_end, status, created_at, expires_at, confirmed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(*data.id)
    .bind(*data.booking_id)
    .bind(*data.provider_id)
    .bind(data.window.start)
    .bind(data.window.end)
    .bind(status.as_str())
    .bind(data.created_at)
    .bind(data.expires_at)
    .bind(confirmed_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_assignment(conn: &mut PgConnection, assignment: &Assignment) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO assignments (id, booking_id, provider_id, lock_id, source, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(*assignment.id)
    .bind(*assignment.booking_id)
    .bind(*assignment.provider_id)
    .bind(*assignment.lock_id)
    .bind(assignment.source.as_str())
    .bind(assignment.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn mark_invitation_accepted(
    conn: &mut PgConnection,
    id: InvitationId,
    viewed_at: Option<DateTime<Utc>>,
    responded_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE invitations SET status = 'accepted', viewed_at = $2, responded_at = $3 WHERE id = $1")
        .bind(*id)
        .bind(viewed_at)
        .bind(responded_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn mark_lock_confirmed(conn: &mut PgConnection, id: LockId, now: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE slot_locks SET status = 'confirmed', confirmed_at = $2 WHERE id = $1")
        .bind(*id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn latest_matching_config(conn: &mut PgConnection) -> Result<Option<VersionedMatchingConfig>> {
    Ok(sqlx::query_as::<_, MatchingConfigRow>(
        "SELECT version, config, created_at FROM matching_configs ORDER BY version DESC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?
    .map(VersionedMatchingConfig::from))
}

// ============================================================================
// Storage
// ============================================================================

#[async_trait]
impl Storage for PostgresStorage {
    #[instrument(skip(self, booking), fields(booking_id = %booking.id), err)]
    async fn insert_booking(&self, booking: &BookingRequest) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bookings (
                id, client_id, service_category, eco_preference, required_providers,
                city, postal_code, district, window_start, window_end, status,
                matching_retry_count, short_notice, fallback_requested_at, fallback_escalated_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(*booking.id)
        .bind(*booking.client_id)
        .bind(&booking.service_category)
        .bind(booking.eco_preference)
        .bind(booking.required_providers as i32)
        .bind(&booking.address.city)
        .bind(&booking.address.postal_code)
        .bind(&booking.address.district)
        .bind(booking.window.start)
        .bind(booking.window.end)
        .bind(booking.status.as_str())
        .bind(booking.matching_retry_count as i32)
        .bind(booking.short_notice)
        .bind(booking.fallback_requested_at)
        .bind(booking.fallback_escalated_at)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_booking(&self, id: BookingId) -> Result<BookingRequest> {
        sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("booking", id))?
            .try_into()
    }

    #[instrument(skip(self, expected), fields(booking_id = %id, to = %update.to), err)]
    async fn set_booking_status(
        &self,
        id: BookingId,
        expected: &[BookingStatus],
        update: StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<BookingRequest> {
        let mut tx = self.pool.begin().await?;
        let booking = transition_booking(&mut tx, id, expected, update, now).await?;
        tx.commit().await?;
        Ok(booking)
    }

    async fn record_exhaustion(&self, id: BookingId, round: u32, now: DateTime<Utc>) -> Result<Option<BookingRequest>> {
        let mut tx = self.pool.begin().await?;
        let booking = booking_for_update(&mut tx, id).await?;
        if booking.matching_retry_count != round || !booking.is_matchable() || booking.fallback_requested_at.is_some() {
            return Ok(None);
        }
        if assignment_count(&mut tx, id).await? >= booking.required_providers as usize {
            return Ok(None);
        }
        let outstanding: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM invitations WHERE booking_id = $1 AND status IN ('pending', 'viewed'))",
        )
        .bind(*id)
        .fetch_one(&mut *tx)
        .await?;
        if outstanding {
            return Ok(None);
        }

        let updated: BookingRequest = sqlx::query_as::<_, BookingRow>(
            "UPDATE bookings SET matching_retry_count = $2, updated_at = $3 WHERE id = $1 RETURNING *",
        )
        .bind(*id)
        .bind(round.saturating_add(1) as i32)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;
        tx.commit().await?;
        Ok(Some(updated))
    }

    async fn request_fallback(&self, id: BookingId, short_notice: bool, now: DateTime<Utc>) -> Result<BookingRequest> {
        sqlx::query_as::<_, BookingRow>(
            r#"
            UPDATE bookings
            SET fallback_requested_at = COALESCE(fallback_requested_at, $2),
                short_notice = short_notice OR $3,
                updated_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(*id)
        .bind(now)
        .bind(short_notice)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::not_found("booking", id))?
        .try_into()
    }

    async fn mark_fallback_escalated(&self, id: BookingId, now: DateTime<Utc>) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE bookings
            SET fallback_escalated_at = $2, updated_at = $2
            WHERE id = $1 AND fallback_escalated_at IS NULL
            "#,
        )
        .bind(*id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Distinguish "already escalated" from "no such booking"
            self.get_booking(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn bookings_needing_fallback(&self, starts_before: DateTime<Utc>) -> Result<Vec<BookingRequest>> {
        let rows = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT * FROM bookings
            WHERE status = 'pending_provider'
              AND fallback_requested_at IS NULL
              AND window_start <= $1
            ORDER BY window_start, id
            "#,
        )
        .bind(starts_before)
        .fetch_all(&self.pool)
        .await?;
        bookings(rows)
    }

    async fn bookings_pending_escalation(&self, starts_before: DateTime<Utc>) -> Result<Vec<BookingRequest>> {
        let rows = sqlx::query_as::<_, BookingRow>(
            r#"
            SELECT * FROM bookings
            WHERE status = 'pending_provider'
              AND fallback_requested_at IS NOT NULL
              AND fallback_escalated_at IS NULL
              AND window_start <= $1
            ORDER BY window_start, id
            "#,
        )
        .bind(starts_before)
        .fetch_all(&self.pool)
        .await?;
        bookings(rows)
    }

    async fn fallback_queue(&self) -> Result<Vec<BookingRequest>> {
        let rows = sqlx::query_as::<_, BookingRow>(
            "SELECT * FROM bookings WHERE status = 'pending_provider' AND fallback_requested_at IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut queue = bookings(rows)?;
        sort_fallback_queue(&mut queue);
        Ok(queue)
    }

    #[instrument(skip(self), fields(booking_id = %id, to = %update.to), err)]
    async fn close_booking(&self, id: BookingId, update: StatusUpdate, now: DateTime<Utc>) -> Result<ClosedBooking> {
        let release_reason = match update.to {
            BookingStatus::Cancelled => ReleaseReason::BookingCancelled,
            BookingStatus::Completed => ReleaseReason::BookingCompleted,
            other => {
                return Err(StorageError::CheckViolation {
                    constraint: None,
                    table: Some("bookings".to_string()),
                    message: format!("{other} is not a closing status"),
                });
            }
        };
        let expected = update.to.closing_sources().unwrap_or_default();

        let mut tx = self.pool.begin().await?;
        let previous_status = booking_for_update(&mut tx, id).await?.status;
        let booking = transition_booking(&mut tx, id, expected, update, now).await?;

        let mut cleanup = decline_outstanding(&mut tx, id, DeclineReason::BookingCancelled, release_reason, now).await?;
        let active: Vec<Uuid> =
            sqlx::query_scalar("SELECT id FROM slot_locks WHERE booking_id = $1 AND status IN ('held', 'confirmed')")
                .bind(*id)
                .fetch_all(&mut *tx)
                .await?;
        cleanup
            .released
            .extend(release_locks(&mut tx, &active, release_reason, now).await?);
        tx.commit().await?;

        Ok(ClosedBooking {
            booking,
            previous_status,
            cleanup,
        })
    }

    #[instrument(skip(self, invitation), fields(invitation_id = %invitation.data.id, provider_id = %invitation.data.provider_id), err)]
    async fn create_invitation(&self, invitation: &Invitation<Pending>) -> Result<()> {
        let data = &invitation.data;
        let mut tx = self.pool.begin().await?;

        let lock_status: Option<String> = sqlx::query_scalar("SELECT status FROM slot_locks WHERE id = $1 FOR SHARE")
            .bind(*data.lock_id)
            .fetch_optional(&mut *tx)
            .await?;
        match lock_status.as_deref() {
            Some("held") => {}
            Some(other) => return Err(StorageError::invalid_state("slot_lock", data.lock_id, other, "held")),
            None => {
                return Err(StorageError::ForeignKeyViolation {
                    constraint: Some("invitations_lock_id_fkey".to_string()),
                    table: Some("invitations".to_string()),
                    message: format!("slot lock {} does not exist", data.lock_id),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO invitations (id, booking_id, provider_id, lock_id, round, status, created_at, expires_at, metadata)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, $8)
            "#,
        )
        .bind(*data.id)
        .bind(*data.booking_id)
        .bind(*data.provider_id)
        .bind(*data.lock_id)
        .bind(data.round as i32)
        .bind(data.created_at)
        .bind(data.expires_at)
        .bind(&data.metadata)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_invitation(&self, id: InvitationId) -> Result<AnyInvitation> {
        sqlx::query_as::<_, InvitationRow>("SELECT * FROM invitations WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("invitation", id))?
            .try_into()
    }

    async fn list_invitations(&self, booking_id: BookingId) -> Result<Vec<AnyInvitation>> {
        let rows = sqlx::query_as::<_, InvitationRow>("SELECT * FROM invitations WHERE booking_id = $1 ORDER BY created_at, id")
            .bind(*booking_id)
            .fetch_all(&self.pool)
            .await?;
        invitations(rows)
    }

    #[instrument(skip(self, invitation), fields(invitation_id = %invitation.data.id), err)]
    async fn persist_invitation<T: InvitationState + Clone>(&self, invitation: &Invitation<T>) -> Result<()>
    where
        AnyInvitation: From<Invitation<T>>,
    {
        let id = invitation.data.id;
        let next = InvitationColumns::from(&AnyInvitation::from(invitation.clone()));
        let sources: Vec<String> = [InvitationStatus::Pending, InvitationStatus::Viewed]
            .into_iter()
            .filter(|current| current.can_transition_to(next.status))
            .map(|current| current.as_str().to_string())
            .collect();

        // Compare-and-swap on the stored status
        let rows_affected = sqlx::query(
            r#"
            UPDATE invitations
            SET status = $2, viewed_at = $3, responded_at = $4, expired_at = $5, decline_reason = $6
            WHERE id = $1 AND status = ANY($7)
            "#,
        )
        .bind(*id)
        .bind(next.status.as_str())
        .bind(next.viewed_at)
        .bind(next.responded_at)
        .bind(next.expired_at)
        .bind(next.decline_reason)
        .bind(&sources)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let current = self.get_invitation(id).await?.status();
            return Err(StorageError::invalid_state(
                "invitation",
                id,
                current.as_str(),
                &format!("a state that can become {}", next.status),
            ));
        }
        Ok(())
    }

    async fn outstanding_invitations_expired_before(&self, now: DateTime<Utc>) -> Result<Vec<AnyInvitation>> {
        let rows = sqlx::query_as::<_, InvitationRow>(
            r#"
            SELECT * FROM invitations
            WHERE status IN ('pending', 'viewed') AND expires_at <= $1
            ORDER BY expires_at, id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        invitations(rows)
    }

    async fn invitations_responded_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AnyInvitation>> {
        let rows = sqlx::query_as::<_, InvitationRow>(
            r#"
            SELECT * FROM invitations
            WHERE status IN ('accepted', 'declined') AND responded_at >= $1 AND responded_at < $2
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        invitations(rows)
    }

    #[instrument(skip(self, invitation), fields(invitation_id = %invitation.data.id, booking_id = %invitation.data.booking_id), err)]
    async fn accept_invitation(&self, invitation: &Invitation<Accepted>, now: DateTime<Utc>) -> Result<AcceptCommit> {
        let data = &invitation.data;
        let mut tx = self.pool.begin().await?;

        // Booking row first: every multi-record operation on a booking takes this lock
        let booking = booking_for_update(&mut tx, data.booking_id).await?;

        let current: AnyInvitation = sqlx::query_as::<_, InvitationRow>("SELECT * FROM invitations WHERE id = $1 FOR UPDATE")
            .bind(*data.id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StorageError::not_found("invitation", data.id))?
            .try_into()?;
        if !current.status().can_transition_to(InvitationStatus::Accepted) {
            return Err(StorageError::invalid_state("invitation", data.id, current.status().as_str(), "pending or viewed"));
        }

        let lock: AnySlotLock = sqlx::query_as::<_, SlotLockRow>("SELECT * FROM slot_locks WHERE id = $1 FOR UPDATE")
            .bind(*data.lock_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StorageError::not_found("slot_lock", data.lock_id))?
            .try_into()?;
        let lock_data = match lock {
            AnySlotLock::Held(held) if !held.data.is_expired(now) => held.data,
            AnySlotLock::Held(_) => return Err(StorageError::invalid_state("slot_lock", data.lock_id, "expired", "held")),
            other => {
                return Err(StorageError::invalid_state("slot_lock", data.lock_id, other.status().as_str(), "held"));
            }
        };

        if !booking.is_matchable() {
            return Err(StorageError::invalid_state("booking", booking.id, booking.status.as_str(), "pending_provider"));
        }

        mark_lock_confirmed(&mut tx, data.lock_id, now).await?;
        mark_invitation_accepted(&mut tx, data.id, invitation.state.viewed_at, invitation.state.responded_at).await?;

        let assignment = Assignment {
            id: AssignmentId::new(),
            booking_id: data.booking_id,
            provider_id: data.provider_id,
            lock_id: data.lock_id,
            source: AssignmentSource::Invitation,
            created_at: now,
        };
        insert_assignment(&mut tx, &assignment).await?;

        let fully_staffed = assignment_count(&mut tx, data.booking_id).await? >= booking.required_providers as usize;
        let cleanup = if fully_staffed {
            transition_booking(
                &mut tx,
                data.booking_id,
                &[BookingStatus::PendingProvider],
                StatusUpdate::by_provider(BookingStatus::Confirmed, data.provider_id),
                now,
            )
            .await?;
            cleanup_siblings_in(&mut tx, &booking, now).await?
        } else {
            SiblingCleanup::default()
        };

        tx.commit().await?;

        Ok(AcceptCommit {
            assignment,
            lock: SlotLock {
                state: Confirmed { confirmed_at: now },
                data: lock_data,
            },
            fully_staffed,
            cleanup,
        })
    }

    async fn cleanup_siblings(&self, booking_id: BookingId, now: DateTime<Utc>) -> Result<SiblingCleanup> {
        let mut tx = self.pool.begin().await?;
        let booking = booking_for_update(&mut tx, booking_id).await?;
        let cleanup = cleanup_siblings_in(&mut tx, &booking, now).await?;
        tx.commit().await?;
        Ok(cleanup)
    }

    async fn try_acquire_lock(&self, lock: SlotLock<Held>) -> Result<LockAcquisition> {
        let data = &lock.data;
        for attempt in 1..=LOCK_INSERT_ATTEMPTS {
            let mut conn = self.pool.acquire().await?;
            match insert_lock(&mut conn, data, LockStatus::Held, None).await {
                Ok(()) => return Ok(LockAcquisition::Acquired(lock)),
                Err(StorageError::ExclusionViolation { .. }) => {
                    let conflicting: Option<Uuid> = sqlx::query_scalar(
                        r#"
                        SELECT id FROM slot_locks
                        WHERE provider_id = $1
                          AND status IN ('held', 'confirmed')
                          AND tstzrange(slot_start, slot_end, '[)') && tstzrange($2, $3, '[)')
                        ORDER BY created_at
                        LIMIT 1
                        "#,
                    )
                    .bind(*data.provider_id)
                    .bind(data.window.start)
                    .bind(data.window.end)
                    .fetch_optional(&mut *conn)
                    .await?;
                    if let Some(conflicting) = conflicting {
                        return Ok(LockAcquisition::Conflict {
                            conflicting: LockId(conflicting),
                        });
                    }
                    debug!(attempt, provider_id = %data.provider_id, "Conflicting slot lock released meanwhile, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(StorageError::ExclusionViolation {
            constraint: Some("slot_locks_no_overlap".to_string()),
            message: format!(
                "provider {} slot {} kept conflicting after {LOCK_INSERT_ATTEMPTS} attempts",
                data.provider_id, data.window
            ),
        })
    }

    async fn get_lock(&self, id: LockId) -> Result<AnySlotLock> {
        sqlx::query_as::<_, SlotLockRow>("SELECT * FROM slot_locks WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::not_found("slot_lock", id))?
            .try_into()
    }

    #[instrument(skip(self, lock), fields(lock_id = %lock.data.id), err)]
    async fn persist_lock<T: LockState + Clone>(&self, lock: &SlotLock<T>) -> Result<()>
    where
        AnySlotLock: From<SlotLock<T>>,
    {
        let id = lock.data.id;
        let next = AnySlotLock::from(lock.clone());
        let next_status = next.status();
        let (released_at, release_reason) = match &next {
            AnySlotLock::Released(l) => (Some(l.state.released_at), Some(l.state.reason.as_str())),
            _ => (None, None),
        };
        let sources: Vec<String> = [LockStatus::Held, LockStatus::Confirmed]
            .into_iter()
            .filter(|current| current.can_transition_to(next_status))
            .map(|current| current.as_str().to_string())
            .collect();

        let rows_affected = sqlx::query(
            r#"
            UPDATE slot_locks
            SET status = $2, confirmed_at = $3, released_at = $4, release_reason = $5
            WHERE id = $1 AND status = ANY($6)
            "#,
        )
        .bind(*id)
        .bind(next_status.as_str())
        .bind(next.confirmed_at())
        .bind(released_at)
        .bind(release_reason)
        .bind(&sources)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let current = self.get_lock(id).await?.status();
            return Err(StorageError::invalid_state(
                "slot_lock",
                id,
                current.as_str(),
                &format!("a state that can become {next_status}"),
            ));
        }
        Ok(())
    }

    async fn active_locks_overlapping(&self, providers: &[ProviderId], window: TimeWindow) -> Result<Vec<AnySlotLock>> {
        if providers.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, SlotLockRow>(
            r#"
            SELECT * FROM slot_locks
            WHERE provider_id = ANY($1)
              AND status IN ('held', 'confirmed')
              AND tstzrange(slot_start, slot_end, '[)') && tstzrange($2, $3, '[)')
            "#,
        )
        .bind(provider_uuids(providers))
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;
        locks(rows)
    }

    async fn held_locks_expired_before(&self, now: DateTime<Utc>) -> Result<Vec<SlotLock<Held>>> {
        let rows = sqlx::query_as::<_, SlotLockRow>(
            "SELECT * FROM slot_locks WHERE status = 'held' AND expires_at <= $1 ORDER BY expires_at, id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(locks(rows)?.into_iter().filter_map(AnySlotLock::into_held).collect())
    }

    async fn locks_for_booking(&self, booking_id: BookingId) -> Result<Vec<AnySlotLock>> {
        let rows = sqlx::query_as::<_, SlotLockRow>("SELECT * FROM slot_locks WHERE booking_id = $1 ORDER BY created_at, id")
            .bind(*booking_id)
            .fetch_all(&self.pool)
            .await?;
        locks(rows)
    }

    #[instrument(skip(self, providers), fields(booking_id = %booking_id, providers = providers.len()), err)]
    async fn assign_directly(
        &self,
        booking_id: BookingId,
        providers: &[ProviderId],
        now: DateTime<Utc>,
    ) -> Result<DirectAssignment> {
        let mut tx = self.pool.begin().await?;
        let booking = booking_for_update(&mut tx, booking_id).await?;
        if !booking.is_matchable() {
            return Err(StorageError::invalid_state("booking", booking_id, booking.status.as_str(), "pending_provider"));
        }

        let assigned = assignment_count(&mut tx, booking_id).await?;
        if assigned + providers.len() > booking.required_providers as usize {
            return Err(StorageError::invalid_state(
                "booking",
                booking_id,
                &format!("staffed {assigned}/{}", booking.required_providers),
                &format!("room for {} more providers", providers.len()),
            ));
        }

        let mut assignments = Vec::with_capacity(providers.len());
        for (position, provider_id) in providers.iter().enumerate() {
            if providers[..position].contains(provider_id) {
                return Err(StorageError::UniqueViolation {
                    constraint: Some("assignments_booking_id_provider_id_key".to_string()),
                    table: Some("assignments".to_string()),
                    message: format!("provider {provider_id} is listed twice"),
                });
            }

            // Reuse the provider's open invitation and its HELD lock when there is one
            let open: Option<AnyInvitation> = sqlx::query_as::<_, InvitationRow>(
                r#"
                SELECT * FROM invitations
                WHERE booking_id = $1 AND provider_id = $2 AND status IN ('pending', 'viewed')
                FOR UPDATE
                "#,
            )
            .bind(*booking_id)
            .bind(**provider_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(AnyInvitation::try_from)
            .transpose()?;

            let reusable = match &open {
                Some(invitation) => {
                    let lock_status: Option<String> =
                        sqlx::query_scalar("SELECT status FROM slot_locks WHERE id = $1 FOR UPDATE")
                            .bind(*invitation.data().lock_id)
                            .fetch_optional(&mut *tx)
                            .await?;
                    (lock_status.as_deref() == Some("held")).then_some(invitation)
                }
                None => None,
            };

            let lock_id = match reusable {
                Some(invitation) => {
                    let lock_id = invitation.data().lock_id;
                    mark_lock_confirmed(&mut tx, lock_id, now).await?;
                    mark_invitation_accepted(&mut tx, invitation.id(), invitation.viewed_at(), now).await?;
                    lock_id
                }
                None => {
                    // The exclusion constraint rejects providers booked elsewhere in the window
                    let data = SlotLockData {
                        id: LockId::new(),
                        booking_id,
                        provider_id: *provider_id,
                        window: booking.window,
                        created_at: now,
                        expires_at: now,
                    };
                    insert_lock(&mut tx, &data, LockStatus::Confirmed, Some(now)).await?;
                    data.id
                }
            };

            let assignment = Assignment {
                id: AssignmentId::new(),
                booking_id,
                provider_id: *provider_id,
                lock_id,
                source: AssignmentSource::Operator,
                created_at: now,
            };
            insert_assignment(&mut tx, &assignment).await?;
            assignments.push(assignment);
        }

        let fully_staffed = assigned + assignments.len() >= booking.required_providers as usize;
        let cleanup = if fully_staffed {
            transition_booking(
                &mut tx,
                booking_id,
                &[BookingStatus::PendingProvider],
                StatusUpdate::new(BookingStatus::Confirmed, StatusActor::Operator),
                now,
            )
            .await?;
            cleanup_siblings_in(&mut tx, &booking, now).await?
        } else {
            SiblingCleanup::default()
        };

        tx.commit().await?;

        Ok(DirectAssignment {
            assignments,
            fully_staffed,
            cleanup,
        })
    }

    async fn list_assignments(&self, booking_id: BookingId) -> Result<Vec<Assignment>> {
        sqlx::query_as::<_, AssignmentRow>("SELECT * FROM assignments WHERE booking_id = $1 ORDER BY created_at, id")
            .bind(*booking_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Assignment::try_from)
            .collect()
    }

    async fn insert_fallback_candidate(&self, candidate: &FallbackTeamCandidate) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fallback_team_candidates (id, booking_id, team_id, name, preferred_size, members, score, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(*candidate.id)
        .bind(*candidate.booking_id)
        .bind(*candidate.team_id)
        .bind(&candidate.name)
        .bind(candidate.preferred_size as i32)
        .bind(provider_uuids(&candidate.members))
        .bind(candidate.score)
        .bind(candidate.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_fallback_candidates(&self, booking_id: BookingId) -> Result<Vec<FallbackTeamCandidate>> {
        Ok(sqlx::query_as::<_, FallbackCandidateRow>(
            "SELECT * FROM fallback_team_candidates WHERE booking_id = $1 ORDER BY created_at, id",
        )
        .bind(*booking_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(FallbackTeamCandidate::from)
        .collect())
    }

    async fn status_changes_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<BookingStatusChange>> {
        sqlx::query_as::<_, StatusChangeRow>(
            r#"
            SELECT booking_id, client_id, provider_id, from_status, to_status, actor, changed_at
            FROM booking_status_changes
            WHERE changed_at >= $1 AND changed_at < $2
            ORDER BY changed_at, id
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(BookingStatusChange::try_from)
        .collect()
    }

    async fn bookings_created_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<BookingRequest>> {
        let rows = sqlx::query_as::<_, BookingRow>("SELECT * FROM bookings WHERE created_at >= $1 AND created_at < $2")
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        bookings(rows)
    }

    async fn current_matching_config(&self) -> Result<VersionedMatchingConfig> {
        let mut conn = self.pool.acquire().await?;
        latest_matching_config(&mut conn)
            .await?
            .ok_or_else(|| StorageError::not_found("matching_config", "latest"))
    }

    #[instrument(skip(self, config), err)]
    async fn replace_matching_config(&self, config: &MatchingConfig, now: DateTime<Utc>) -> Result<VersionedMatchingConfig> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("LOCK TABLE matching_configs IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        let version = latest_matching_config(&mut tx).await?.map_or(1, |current| current.version + 1);
        let stored = sqlx::query_as::<_, MatchingConfigRow>(
            "INSERT INTO matching_configs (version, config, created_at) VALUES ($1, $2, $3) RETURNING version, config, created_at",
        )
        .bind(version)
        .bind(Json(config))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(stored.into())
    }

    async fn ensure_matching_config(&self, config: &MatchingConfig, now: DateTime<Utc>) -> Result<VersionedMatchingConfig> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("LOCK TABLE matching_configs IN EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;
        if let Some(existing) = latest_matching_config(&mut tx).await? {
            return Ok(existing);
        }
        let stored = sqlx::query_as::<_, MatchingConfigRow>(
            "INSERT INTO matching_configs (version, config, created_at) VALUES (1, $1, $2) RETURNING version, config, created_at",
        )
        .bind(Json(config))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(stored.into())
    }
}
