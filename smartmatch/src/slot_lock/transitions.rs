use chrono::{DateTime, Utc};

use crate::errors::{Error, Result};
use crate::storage::{Storage, StorageError};
use crate::types::{BookingId, LockId, ProviderId, TimeWindow};

use super::types::{AnySlotLock, Confirmed, Held, LockAcquisition, ReleaseReason, Released, SlotLock, SlotLockData};

/// What to lock, for whom, and for how long.
#[derive(Debug, Clone, Copy)]
pub struct LockRequest {
    pub booking_id: BookingId,
    pub provider_id: ProviderId,
    pub window: TimeWindow,
    pub ttl: chrono::Duration,
}

impl SlotLock<Held> {
    /// Try to hold `request.window` for the provider. Loses to any overlapping HELD/CONFIRMED
    /// lock of the same provider, expired-but-unswept HELD locks included.
    pub async fn acquire<S: Storage + ?Sized>(request: LockRequest, now: DateTime<Utc>, storage: &S) -> Result<LockAcquisition> {
        let window = TimeWindow::new(request.window.start, request.window.end)?;
        if request.ttl <= chrono::Duration::zero() {
            return Err(Error::Validation {
                message: "slot lock TTL must be positive".to_string(),
            });
        }

        let lock = SlotLock {
            state: Held {},
            data: SlotLockData {
                id: LockId::new(),
                booking_id: request.booking_id,
                provider_id: request.provider_id,
                window,
                created_at: now,
                expires_at: now + request.ttl,
            },
        };
        Ok(storage.try_acquire_lock(lock).await?)
    }

    pub async fn confirm<S: Storage + ?Sized>(self, now: DateTime<Utc>, storage: &S) -> Result<SlotLock<Confirmed>> {
        if self.data.is_expired(now) {
            return Err(Error::Conflict {
                message: format!("slot lock {} expired at {}", self.data.id, self.data.expires_at),
            });
        }
        let lock = SlotLock {
            data: self.data,
            state: Confirmed { confirmed_at: now },
        };
        storage.persist_lock(&lock).await.map_err(|e| match e {
            StorageError::InvalidState { id, current, .. } => Error::Conflict {
                message: format!("slot lock {id} is {current}"),
            },
            other => Error::from(other),
        })?;
        Ok(lock)
    }

    pub async fn release<S: Storage + ?Sized>(
        self,
        reason: ReleaseReason,
        now: DateTime<Utc>,
        storage: &S,
    ) -> Result<SlotLock<Released>> {
        let lock = SlotLock {
            data: self.data,
            state: Released {
                confirmed_at: None,
                released_at: now,
                reason,
            },
        };
        storage.persist_lock(&lock).await?;
        Ok(lock)
    }
}

impl SlotLock<Confirmed> {
    /// Confirmed locks are only released when their booking is cancelled or completed.
    pub async fn release<S: Storage + ?Sized>(
        self,
        reason: ReleaseReason,
        now: DateTime<Utc>,
        storage: &S,
    ) -> Result<SlotLock<Released>> {
        let lock = SlotLock {
            state: Released {
                confirmed_at: Some(self.state.confirmed_at),
                released_at: now,
                reason,
            },
            data: self.data,
        };
        storage.persist_lock(&lock).await?;
        Ok(lock)
    }
}

impl AnySlotLock {
    /// Release from any state. Releasing a released lock returns it unchanged.
    pub async fn release<S: Storage + ?Sized>(
        self,
        reason: ReleaseReason,
        now: DateTime<Utc>,
        storage: &S,
    ) -> Result<SlotLock<Released>> {
        match self {
            AnySlotLock::Held(lock) => lock.release(reason, now, storage).await,
            AnySlotLock::Confirmed(lock) => lock.release(reason, now, storage).await,
            AnySlotLock::Released(lock) => Ok(lock),
        }
    }
}

/// Release a lock by id, idempotently. A concurrent release is not an error.
pub async fn release_lock<S: Storage + ?Sized>(
    storage: &S,
    id: LockId,
    reason: ReleaseReason,
    now: DateTime<Utc>,
) -> Result<SlotLock<Released>> {
    let lock = storage.get_lock(id).await?;
    match lock.release(reason, now, storage).await {
        Err(Error::Storage(StorageError::InvalidState { .. })) => match storage.get_lock(id).await? {
            AnySlotLock::Released(lock) => Ok(lock),
            other => Err(Error::Conflict {
                message: format!("slot lock {id} changed to {} while releasing", other.status()),
            }),
        },
        result => result,
    }
}

/// Release every HELD lock whose TTL has elapsed. Locks that change state underneath the sweep
/// (confirmed by a late acceptance, released by a decline) are skipped.
#[tracing::instrument(skip(storage))]
pub async fn sweep_expired<S: Storage + ?Sized>(storage: &S, now: DateTime<Utc>) -> Result<Vec<SlotLock<Released>>> {
    let expired = storage.held_locks_expired_before(now).await?;
    let mut released = Vec::with_capacity(expired.len());

    for lock in expired {
        let lock_id = lock.data.id;
        match lock.release(ReleaseReason::LockExpired, now, storage).await {
            Ok(lock) => released.push(lock),
            Err(Error::Storage(StorageError::InvalidState { current, .. })) => {
                tracing::debug!(lock_id = %lock_id, current = %current, "Lock changed state during sweep, skipping");
            }
            Err(e) => return Err(e),
        }
    }

    if !released.is_empty() {
        tracing::info!(count = released.len(), "Released expired slot locks");
    }
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot_lock::LockStatus;
    use crate::storage::in_memory::InMemoryStorage;
    use chrono::Duration;

    fn request(provider_id: ProviderId, start_hour: i64, end_hour: i64) -> LockRequest {
        let base = Utc::now() + Duration::days(2);
        LockRequest {
            booking_id: BookingId::new(),
            provider_id,
            window: TimeWindow::new(base + Duration::hours(start_hour), base + Duration::hours(end_hour)).unwrap(),
            ttl: Duration::minutes(15),
        }
    }

    fn acquired(acquisition: LockAcquisition) -> SlotLock<Held> {
        match acquisition {
            LockAcquisition::Acquired(lock) => lock,
            LockAcquisition::Conflict { conflicting } => panic!("unexpected conflict with {conflicting}"),
        }
    }

    #[tokio::test]
    async fn test_overlapping_acquire_conflicts_back_to_back_does_not() {
        let storage = InMemoryStorage::new();
        let provider = ProviderId::new();
        let now = Utc::now();

        let first = acquired(SlotLock::acquire(request(provider, 9, 12), now, &storage).await.unwrap());

        match SlotLock::acquire(request(provider, 11, 13), now, &storage).await.unwrap() {
            LockAcquisition::Conflict { conflicting } => assert_eq!(conflicting, first.data.id),
            LockAcquisition::Acquired(_) => panic!("overlapping lock must conflict"),
        }
        acquired(SlotLock::acquire(request(provider, 12, 14), now, &storage).await.unwrap());
        // A different provider is unaffected
        acquired(SlotLock::acquire(request(ProviderId::new(), 9, 12), now, &storage).await.unwrap());
    }

    #[tokio::test]
    async fn test_confirm_expired_lock_is_conflict() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let lock = acquired(SlotLock::acquire(request(ProviderId::new(), 9, 12), now, &storage).await.unwrap());

        let err = lock.confirm(now + Duration::minutes(16), &storage).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let lock = acquired(SlotLock::acquire(request(ProviderId::new(), 9, 12), now, &storage).await.unwrap());
        let id = lock.data.id;

        let first = release_lock(&storage, id, ReleaseReason::InvitationDeclined, now).await.unwrap();
        let second = release_lock(&storage, id, ReleaseReason::BookingCancelled, now).await.unwrap();
        assert_eq!(first.state.reason, ReleaseReason::InvitationDeclined);
        assert_eq!(second.state.reason, ReleaseReason::InvitationDeclined);
    }

    #[tokio::test]
    async fn test_sweep_releases_only_expired_held_locks() {
        let storage = InMemoryStorage::new();
        let now = Utc::now();
        let provider = ProviderId::new();

        let stale = acquired(SlotLock::acquire(request(provider, 1, 2), now, &storage).await.unwrap());
        let confirmed = acquired(SlotLock::acquire(request(provider, 3, 4), now, &storage).await.unwrap())
            .confirm(now, &storage)
            .await
            .unwrap();

        // Still blocks until swept
        assert!(matches!(
            SlotLock::acquire(request(provider, 1, 2), now + Duration::minutes(20), &storage).await.unwrap(),
            LockAcquisition::Conflict { .. }
        ));

        let released = sweep_expired(&storage, now + Duration::minutes(20)).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].data.id, stale.data.id);

        let confirmed = storage.get_lock(confirmed.data.id).await.unwrap();
        assert_eq!(confirmed.status(), LockStatus::Confirmed);
    }
}
