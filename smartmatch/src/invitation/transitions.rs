use chrono::{DateTime, Utc};

use crate::errors::Result;
use crate::storage::{AcceptCommit, Storage};

use super::types::{
    Accepted, AnyInvitation, DeclineReason, Declined, Expired, Invitation, InvitationData, Outstanding, Pending, Viewed,
};

impl Invitation<Pending> {
    /// Store a new pending invitation. The lock referenced by `data.lock_id` must already be held.
    pub async fn issue<S: Storage + ?Sized>(data: InvitationData, storage: &S) -> Result<Invitation<Pending>> {
        let invitation = Invitation { state: Pending {}, data };
        storage.create_invitation(&invitation).await?;
        Ok(invitation)
    }

    pub async fn mark_viewed<S: Storage + ?Sized>(self, now: DateTime<Utc>, storage: &S) -> Result<Invitation<Viewed>> {
        let invitation = Invitation {
            data: self.data,
            state: Viewed { viewed_at: now },
        };
        storage.persist_invitation(&invitation).await?;
        Ok(invitation)
    }
}

impl<T> Invitation<T>
where
    T: Outstanding + Clone,
    AnyInvitation: From<Invitation<T>>,
{
    /// Accept on behalf of the provider. The lock confirmation, the assignment and sibling
    /// cleanup are committed by storage as one unit.
    pub async fn accept<S: Storage + ?Sized>(self, now: DateTime<Utc>, storage: &S) -> Result<AcceptCommit> {
        let invitation = Invitation {
            state: Accepted {
                viewed_at: self.state.viewed_at(),
                responded_at: now,
            },
            data: self.data,
        };
        let commit = storage.accept_invitation(&invitation, now).await?;
        Ok(commit)
    }

    /// Decline the invitation. The caller releases the backing lock.
    pub async fn decline<S: Storage + ?Sized>(
        self,
        reason: DeclineReason,
        now: DateTime<Utc>,
        storage: &S,
    ) -> Result<Invitation<Declined>> {
        let invitation = Invitation {
            state: Declined {
                viewed_at: self.state.viewed_at(),
                responded_at: now,
                reason,
            },
            data: self.data,
        };
        storage.persist_invitation::<Declined>(&invitation).await?;
        Ok(invitation)
    }

    /// Expire the invitation. The caller releases the backing lock.
    pub async fn expire<S: Storage + ?Sized>(self, now: DateTime<Utc>, storage: &S) -> Result<Invitation<Expired>> {
        let invitation = Invitation {
            state: Expired {
                viewed_at: self.state.viewed_at(),
                expired_at: now,
            },
            data: self.data,
        };
        storage.persist_invitation::<Expired>(&invitation).await?;
        Ok(invitation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::invitation::InvitationStatus;
    use crate::storage::StorageError;
    use crate::storage::in_memory::InMemoryStorage;
    use crate::test_utils::{held_lock_for, pending_invitation_data, seed_booking};

    #[tokio::test]
    async fn test_viewed_then_declined_keeps_viewed_at() {
        let storage = InMemoryStorage::new();
        let booking = seed_booking(&storage, 1).await;
        let lock = held_lock_for(&storage, &booking).await;
        let now = Utc::now();

        let pending = Invitation::issue(pending_invitation_data(&booking, &lock, now), &storage)
            .await
            .unwrap();
        let viewed = pending.mark_viewed(now, &storage).await.unwrap();
        let declined = viewed
            .decline(DeclineReason::ProviderDeclined, now, &storage)
            .await
            .unwrap();

        assert_eq!(declined.state.viewed_at, Some(now));
        let stored = storage.get_invitation(declined.data.id).await.unwrap();
        assert_eq!(stored.status(), InvitationStatus::Declined);
        assert!(stored.is_provider_decline());
    }

    #[tokio::test]
    async fn test_terminal_invitation_cannot_be_overwritten() {
        let storage = InMemoryStorage::new();
        let booking = seed_booking(&storage, 1).await;
        let lock = held_lock_for(&storage, &booking).await;
        let now = Utc::now();

        let pending = Invitation::issue(pending_invitation_data(&booking, &lock, now), &storage)
            .await
            .unwrap();
        // A stale copy racing the sweep
        let stale = pending.clone();
        pending.expire(now, &storage).await.unwrap();

        let err = stale
            .decline(DeclineReason::ProviderDeclined, now, &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(StorageError::InvalidState { .. })));
    }
}
