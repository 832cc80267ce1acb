//! Shared fixtures for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::booking::{Address, BookingRequest, BookingStatus};
use crate::collaborators::snapshot::SnapshotProvider;
use crate::collaborators::{GeoPriceOracle, NotificationDispatch, ProviderSnapshot, SnapshotDirectory};
use crate::engine::MatchingEngine;
use crate::invitation::InvitationData;
use crate::matching_config::MatchingConfig;
use crate::provider::{ProviderCandidate, ProviderKind, ProviderTeam, ServiceArea};
use crate::slot_lock::{Held, LockAcquisition, LockRequest, SlotLock};
use crate::storage::Storage;
use crate::storage::in_memory::InMemoryStorage;
use crate::types::{BookingId, ClientId, InvitationId, ProviderId, TimeWindow};

/// A three-hour deep clean in Brussels, three days out, waiting for providers.
pub fn booking_fixture(required_providers: u32) -> BookingRequest {
    let now = Utc::now();
    let start = now + Duration::days(3);
    BookingRequest {
        id: BookingId::new(),
        client_id: ClientId::new(),
        service_category: "deep_cleaning".to_string(),
        eco_preference: false,
        required_providers,
        address: Address {
            city: "Brussels".to_string(),
            postal_code: "1000".to_string(),
            district: None,
        },
        window: TimeWindow {
            start,
            end: start + Duration::hours(3),
        },
        status: BookingStatus::PendingProvider,
        matching_retry_count: 0,
        short_notice: false,
        fallback_requested_at: None,
        fallback_escalated_at: None,
        created_at: now,
        updated_at: now,
    }
}

/// An eco-friendly freelancer who serves everywhere.
pub fn candidate_fixture() -> ProviderCandidate {
    ProviderCandidate {
        id: ProviderId::new(),
        kind: ProviderKind::Freelancer,
        service_categories: vec!["deep_cleaning".to_string()],
        service_area: ServiceArea::default(),
        hourly_rate_cents: 3000,
        rating_average: 4.5,
        rating_count: 20,
        eco_offering: true,
        reliability: Some(0.9),
        team: None,
    }
}

pub async fn seed_booking<S: Storage + ?Sized>(storage: &S, required_providers: u32) -> BookingRequest {
    let booking = booking_fixture(required_providers);
    storage.insert_booking(&booking).await.unwrap();
    booking
}

/// Hold the booking's window for a fresh provider.
pub async fn held_lock_for<S: Storage + ?Sized>(storage: &S, booking: &BookingRequest) -> SlotLock<Held> {
    let request = LockRequest {
        booking_id: booking.id,
        provider_id: ProviderId::new(),
        window: booking.window,
        ttl: Duration::minutes(15),
    };
    match SlotLock::acquire(request, Utc::now(), storage).await.unwrap() {
        LockAcquisition::Acquired(lock) => lock,
        LockAcquisition::Conflict { conflicting } => panic!("fresh provider conflicts with {conflicting}"),
    }
}

pub fn pending_invitation_data(booking: &BookingRequest, lock: &SlotLock<Held>, now: DateTime<Utc>) -> InvitationData {
    InvitationData {
        id: InvitationId::new(),
        booking_id: booking.id,
        provider_id: lock.data.provider_id,
        lock_id: lock.data.id,
        round: booking.matching_retry_count,
        created_at: now,
        expires_at: lock.data.expires_at,
        metadata: serde_json::Value::Null,
    }
}

/// A snapshot entry for `candidate` at `distance_km` from the fixture postal code.
pub fn provider_at(candidate: ProviderCandidate, distance_km: f64) -> SnapshotProvider {
    SnapshotProvider {
        candidate,
        distances_km: BTreeMap::from([("1000".to_string(), distance_km)]),
        price_estimate_cents: None,
    }
}

/// Records every invitation it is asked to deliver.
#[derive(Debug, Clone, Default)]
pub struct RecordingDispatch {
    pub sent: Arc<Mutex<Vec<InvitationId>>>,
}

#[async_trait]
impl NotificationDispatch for RecordingDispatch {
    async fn notify(&self, invitation: &InvitationData) -> anyhow::Result<()> {
        self.sent.lock().push(invitation.id);
        Ok(())
    }
}

/// A notification channel that is always down.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingDispatch;

#[async_trait]
impl NotificationDispatch for FailingDispatch {
    async fn notify(&self, _invitation: &InvitationData) -> anyhow::Result<()> {
        anyhow::bail!("push gateway unavailable")
    }
}

/// An oracle that is always down.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingOracle;

#[async_trait]
impl GeoPriceOracle for FailingOracle {
    async fn distance_km(&self, _candidate: &ProviderCandidate, _booking: &BookingRequest) -> anyhow::Result<Option<f64>> {
        anyhow::bail!("geocoder timed out")
    }

    async fn price_estimate(&self, _candidate: &ProviderCandidate, _booking: &BookingRequest) -> anyhow::Result<Option<i64>> {
        anyhow::bail!("pricing service timed out")
    }
}

/// An engine over fresh in-memory storage, serving `providers` and `teams` from a snapshot.
pub async fn engine_with(
    providers: Vec<SnapshotProvider>,
    teams: Vec<ProviderTeam>,
    config: MatchingConfig,
) -> MatchingEngine<InMemoryStorage> {
    let storage = InMemoryStorage::new();
    storage.ensure_matching_config(&config, Utc::now()).await.unwrap();
    let directory = Arc::new(SnapshotDirectory::new(ProviderSnapshot { providers, teams }));
    MatchingEngine::builder()
        .storage(Arc::new(storage))
        .directory(directory.clone())
        .oracle(directory)
        .dispatch(Arc::new(RecordingDispatch::default()))
        .build()
}
