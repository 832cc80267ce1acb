//! Contracts the engine consumes from the rest of the platform.
//!
//! Implementations return `anyhow::Result`; the engine decides per call whether a failure is
//! fatal (the directory) or degrades gracefully (oracle lookups, notifications).

use async_trait::async_trait;

use crate::booking::BookingRequest;
use crate::invitation::InvitationData;
use crate::provider::{ProviderCandidate, ProviderTeam};
use crate::types::TimeWindow;

pub mod dispatch;
pub mod snapshot;

pub use dispatch::LoggingDispatch;
pub use snapshot::{ProviderSnapshot, SnapshotDirectory};

/// Source of provider snapshots.
#[async_trait]
pub trait ProviderDirectory: Send + Sync {
    /// Active providers offering `category` (and eco products, when `eco` is set) who may be
    /// available during `window`. The engine applies the remaining hard filters itself.
    async fn list_eligible_candidates(
        &self,
        category: &str,
        eco: bool,
        window: &TimeWindow,
    ) -> anyhow::Result<Vec<ProviderCandidate>>;

    /// Pre-composed teams with at least one member offering `category`.
    async fn list_teams(&self, category: &str, window: &TimeWindow) -> anyhow::Result<Vec<ProviderTeam>>;
}

/// Distance and price lookups. Either may be unknown; errors are treated as unknown.
#[async_trait]
pub trait GeoPriceOracle: Send + Sync {
    async fn distance_km(&self, candidate: &ProviderCandidate, booking: &BookingRequest) -> anyhow::Result<Option<f64>>;

    /// Indicative price for the whole booking, in cents.
    async fn price_estimate(&self, candidate: &ProviderCandidate, booking: &BookingRequest) -> anyhow::Result<Option<i64>>;
}

/// Fire-and-forget delivery of new invitations to providers.
#[async_trait]
pub trait NotificationDispatch: Send + Sync {
    async fn notify(&self, invitation: &InvitationData) -> anyhow::Result<()>;
}
