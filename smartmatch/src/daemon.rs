//! Periodic background work: the expiry/escalation sweep and the guardrail monitor.
//!
//! Both loops run until their [`CancellationToken`] is cancelled. A failed pass is logged and
//! retried on the next tick; nothing here gives up on its own.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{GuardrailMonitorConfig, SweeperConfig};
use crate::engine::{MatchingEngine, SweepReport};
use crate::errors::Result;
use crate::storage::Storage;

/// Runs [`MatchingEngine::sweep`] on an interval.
pub struct Sweeper<S: Storage> {
    engine: Arc<MatchingEngine<S>>,
    config: SweeperConfig,
}

impl<S: Storage + 'static> Sweeper<S> {
    pub fn new(engine: Arc<MatchingEngine<S>>, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    /// One sweep pass as of `now`.
    #[instrument(skip(self), err)]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = self.engine.sweep(now).await?;
        if report == SweepReport::default() {
            debug!("Sweep found nothing to do");
        } else {
            info!(
                invitations_expired = report.invitations_expired,
                locks_released = report.locks_released,
                rounds_reissued = report.rounds_reissued,
                fallbacks_requested = report.fallbacks_requested,
                escalated = report.escalated,
                "Sweep completed"
            );
        }
        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval = ?self.config.interval, "Starting sweeper");

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sweeper shutting down");
                    break;
                }
                _ = interval.tick() => {
                    // Errors are already logged by run_once
                    let _ = self.run_once(Utc::now()).await;
                }
            }
        }
    }
}

/// Recomputes the trailing guardrail report on an interval.
pub struct GuardrailRefresher<S: Storage> {
    engine: Arc<MatchingEngine<S>>,
    config: GuardrailMonitorConfig,
}

impl<S: Storage + 'static> GuardrailRefresher<S> {
    pub fn new(engine: Arc<MatchingEngine<S>>, config: GuardrailMonitorConfig) -> Self {
        Self { engine, config }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval = ?self.config.interval,
            period = ?self.config.period,
            "Starting guardrail monitor"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Guardrail monitor shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.engine.refresh_guardrails(self.config.period(), Utc::now()).await {
                        Ok(report) => debug!(flags = report.flags.len(), "Guardrail report refreshed"),
                        Err(e) => warn!(error = %e, "Failed to refresh guardrail report"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invitation::InvitationStatus;
    use crate::matching_config::MatchingConfig;
    use crate::test_utils::{booking_fixture, candidate_fixture, engine_with, provider_at};
    use std::time::Duration;

    #[test_log::test(tokio::test)]
    async fn test_sweep_pass_expires_overdue_invitations() {
        let engine = Arc::new(
            engine_with(
                vec![provider_at(candidate_fixture(), 3.0)],
                vec![],
                MatchingConfig::default(),
            )
            .await,
        );
        let booking = booking_fixture(1);
        engine.storage().insert_booking(&booking).await.unwrap();
        let now = Utc::now();
        engine.start_matching(booking.id, now).await.unwrap();

        let sweeper = Sweeper::new(engine.clone(), SweeperConfig::default());
        assert_eq!(sweeper.run_once(now).await.unwrap(), SweepReport::default());

        let report = sweeper.run_once(now + chrono::Duration::minutes(16)).await.unwrap();
        assert_eq!(report.invitations_expired, 1);

        let invitations = engine.storage().list_invitations(booking.id).await.unwrap();
        assert_eq!(invitations[0].status(), InvitationStatus::Expired);
        let booking = engine.storage().get_booking(booking.id).await.unwrap();
        assert_eq!(booking.matching_retry_count, 1);
    }

    #[tokio::test]
    async fn test_loops_stop_on_cancel() {
        let engine = Arc::new(engine_with(vec![], vec![], MatchingConfig::default()).await);
        let shutdown = CancellationToken::new();

        let sweeper = tokio::spawn(
            Sweeper::new(
                engine.clone(),
                SweeperConfig {
                    enabled: true,
                    interval: Duration::from_millis(10),
                },
            )
            .run(shutdown.clone()),
        );
        let monitor = tokio::spawn(
            GuardrailRefresher::new(
                engine.clone(),
                GuardrailMonitorConfig {
                    enabled: true,
                    interval: Duration::from_millis(10),
                    period: Duration::from_secs(3600),
                },
            )
            .run(shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(engine.latest_guardrail_report().is_some());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), sweeper).await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(1), monitor).await.unwrap().unwrap();
    }
}
