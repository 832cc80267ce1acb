use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::LeaderElectionConfig;

/// Advisory lock key shared by every instance: "SMARTMCH" in hex.
pub const LEADER_LOCK_ID: i64 = 0x534D_4152_544D_4348_i64;

/// Background task for leader election.
///
/// The leader runs the sweeper and guardrail monitor. Sweeps are idempotent, so the short window
/// in which an old leader has not yet noticed it lost its connection does no harm.
///
/// PostgreSQL advisory locks are session-based, so the leader keeps a dedicated connection for as
/// long as it holds the lock. Returns once `shutdown` is cancelled, after running
/// `on_lose_leadership` if this instance was leading.
#[instrument(skip_all, fields(lock_id = lock_id))]
pub async fn leader_election_task<F1, F2, Fut1, Fut2>(
    pool: PgPool,
    config: LeaderElectionConfig,
    is_leader: Arc<AtomicBool>,
    lock_id: i64,
    shutdown: CancellationToken,
    on_gain_leadership: F1,
    on_lose_leadership: F2,
) where
    F1: Fn() -> Fut1 + Send + 'static,
    F2: Fn() -> Fut2 + Send + 'static,
    Fut1: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    Fut2: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut leader_conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if leader_conn.take().is_some() {
                    is_leader.store(false, Ordering::Relaxed);
                    if let Err(e) = on_lose_leadership().await {
                        tracing::error!(error = %e, "on_lose_leadership callback failed during shutdown");
                    }
                }
                info!("Leader election shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        if !is_leader.load(Ordering::Relaxed) {
            let mut conn = match pool.acquire().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to acquire connection for leader election");
                    continue;
                }
            };
            match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                .bind(lock_id)
                .fetch_one(&mut *conn)
                .await
            {
                Ok(true) => {
                    info!("Gained leadership");
                    is_leader.store(true, Ordering::Relaxed);
                    // Holding the connection holds the lock
                    leader_conn = Some(conn);

                    if let Err(e) = on_gain_leadership().await {
                        tracing::error!(error = %e, "on_gain_leadership callback failed");
                    }
                }
                Ok(false) => debug!("Following - will retry"),
                Err(e) => tracing::error!(error = %e, "Failed to check leader lock"),
            }
        } else if let Some(conn) = leader_conn.as_mut() {
            match sqlx::query("SELECT 1").execute(&mut **conn).await {
                Ok(_) => debug!("Leadership renewed (connection alive)"),
                Err(e) => {
                    // The advisory lock died with the session
                    tracing::warn!(error = %e, "Lost leadership (connection died)");
                    is_leader.store(false, Ordering::Relaxed);
                    leader_conn = None;

                    if let Err(e) = on_lose_leadership().await {
                        tracing::error!(error = %e, "on_lose_leadership callback failed");
                    }
                }
            }
        } else {
            tracing::error!("Inconsistent state: is_leader=true but no connection");
            is_leader.store(false, Ordering::Relaxed);
        }
    }
}
