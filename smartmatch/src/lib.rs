//! # smartmatch: assignment engine for service bookings
//!
//! `smartmatch` decides which providers are offered a booking, in what order, and what happens
//! when nobody takes it. A booking that needs providers is scored against every eligible
//! candidate; the best few get time-boxed invitations, each backed by a lock on the provider's
//! slot so nobody is double-booked. The first acceptance wins and the other invitations are
//! withdrawn. When invitations run out or expire the engine retries with a wider radius, and after
//! enough failed rounds (or when the booking is close) it proposes a pre-composed team and puts
//! the booking in front of an operator.
//!
//! ## Architecture
//!
//! - [`scoring`] ranks candidates with a weighted, deterministic score
//! - [`invitation`] and [`slot_lock`] model the two lifecycles as typestates
//! - [`escalation`] decides between another round and a fallback team
//! - [`guardrails`] flags providers and clients whose behaviour looks like abuse
//! - [`engine`] ties these together; [`storage`] is the only place state lives
//! - [`daemon`] runs the periodic expiry sweep and guardrail monitor
//!
//! The engine talks to the rest of the platform through the traits in [`collaborators`]. The
//! crate ships a snapshot-backed directory and a logging notification dispatch for local runs.
//!
//! ## Quick Start
//!
//! ```ignore
//! use clap::Parser;
//! use smartmatch::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = smartmatch::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     smartmatch::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::in_memory(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Database Setup
//!
//! With the `postgres` feature, [`Application::connect`] runs the embedded migrations on startup.
//! They can also be run by hand:
//!
//! ```ignore
//! smartmatch::migrator().run(&pool).await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::info;

pub mod booking;
pub mod collaborators;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod errors;
pub mod escalation;
pub mod guardrails;
pub mod invitation;
#[cfg(feature = "postgres")]
pub mod leader_election;
pub mod matching_config;
pub mod provider;
pub mod scoring;
pub mod slot_lock;
pub mod storage;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use config::Config;
pub use engine::MatchingEngine;
pub use errors::{Error, Result};
pub use storage::Storage;
pub use storage::in_memory::InMemoryStorage;
#[cfg(feature = "postgres")]
pub use storage::postgres::{PostgresStorage, migrator};

use collaborators::{LoggingDispatch, ProviderSnapshot, SnapshotDirectory};
use daemon::{GuardrailRefresher, Sweeper};
use guardrails::GuardrailMonitor;

/// The engine plus the configuration it was built from.
pub struct Application<S: Storage> {
    config: Config,
    engine: Arc<MatchingEngine<S>>,
    #[cfg(feature = "postgres")]
    pool: Option<sqlx::PgPool>,
}

impl Application<InMemoryStorage> {
    /// Build an application over in-process storage.
    pub async fn in_memory(config: Config) -> anyhow::Result<Self> {
        let engine = build_engine(Arc::new(InMemoryStorage::new()), &config).await?;
        Ok(Self {
            config,
            engine: Arc::new(engine),
            #[cfg(feature = "postgres")]
            pool: None,
        })
    }
}

#[cfg(feature = "postgres")]
impl Application<PostgresStorage> {
    /// Connect to `database.url`, run migrations and build the application.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let crate::config::DatabaseConfig::External { url, pool: settings } = &config.database else {
            anyhow::bail!("database.type must be external to connect to PostgreSQL");
        };

        let mut options = sqlx::postgres::PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(settings.acquire_timeout);
        if !settings.idle_timeout.is_zero() {
            options = options.idle_timeout(settings.idle_timeout);
        }
        let pool = options.connect(url).await?;
        migrator().run(&pool).await?;
        info!("Database migrations applied");

        let engine = build_engine(Arc::new(PostgresStorage::new(pool.clone())), &config).await?;
        Ok(Self {
            config,
            engine: Arc::new(engine),
            pool: Some(pool),
        })
    }
}

impl<S: Storage + 'static> Application<S> {
    pub fn engine(&self) -> &Arc<MatchingEngine<S>> {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run background services until `shutdown` resolves, then stop them.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let services = self.start_background_services();
        shutdown.await;
        info!("Stopping background services");
        services.shutdown().await;
        Ok(())
    }

    /// Start the sweeper and guardrail monitor, behind leader election when running on
    /// PostgreSQL with it enabled.
    pub fn start_background_services(&self) -> BackgroundServices {
        let shutdown_token = CancellationToken::new();
        let drop_guard = shutdown_token.clone().drop_guard();
        let is_leader = Arc::new(AtomicBool::new(false));
        let mut background_tasks = Vec::new();
        let session_tasks = SessionTasks::default();

        #[cfg(feature = "postgres")]
        {
            if let Some(pool) = self.pool.clone()
                && self.config.background_services.leader_election.enabled
            {
                info!("Starting leader election - will attempt to acquire leadership");
                background_tasks.push(self.spawn_leader_election(
                    pool,
                    is_leader.clone(),
                    session_tasks.clone(),
                    shutdown_token.clone(),
                ));
                return BackgroundServices {
                    is_leader,
                    background_tasks,
                    session_tasks,
                    shutdown_token,
                    drop_guard: Some(drop_guard),
                };
            }
        }

        info!("Launching without leader election: running as leader");
        is_leader.store(true, Ordering::Relaxed);
        background_tasks.extend(spawn_leader_services(&self.engine, &self.config, &shutdown_token));

        BackgroundServices {
            is_leader,
            background_tasks,
            session_tasks,
            shutdown_token,
            drop_guard: Some(drop_guard),
        }
    }

    #[cfg(feature = "postgres")]
    fn spawn_leader_election(
        &self,
        pool: sqlx::PgPool,
        is_leader: Arc<AtomicBool>,
        session_tasks: SessionTasks,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        // Each leadership session gets a child token, cancelled when leadership is lost
        let session: Arc<parking_lot::Mutex<Option<CancellationToken>>> = Arc::new(parking_lot::Mutex::new(None));
        let session_gain = session.clone();
        let session_lose = session;
        let engine = self.engine.clone();
        let config = self.config.clone();
        let parent = shutdown.clone();

        tokio::spawn(leader_election::leader_election_task(
            pool,
            self.config.background_services.leader_election.clone(),
            is_leader,
            leader_election::LEADER_LOCK_ID,
            shutdown,
            move || {
                let token = parent.child_token();
                let handles = spawn_leader_services(&engine, &config, &token);
                {
                    let mut tasks = session_tasks.lock();
                    // Tasks of earlier sessions stop once leadership is lost
                    tasks.retain(|handle| !handle.is_finished());
                    tasks.extend(handles);
                }
                *session_gain.lock() = Some(token);
                async { Ok(()) }
            },
            move || {
                if let Some(token) = session_lose.lock().take() {
                    token.cancel();
                }
                async { Ok(()) }
            },
        ))
    }
}

/// Handles of the services spawned each time leadership is gained.
type SessionTasks = Arc<parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>>;

/// Background tasks of a running [`Application`].
///
/// Dropping this cancels every task through `drop_guard`; [`BackgroundServices::shutdown`] also
/// waits for them to finish.
pub struct BackgroundServices {
    is_leader: Arc<AtomicBool>,
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    session_tasks: SessionTasks,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
        // The election task is done, so no new session can push handles
        let session_tasks = std::mem::take(&mut *self.session_tasks.lock());
        for handle in session_tasks {
            let _ = handle.await;
        }
    }
}

async fn build_engine<S: Storage>(storage: Arc<S>, config: &Config) -> anyhow::Result<MatchingEngine<S>> {
    let stored = storage.ensure_matching_config(&config.matching, Utc::now()).await?;
    if stored.config != config.matching {
        info!(
            version = stored.version,
            "Stored matching config differs from the configured one; keeping the stored version"
        );
    }

    let directory = Arc::new(match &config.directory.snapshot_path {
        Some(path) => SnapshotDirectory::from_path(path)?,
        None => {
            tracing::warn!("No provider snapshot configured; no candidates will be found");
            SnapshotDirectory::new(ProviderSnapshot::default())
        }
    });

    Ok(MatchingEngine::builder()
        .storage(storage)
        .directory(directory.clone())
        .oracle(directory)
        .dispatch(Arc::new(LoggingDispatch))
        .guardrails(Arc::new(GuardrailMonitor::new(config.guardrails.clone())))
        .build())
}

fn spawn_leader_services<S: Storage + 'static>(
    engine: &Arc<MatchingEngine<S>>,
    config: &Config,
    shutdown: &CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let services = &config.background_services;
    let mut handles = Vec::new();

    if services.sweeper.enabled {
        let sweeper = Sweeper::new(engine.clone(), services.sweeper.clone());
        handles.push(tokio::spawn(sweeper.run(shutdown.clone())));
    } else {
        info!("Sweeper disabled by configuration");
    }

    if services.guardrail_monitor.enabled {
        let monitor = GuardrailRefresher::new(engine.clone(), services.guardrail_monitor.clone());
        handles.push(tokio::spawn(monitor.run(shutdown.clone())));
    } else {
        info!("Guardrail monitor disabled by configuration");
    }

    handles
}
