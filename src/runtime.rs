//! Core runtime: wiring, task lifecycle and shutdown.
//!
//! Owns the alert table, the notifier set, the transport supervisor, the
//! bounded computation pool and the expiry sweeper. `run()` blocks until an
//! interrupt or an external shutdown request, then tears everything down
//! within a bounded grace period.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::EewcastError;
use crate::ingest::IngestController;
use crate::location::RegionIndex;
use crate::notifiers;
use crate::notify::{EewEvent, NotifierSet};
use crate::pool::NodePool;
use crate::supervisor::Supervisor;
use crate::tracker::AlertTable;
use crate::wave::WaveModelCache;

/// Grace period for notifier close hooks at shutdown.
pub const NOTIFIER_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Grace period for the long-running tasks at shutdown.
const TASK_GRACE: Duration = Duration::from_secs(5);

/// How often lapsed alerts are swept out of the table.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Queue depth between the transports and the ingest controller.
const INGEST_QUEUE: usize = 64;

/// Wires every component together and owns their tasks.
pub struct Runtime {
    config: Config,
    api_key: Option<String>,
    regions: Arc<RegionIndex>,
    waves: Arc<WaveModelCache>,
    table: Arc<tokio::sync::Mutex<AlertTable>>,
    notifiers: Arc<NotifierSet>,
    pool: Arc<NodePool>,
    shutdown: CancellationToken,
    ready: watch::Sender<bool>,
    ntp_tx: watch::Sender<serde_json::Value>,
    ntp_rx: watch::Receiver<serde_json::Value>,
}

impl Runtime {
    /// Load assets and construct every component.
    ///
    /// # Errors
    ///
    /// Returns an error on a missing region asset or an unusable API config;
    /// both are fatal at startup.
    pub fn new(config: Config, api_key: Option<String>) -> Result<Self, EewcastError> {
        let regions = Arc::new(RegionIndex::load(&config.api.asset_dir)?);
        info!(
            "loaded {} regions across {} cities",
            regions.len(),
            regions.cities().count()
        );

        let pool = Arc::new(NodePool::new(&config.api)?);
        let notifiers = Arc::new(NotifierSet::discover(&config, &notifiers::descriptors()));
        if notifiers.is_empty() {
            warn!("no notifier enabled; alerts will only reach the log");
        }

        let (ready, _) = watch::channel(false);
        let (ntp_tx, ntp_rx) = watch::channel(serde_json::Value::Null);

        Ok(Self {
            config,
            api_key,
            regions,
            waves: Arc::new(WaveModelCache::new()),
            table: Arc::new(tokio::sync::Mutex::new(AlertTable::new())),
            notifiers,
            pool,
            shutdown: CancellationToken::new(),
            ready,
            ntp_tx,
            ntp_rx,
        })
    }

    /// Token that requests shutdown when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Turns true once every task is running.
    #[must_use]
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Server clock samples for skew observers.
    #[must_use]
    pub fn ntp_samples(&self) -> watch::Receiver<serde_json::Value> {
        self.ntp_rx.clone()
    }

    /// Run until shutdown is requested.
    ///
    /// # Errors
    ///
    /// Currently always returns `Ok`; the signature leaves room for fatal
    /// runtime conditions.
    pub async fn run(self) -> Result<(), EewcastError> {
        self.notifiers.start_all().await;
        self.pool.probe().await;

        let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_QUEUE);

        let permits = Arc::new(Semaphore::new(num_cpus::get().max(1)));
        let controller = IngestController::new(
            Arc::clone(&self.table),
            Arc::clone(&self.notifiers),
            Arc::clone(&self.regions),
            Arc::clone(&self.waves),
            permits,
            self.config.eew_source.clone(),
            self.shutdown.clone(),
        );
        let mut ingest_task = tokio::spawn(controller.run(ingest_rx));

        let supervisor = Supervisor::new(
            Arc::clone(&self.pool),
            self.api_key.clone(),
            self.config.api.services.clone(),
            ingest_tx,
            self.ntp_tx,
            self.shutdown.clone(),
        );
        let mut supervisor_task = tokio::spawn(supervisor.run());

        let mut sweeper_task = tokio::spawn(sweep(
            Arc::clone(&self.table),
            Arc::clone(&self.notifiers),
            self.shutdown.clone(),
        ));

        let _ = self.ready.send(true);
        info!("eewcast is ready");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
            () = self.shutdown.cancelled() => info!("shutdown requested"),
        }
        self.shutdown.cancel();

        for (name, task) in [
            ("supervisor", &mut supervisor_task),
            ("ingest", &mut ingest_task),
            ("sweeper", &mut sweeper_task),
        ] {
            if tokio::time::timeout(TASK_GRACE, &mut *task).await.is_err() {
                warn!("{name} task ignored shutdown, aborting it");
                task.abort();
            }
        }

        self.table.lock().await.abort_all();
        self.notifiers.close_all(NOTIFIER_CLOSE_GRACE).await;
        info!("shutdown complete");
        Ok(())
    }
}

/// Periodically drop lapsed alerts and dispatch their lifts.
async fn sweep(
    table: Arc<tokio::sync::Mutex<AlertTable>>,
    notifiers: Arc<NotifierSet>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                let lapsed = table.lock().await.expire(Utc::now());
                for alert in lapsed {
                    info!("alert {} lifted (deadline passed)", alert.id);
                    notifiers.dispatch(EewEvent::Lift, &alert);
                }
            }
        }
    }
}
