//! Transport supervision: WebSocket first, HTTP polling as the fallback.
//!
//! With an API key the supervisor drives the WebSocket reconnect loop and
//! runs a best-effort HTTP poller while waiting out each reconnect delay, so
//! bulletins are not lost during outages. A terminal authorization failure
//! permanently degrades the process to HTTP polling.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::{RawBulletin, Service, SubscribeFrame};
use crate::pool::NodePool;
use crate::ws::{SessionEnd, WsEvent, WsSession};

/// HTTP polling period.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Reconnect delay growth step in seconds.
const RECONNECT_STEP_SECS: u64 = 10;

/// Reconnect delay ceiling in seconds.
const RECONNECT_CAP_SECS: u64 = 600;

/// Node-switch retries per poll request.
const FETCH_RETRY: u32 = 1;

/// Messages into the ingest controller.
#[derive(Debug)]
pub enum IngestMessage {
    /// One pushed bulletin (WebSocket transport)
    Bulletin(RawBulletin),
    /// A full poll snapshot; tracked alerts absent from it are lifted
    Snapshot(Vec<RawBulletin>),
}

/// Delay before the next dial after `failures` consecutive failures.
#[must_use]
pub fn reconnect_delay(failures: u32) -> Duration {
    Duration::from_secs((RECONNECT_STEP_SECS * u64::from(failures)).min(RECONNECT_CAP_SECS))
}

enum WsOutcome {
    /// Authorization is terminally broken; fall back to HTTP
    Degrade,
    Shutdown,
}

/// Owns transport mode selection and the reconnect loop.
pub struct Supervisor {
    pool: Arc<NodePool>,
    api_key: Option<String>,
    services: Vec<Service>,
    ingest: mpsc::Sender<IngestMessage>,
    ntp: Arc<watch::Sender<serde_json::Value>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        pool: Arc<NodePool>,
        api_key: Option<String>,
        services: Vec<Service>,
        ingest: mpsc::Sender<IngestMessage>,
        ntp: watch::Sender<serde_json::Value>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pool,
            api_key,
            services,
            ingest,
            ntp: Arc::new(ntp),
            shutdown,
        }
    }

    /// Drive the chosen transport until shutdown.
    pub async fn run(self) {
        match self.api_key.clone() {
            Some(key) => {
                info!("API key found, using WebSocket transport");
                if let WsOutcome::Degrade = self.run_websocket(&key).await {
                    warn!("dropping to HTTP polling for the rest of the process lifetime");
                    self.run_http().await;
                }
            }
            None => {
                info!("no API key found, using HTTP polling transport");
                self.run_http().await;
            }
        }
    }

    /// The WebSocket reconnect loop.
    async fn run_websocket(&self, key: &str) -> WsOutcome {
        let (events_tx, events_rx) = mpsc::channel::<WsEvent>(64);
        let router = tokio::spawn(route_events(
            events_rx,
            self.ingest.clone(),
            Arc::clone(&self.ntp),
        ));

        let mut failures = 0u32;
        let mut node_index = 0usize;
        let outcome = loop {
            if self.shutdown.is_cancelled() {
                break WsOutcome::Shutdown;
            }

            let nodes = self.pool.ws_nodes();
            let url = nodes[node_index % nodes.len()].clone();
            node_index += 1;

            let session = WsSession::new(
                url,
                SubscribeFrame::new(key.to_string(), self.services.clone()),
                events_tx.clone(),
                self.shutdown.clone(),
            );
            let end = session.run().await;
            if session.was_subscribed() {
                failures = 0;
            }

            match end {
                SessionEnd::Shutdown => break WsOutcome::Shutdown,
                SessionEnd::AuthFailed(reason) => {
                    error!("WebSocket authorization failed: {reason}");
                    break WsOutcome::Degrade;
                }
                SessionEnd::Reconnect { reopen, reason } => {
                    failures += 1;
                    let delay = reconnect_delay(failures);
                    info!(
                        "{reason} (reopen={reopen}); reconnecting in {}s, \
                         polling HTTP meanwhile",
                        delay.as_secs()
                    );
                    if self.poll_http_for(delay).await.is_break() {
                        break WsOutcome::Shutdown;
                    }
                }
            }
        };

        router.abort();
        outcome
    }

    /// Best-effort polling that fills one reconnect wait.
    async fn poll_http_for(&self, window: Duration) -> ControlFlow<()> {
        let deadline = tokio::time::Instant::now() + window;
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return ControlFlow::Break(()),
                () = tokio::time::sleep_until(deadline) => return ControlFlow::Continue(()),
                _ = ticker.tick() => self.poll_once().await,
            }
        }
    }

    /// Fixed-period polling mode.
    async fn run_http(&self) {
        debug!("polling /eq/eew every {POLL_INTERVAL:?}");
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                _ = ticker.tick() => self.poll_once().await,
            }
        }
    }

    async fn poll_once(&self) {
        match self.pool.fetch_eew(FETCH_RETRY).await {
            Ok(bulletins) => {
                let _ = self.ingest.send(IngestMessage::Snapshot(bulletins)).await;
            }
            Err(e) => warn!("eew poll failed, will retry: {e}"),
        }
    }
}

/// Route typed session events to their consumers.
async fn route_events(
    mut events: mpsc::Receiver<WsEvent>,
    ingest: mpsc::Sender<IngestMessage>,
    ntp: Arc<watch::Sender<serde_json::Value>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WsEvent::Eew(bulletin) => {
                let _ = ingest.send(IngestMessage::Bulletin(bulletin)).await;
            }
            WsEvent::Ntp(sample) => {
                ntp.send_replace(sample);
            }
        }
    }
}
