//! Ingest controller: classification, computation scheduling and fan-out.
//!
//! The single consumer of raw bulletins from both transports. Each bulletin
//! is filtered by provider, classified against the alert table, and committed
//! together with its notifier dispatch under the table lock, so every
//! transition produces exactly one event per notifier.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ProviderFilter;
use crate::eew::{Alert, ComputeState};
use crate::intensity::{self, ComputeError};
use crate::location::RegionIndex;
use crate::models::RawBulletin;
use crate::notify::{EewEvent, NotifierSet};
use crate::supervisor::IngestMessage;
use crate::tracker::{AlertTable, Classification, ComputeHandle};
use crate::wave::WaveModelCache;

/// Classifies bulletins and drives computations and notifier dispatch.
pub struct IngestController {
    table: Arc<tokio::sync::Mutex<AlertTable>>,
    notifiers: Arc<NotifierSet>,
    regions: Arc<RegionIndex>,
    waves: Arc<WaveModelCache>,
    permits: Arc<Semaphore>,
    filter: ProviderFilter,
    shutdown: CancellationToken,
}

impl IngestController {
    #[must_use]
    pub fn new(
        table: Arc<tokio::sync::Mutex<AlertTable>>,
        notifiers: Arc<NotifierSet>,
        regions: Arc<RegionIndex>,
        waves: Arc<WaveModelCache>,
        permits: Arc<Semaphore>,
        filter: ProviderFilter,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            table,
            notifiers,
            regions,
            waves,
            permits,
            filter,
            shutdown,
        }
    }

    /// Consume bulletins until shutdown or the transports hang up.
    pub async fn run(self, mut rx: mpsc::Receiver<IngestMessage>) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                message = rx.recv() => match message {
                    None => return,
                    Some(IngestMessage::Bulletin(raw)) => self.handle_bulletin(raw).await,
                    Some(IngestMessage::Snapshot(bulletins)) => {
                        self.handle_snapshot(bulletins).await;
                    }
                }
            }
        }
    }

    /// One HTTP poll cycle: ingest every bulletin, then lift tracked alerts
    /// missing from the snapshot.
    async fn handle_snapshot(&self, bulletins: Vec<RawBulletin>) {
        let mut seen: HashSet<String> = HashSet::with_capacity(bulletins.len());
        for raw in bulletins {
            if !raw.id.is_empty() {
                seen.insert(raw.id.clone());
            }
            self.handle_bulletin(raw).await;
        }

        let now = Utc::now();
        let lifted: Vec<Arc<Alert>> = {
            let mut table = self.table.lock().await;
            table
                .ids()
                .into_iter()
                .filter(|id| !seen.contains(id))
                .filter_map(|id| table.remove(&id, now))
                .collect()
        };
        for alert in lifted {
            info!("alert {} lifted (absent from upstream snapshot)", alert.id);
            self.notifiers.dispatch(EewEvent::Lift, &alert);
        }
    }

    async fn handle_bulletin(&self, raw: RawBulletin) {
        if let Err(e) = raw.validate() {
            warn!("dropping invalid bulletin: {e}");
            return;
        }
        if !self.filter.allows(&raw.author) {
            debug!("dropping bulletin from unaccepted provider `{}`", raw.author);
            return;
        }

        let now = Utc::now();
        let mut table = self.table.lock().await;
        match table.classify(&raw.id, raw.serial, now) {
            Classification::Duplicate => {
                trace!("duplicate bulletin for {} serial {}", raw.id, raw.serial);
            }
            Classification::Stale => {
                debug!("stale bulletin for {} serial {}", raw.id, raw.serial);
            }
            Classification::New => {
                let Some((alert, latch)) = self.admit(&raw) else { return };
                table.insert(Arc::clone(&alert), self.spawn_computation(&alert, latch));
                drop(table);

                info!(
                    "New EEW alert is detected!\n\
                     --------------------------------\n\
                     {}\n\
                     --------------------------------",
                    alert.describe()
                );
                self.notifiers.dispatch(EewEvent::Send, &alert);
            }
            Classification::Update { previous_serial } => {
                let Some((alert, latch)) = self.admit(&raw) else { return };
                // Replacing the entry cancels the previous computation.
                table.insert(Arc::clone(&alert), self.spawn_computation(&alert, latch));
                drop(table);

                info!(
                    "EEW alert updated (serial {previous_serial} -> {})\n\
                     --------------------------------\n\
                     {}\n\
                     --------------------------------",
                    alert.serial,
                    alert.describe()
                );
                self.notifiers.dispatch(EewEvent::Update, &alert);
            }
        }
    }

    /// Convert a classified bulletin into an alert plus its result latch.
    fn admit(&self, raw: &RawBulletin) -> Option<(Arc<Alert>, watch::Sender<ComputeState>)> {
        match Alert::from_raw(raw) {
            Ok((alert, latch)) => Some((Arc::new(alert), latch)),
            Err(e) => {
                warn!("dropping unconvertible bulletin {}: {e}", raw.id);
                None
            }
        }
    }

    /// Launch the per-alert intensity computation on the bounded worker pool.
    fn spawn_computation(
        &self,
        alert: &Arc<Alert>,
        latch: watch::Sender<ComputeState>,
    ) -> ComputeHandle {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let alert = Arc::clone(alert);
        let regions = Arc::clone(&self.regions);
        let waves = Arc::clone(&self.waves);
        let permits = Arc::clone(&self.permits);

        let task = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if child.is_cancelled() {
                return;
            }

            let model = waves.get(alert.earthquake.depth_km);
            match intensity::expected_intensity(
                &alert.earthquake,
                &regions,
                None,
                &model,
                &child,
            ) {
                Ok(map) => {
                    trace!("computation finished for alert {}", alert.id);
                    let _ = latch.send(ComputeState::Done(Arc::new(map)));
                }
                // Dropping the latch tells waiters the computation was
                // replaced; they fall back to the degraded payload.
                Err(ComputeError::Cancelled) => {}
                Err(ComputeError::Failed(reason)) => {
                    warn!("computation failed for alert {}: {reason}", alert.id);
                    let _ = latch.send(ComputeState::Failed(reason));
                }
            }
        });

        ComputeHandle { cancel, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::notify::tests::RecordingNotifier;

    type Recorded = Arc<Mutex<Vec<(EewEvent, String, u32)>>>;

    struct Harness {
        tx: mpsc::Sender<IngestMessage>,
        table: Arc<tokio::sync::Mutex<AlertTable>>,
        events: Recorded,
    }

    fn start_controller(filter: ProviderFilter) -> Harness {
        let regions = Arc::new(
            RegionIndex::parse(
                r#"{
                    "花蓮縣": {"花蓮市": {"code": 970, "lon": 121.6067, "lat": 23.9824}},
                    "臺北市": {"中正區": {"code": 100, "lon": 121.5198, "lat": 25.0324}}
                }"#,
            )
            .expect("regions"),
        );
        let (recorder, events) = RecordingNotifier::new();
        let table = Arc::new(tokio::sync::Mutex::new(AlertTable::new()));
        let controller = IngestController::new(
            Arc::clone(&table),
            Arc::new(NotifierSet::from_notifiers(vec![recorder])),
            regions,
            Arc::new(WaveModelCache::new()),
            Arc::new(Semaphore::new(2)),
            filter,
            CancellationToken::new(),
        );

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(controller.run(rx));
        Harness { tx, table, events }
    }

    fn bulletin(id: &str, serial: u32, author: &str, mag: f64) -> RawBulletin {
        // Freshly published so neither the TTL nor the inactivity deadline
        // interferes with classification.
        let now_ms = chrono::Utc::now().timestamp_millis();
        serde_json::from_value(serde_json::json!({
            "id": id, "serial": serial, "final": 0, "author": author,
            "time": now_ms,
            "eq": {"lat": 24.0, "lon": 122.0, "depth": 40, "mag": mag, "time": now_ms}
        }))
        .expect("bulletin json")
    }

    async fn wait_for_events(events: &Recorded, count: usize) {
        for _ in 0..200 {
            {
                let events = events
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if events.len() >= count {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} events, never arrived");
    }

    fn snapshot(events: &Recorded) -> Vec<(EewEvent, String, u32)> {
        events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    #[tokio::test]
    async fn test_new_alert_over_http() {
        let harness = start_controller(ProviderFilter::default());

        harness
            .tx
            .send(IngestMessage::Snapshot(vec![bulletin("A", 1, "cwa", 6.0)]))
            .await
            .expect("send snapshot");
        wait_for_events(&harness.events, 1).await;

        assert_eq!(
            snapshot(&harness.events),
            vec![(EewEvent::Send, "A".to_string(), 1)]
        );
        let table = harness.table.lock().await;
        let alert = table.get("A").expect("alert tracked");
        assert_eq!(alert.serial, 1);
    }

    #[tokio::test]
    async fn test_update_then_lift() {
        let harness = start_controller(ProviderFilter::default());

        harness
            .tx
            .send(IngestMessage::Snapshot(vec![bulletin("A", 1, "cwa", 6.0)]))
            .await
            .expect("send snapshot");
        wait_for_events(&harness.events, 1).await;

        harness
            .tx
            .send(IngestMessage::Snapshot(vec![bulletin("A", 2, "cwa", 6.2)]))
            .await
            .expect("send snapshot");
        wait_for_events(&harness.events, 2).await;

        // Empty snapshot lifts the tracked alert.
        harness
            .tx
            .send(IngestMessage::Snapshot(vec![]))
            .await
            .expect("send snapshot");
        wait_for_events(&harness.events, 3).await;

        assert_eq!(
            snapshot(&harness.events),
            vec![
                (EewEvent::Send, "A".to_string(), 1),
                (EewEvent::Update, "A".to_string(), 2),
                (EewEvent::Lift, "A".to_string(), 2),
            ]
        );
        assert!(harness.table.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_are_silent() {
        let harness = start_controller(ProviderFilter::default());

        for serial in [2, 2, 1] {
            harness
                .tx
                .send(IngestMessage::Bulletin(bulletin("A", serial, "cwa", 6.0)))
                .await
                .expect("send bulletin");
        }
        wait_for_events(&harness.events, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Only the first serial-2 bulletin dispatched anything.
        assert_eq!(
            snapshot(&harness.events),
            vec![(EewEvent::Send, "A".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_no_events_after_lift_for_replays() {
        let harness = start_controller(ProviderFilter::default());

        harness
            .tx
            .send(IngestMessage::Snapshot(vec![bulletin("A", 2, "cwa", 6.0)]))
            .await
            .expect("send snapshot");
        wait_for_events(&harness.events, 1).await;

        harness
            .tx
            .send(IngestMessage::Snapshot(vec![]))
            .await
            .expect("send snapshot");
        wait_for_events(&harness.events, 2).await;

        // A replayed serial after the lift stays silent.
        harness
            .tx
            .send(IngestMessage::Snapshot(vec![bulletin("A", 2, "cwa", 6.0)]))
            .await
            .expect("send snapshot");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(snapshot(&harness.events).len(), 2);
    }

    #[tokio::test]
    async fn test_provider_filter_drops_before_classification() {
        let filter: ProviderFilter = toml::from_str("cwa = true\ntrem = false\n")
            .expect("filter toml");
        let harness = start_controller(filter);

        harness
            .tx
            .send(IngestMessage::Snapshot(vec![
                bulletin("T", 1, "trem", 5.0),
                bulletin("A", 1, "cwa", 6.0),
            ]))
            .await
            .expect("send snapshot");
        wait_for_events(&harness.events, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            snapshot(&harness.events),
            vec![(EewEvent::Send, "A".to_string(), 1)]
        );
        assert!(harness.table.lock().await.get("T").is_none());
    }

    #[tokio::test]
    async fn test_computation_publishes_result() {
        let harness = start_controller(ProviderFilter::default());

        harness
            .tx
            .send(IngestMessage::Bulletin(bulletin("A", 1, "cwa", 6.5)))
            .await
            .expect("send bulletin");
        wait_for_events(&harness.events, 1).await;

        let alert = {
            let table = harness.table.lock().await;
            Arc::clone(table.get("A").expect("alert tracked"))
        };
        match alert.computed().await {
            ComputeState::Done(map) => {
                assert_eq!(map.by_region.len(), 2);
                assert!(map.city_max.contains_key("花蓮縣"));
            }
            other => panic!("expected finished computation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_bulletin_dropped() {
        let harness = start_controller(ProviderFilter::default());

        let mut bad = bulletin("A", 1, "cwa", 6.0);
        bad.eq.lat = 99.0;
        harness
            .tx
            .send(IngestMessage::Snapshot(vec![bad, bulletin("B", 1, "cwa", 5.5)]))
            .await
            .expect("send snapshot");
        wait_for_events(&harness.events, 1).await;

        assert_eq!(
            snapshot(&harness.events),
            vec![(EewEvent::Send, "B".to_string(), 1)]
        );
    }
}
