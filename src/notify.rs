//! Notifier capability set, registry and fan-out dispatch.
//!
//! Notifiers are registered from a static descriptor list at startup;
//! configuration selects which are enabled. Dispatch is fire-and-forget: each
//! event to each notifier runs in its own task, so a slow or failing sink can
//! never stall ingest or its peers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::eew::Alert;
use crate::errors::EewcastError;

/// Alert lifecycle transitions delivered to notifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EewEvent {
    Send,
    Update,
    Lift,
}

impl EewEvent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Update => "update",
            Self::Lift => "lift",
        }
    }
}

/// A downstream alert sink.
///
/// Every method has a no-op default so implementations only provide the
/// capabilities they actually have. Errors are logged and swallowed by the
/// dispatcher.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Stable name used in logs.
    fn name(&self) -> &str;

    /// One-shot cooperative startup; may connect, authenticate, etc.
    async fn start(&self) -> Result<(), EewcastError> {
        Ok(())
    }

    /// Called once when an alert is first seen.
    async fn send_eew(&self, _alert: &Alert) -> Result<(), EewcastError> {
        Ok(())
    }

    /// Called for each later revision of an alert.
    async fn update_eew(&self, _alert: &Alert) -> Result<(), EewcastError> {
        Ok(())
    }

    /// Called when an alert ends.
    async fn lift_eew(&self, _alert: &Alert) -> Result<(), EewcastError> {
        Ok(())
    }

    /// Graceful teardown, awaited with a bounded grace period at shutdown.
    async fn close(&self) -> Result<(), EewcastError> {
        Ok(())
    }
}

/// One registrable notifier kind.
pub struct NotifierDescriptor {
    /// Top-level config key that enables this notifier
    pub namespace: &'static str,
    /// Factory from that config section; `Ok(None)` declines registration
    pub register: fn(&toml::Table) -> Result<Option<Arc<dyn Notifier>>, EewcastError>,
}

/// The set of enabled notifiers.
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    /// Register every descriptor whose config section is present.
    #[must_use]
    pub fn discover(config: &Config, descriptors: &[NotifierDescriptor]) -> Self {
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        for descriptor in descriptors {
            let Some(section) = config.section(descriptor.namespace) else {
                warn!(
                    "no `{}` config section, notifier disabled",
                    descriptor.namespace
                );
                continue;
            };
            match (descriptor.register)(section) {
                Ok(Some(notifier)) => {
                    debug!("registered notifier `{}`", notifier.name());
                    notifiers.push(notifier);
                }
                Ok(None) => {
                    debug!(
                        "`{}` register declined, notifier skipped",
                        descriptor.namespace
                    );
                }
                Err(e) => {
                    warn!("failed to register `{}`: {e}", descriptor.namespace);
                }
            }
        }
        Self { notifiers }
    }

    /// Build a set directly from notifier instances.
    #[must_use]
    pub fn from_notifiers(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Run every notifier's startup hook concurrently, swallowing errors.
    pub async fn start_all(&self) {
        let results = join_all(self.notifiers.iter().map(|n| n.start())).await;
        for (notifier, result) in self.notifiers.iter().zip(results) {
            if let Err(e) = result {
                error!("notifier `{}` failed to start: {e}", notifier.name());
            }
        }
    }

    /// Deliver one event to every notifier, each in its own task.
    ///
    /// Returns as soon as every delivery is scheduled; completion is never
    /// awaited on the ingest path.
    pub fn dispatch(&self, event: EewEvent, alert: &Arc<Alert>) {
        for notifier in &self.notifiers {
            let notifier = Arc::clone(notifier);
            let alert = Arc::clone(alert);
            tokio::spawn(async move {
                let result = match event {
                    EewEvent::Send => notifier.send_eew(&alert).await,
                    EewEvent::Update => notifier.update_eew(&alert).await,
                    EewEvent::Lift => notifier.lift_eew(&alert).await,
                };
                if let Err(e) = result {
                    error!(
                        "notifier `{}` failed on {} for alert {}: {e}",
                        notifier.name(),
                        event.as_str(),
                        alert.id
                    );
                }
            });
        }
    }

    /// Await every notifier's close hook, bounded by `grace`.
    pub async fn close_all(&self, grace: Duration) {
        let teardown = join_all(self.notifiers.iter().map(|n| n.close()));
        match tokio::time::timeout(grace, teardown).await {
            Ok(results) => {
                for (notifier, result) in self.notifiers.iter().zip(results) {
                    if let Err(e) = result {
                        warn!("notifier `{}` failed to close: {e}", notifier.name());
                    }
                }
            }
            Err(_) => warn!("notifier close hooks exceeded the {grace:?} grace period"),
        }
    }
}
