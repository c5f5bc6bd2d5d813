//! Console notifier: renders alert transitions into the structured log.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::eew::{Alert, ComputeState};
use crate::errors::EewcastError;
use crate::notify::{Notifier, NotifierDescriptor};

const NAMESPACE: &str = "console";

/// Descriptor for the `[console]` config section.
#[must_use]
pub fn descriptor() -> NotifierDescriptor {
    NotifierDescriptor {
        namespace: NAMESPACE,
        register,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn register(section: &toml::Table) -> Result<Option<Arc<dyn Notifier>>, EewcastError> {
    let enabled = section
        .get("enabled")
        .and_then(toml::Value::as_bool)
        .unwrap_or(true);
    if !enabled {
        return Ok(None);
    }

    let max_cities = section
        .get("max-cities")
        .and_then(toml::Value::as_integer)
        .unwrap_or(5)
        .clamp(1, 64) as usize;
    Ok(Some(Arc::new(ConsoleNotifier { max_cities })))
}

/// Logs each transition, with the strongest cities once the computation lands.
pub struct ConsoleNotifier {
    max_cities: usize,
}

impl ConsoleNotifier {
    async fn log_expected(&self, alert: &Alert) {
        match alert.computed().await {
            ComputeState::Done(map) => {
                let mut cities: Vec<_> = map.city_max.values().collect();
                cities.sort_by(|a, b| {
                    b.intensity.value().total_cmp(&a.intensity.value())
                });
                for entry in cities.iter().take(self.max_cities) {
                    info!(
                        "  {}: intensity {} (S-wave {})",
                        entry.region.city,
                        entry.intensity,
                        entry.distance.s_arrival.format("%H:%M:%S"),
                    );
                }
            }
            ComputeState::Failed(reason) => {
                warn!("alert {} has no expected intensity: {reason}", alert.id);
            }
            ComputeState::Pending => {}
        }
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn name(&self) -> &str {
        NAMESPACE
    }

    async fn send_eew(&self, alert: &Alert) -> Result<(), EewcastError> {
        info!(
            "[{}] alert {} serial {}: M{} at {}",
            alert.provider_display(),
            alert.id,
            alert.serial,
            alert.earthquake.magnitude,
            alert.earthquake.epicenter.describe(),
        );
        self.log_expected(alert).await;
        Ok(())
    }

    async fn update_eew(&self, alert: &Alert) -> Result<(), EewcastError> {
        info!(
            "[{}] alert {} revised to serial {}: M{}",
            alert.provider_display(),
            alert.id,
            alert.serial,
            alert.earthquake.magnitude,
        );
        self.log_expected(alert).await;
        Ok(())
    }

    async fn lift_eew(&self, alert: &Alert) -> Result<(), EewcastError> {
        info!("[{}] alert {} lifted", alert.provider_display(), alert.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_defaults() {
        let section = toml::Table::new();
        let notifier = register(&section).expect("register should succeed");
        assert!(notifier.is_some());
    }

    #[test]
    fn test_register_disabled() {
        let section: toml::Table = toml::from_str("enabled = false").expect("toml");
        let notifier = register(&section).expect("register should succeed");
        assert!(notifier.is_none());
    }
}
