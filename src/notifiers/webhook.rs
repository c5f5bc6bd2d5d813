//! Webhook notifier: POSTs alert transitions as JSON to a configured URL.
//!
//! The notifier owns its HTTP client; the core only sees the capability set.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::eew::{Alert, ComputeState};
use crate::errors::EewcastError;
use crate::notify::{EewEvent, Notifier, NotifierDescriptor};

const NAMESPACE: &str = "webhook";

/// Default request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// How many cities the payload lists, strongest first.
const MAX_PAYLOAD_CITIES: usize = 8;

/// Descriptor for the `[webhook]` config section.
#[must_use]
pub fn descriptor() -> NotifierDescriptor {
    NotifierDescriptor {
        namespace: NAMESPACE,
        register,
    }
}

fn register(section: &toml::Table) -> Result<Option<Arc<dyn Notifier>>, EewcastError> {
    let Some(url) = section.get("url").and_then(toml::Value::as_str) else {
        return Err(EewcastError::Config("webhook.url is required".into()));
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .user_agent(concat!("eewcast/", env!("CARGO_PKG_VERSION")))
        .build()?;

    Ok(Some(Arc::new(WebhookNotifier {
        client,
        url: url.to_string(),
    })))
}

/// Delivers alert transitions to one webhook endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Build the JSON payload for one transition.
    ///
    /// A failed or cancelled computation yields a degraded payload without
    /// the `expected` block.
    fn payload(event: EewEvent, alert: &Alert, state: &ComputeState) -> serde_json::Value {
        let eq = &alert.earthquake;
        let mut payload = serde_json::json!({
            "event": event.as_str(),
            "id": alert.id.clone(),
            "serial": alert.serial,
            "final": alert.final_report,
            "provider": alert.provider.clone(),
            "provider_display": alert.provider_display(),
            "publish_time": alert.publish_time.to_rfc3339(),
            "origin_time": eq.origin_time.to_rfc3339(),
            "magnitude": eq.magnitude,
            "depth_km": eq.depth_km,
            "epicenter": {
                "lon": eq.epicenter.location.lon,
                "lat": eq.epicenter.location.lat,
                "description": eq.epicenter.display_name.clone(),
            },
            "max_intensity": eq.max_intensity.map(|i| i.label()),
        });

        if let ComputeState::Done(map) = state {
            let mut cities: Vec<_> = map.city_max.values().collect();
            cities.sort_by(|a, b| b.intensity.value().total_cmp(&a.intensity.value()));
            let expected: Vec<serde_json::Value> = cities
                .iter()
                .take(MAX_PAYLOAD_CITIES)
                .map(|entry| {
                    serde_json::json!({
                        "city": entry.region.city.clone(),
                        "intensity": entry.intensity.label(),
                        "bucket": entry.intensity.bucket(),
                        "p_arrival": entry.distance.p_arrival.to_rfc3339(),
                        "s_arrival": entry.distance.s_arrival.to_rfc3339(),
                    })
                })
                .collect();
            payload["expected"] = serde_json::Value::Array(expected);
        }

        payload
    }

    async fn deliver(&self, event: EewEvent, alert: &Alert) -> Result<(), EewcastError> {
        let state = alert.computed().await;
        let payload = Self::payload(event, alert, &state);

        let response = self.client.post(&self.url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EewcastError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        debug!("webhook delivered {} for alert {}", event.as_str(), alert.id);
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        NAMESPACE
    }

    async fn send_eew(&self, alert: &Alert) -> Result<(), EewcastError> {
        self.deliver(EewEvent::Send, alert).await
    }

    async fn update_eew(&self, alert: &Alert) -> Result<(), EewcastError> {
        self.deliver(EewEvent::Update, alert).await
    }

    async fn lift_eew(&self, alert: &Alert) -> Result<(), EewcastError> {
        self.deliver(EewEvent::Lift, alert).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tests::make_alert;

    #[test]
    fn test_register_requires_url() {
        let section = toml::Table::new();
        assert!(register(&section).is_err());

        let section: toml::Table =
            toml::from_str("url = \"https://example.invalid/hook\"").expect("toml");
        assert!(register(&section).expect("register").is_some());
    }

    #[test]
    fn test_degraded_payload_omits_expected() {
        let alert = make_alert("A", 1);
        let payload = WebhookNotifier::payload(
            EewEvent::Send,
            &alert,
            &ComputeState::Failed("cancelled".into()),
        );

        assert_eq!(payload["event"], "send");
        assert_eq!(payload["id"], "A");
        assert_eq!(payload["serial"], 1);
        assert!(payload.get("expected").is_none());
    }
}
