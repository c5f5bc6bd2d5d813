//! Upstream API node pool.
//!
//! Keeps the ordered endpoint list with per-node latency estimates, switches
//! between nodes on failure, and serves JSON requests with bounded retries.
//! Uses reqwest with rustls for TLS.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use rand::Rng;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::config::ApiConfig;
use crate::errors::EewcastError;
use crate::models::RawBulletin;

/// Default request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Pause between retries after a node switch.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

/// User agent string for API requests.
const USER_AGENT: &str = concat!("eewcast/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
struct Node {
    url: String,
    latency_s: f64,
}

/// Node selection strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchMode {
    /// Rotate to the next node in latency order
    Next,
    /// Jump to the lowest-latency node
    Fastest,
    /// Pick a node uniformly at random
    Random,
    /// Use an explicit base URL
    Url(String),
}

/// Pool of upstream HTTP nodes plus the WebSocket endpoint list.
pub struct NodePool {
    client: reqwest::Client,
    nodes: Mutex<Vec<Node>>,
    current: AtomicUsize,
    ws_nodes: Vec<String>,
}

impl NodePool {
    /// Build the pool from the endpoint counts in the API config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn new(api: &ApiConfig) -> Result<Self, EewcastError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()?;

        let nodes = (1..=api.http_nodes)
            .map(|i| Node {
                url: format!("https://api-{i}.{}/api/v{}", api.domain, api.version),
                latency_s: f64::INFINITY,
            })
            .collect();
        let ws_nodes = (1..=api.ws_nodes)
            .map(|i| format!("wss://lb-{i}.{}/websocket", api.domain))
            .collect();

        Ok(Self {
            client,
            nodes: Mutex::new(nodes),
            current: AtomicUsize::new(0),
            ws_nodes,
        })
    }

    /// The WebSocket endpoint URLs.
    #[must_use]
    pub fn ws_nodes(&self) -> &[String] {
        &self.ws_nodes
    }

    /// Base URL of the node requests currently go to.
    #[must_use]
    pub fn current_url(&self) -> String {
        let nodes = self.lock();
        let idx = self.current.load(Ordering::Relaxed).min(nodes.len() - 1);
        nodes[idx].url.clone()
    }

    /// Measure every node in parallel and reorder the list by latency.
    ///
    /// Nodes that fail or answer non-2xx get infinite latency; ties keep
    /// their original order. The current node resets to the fastest.
    pub async fn probe(&self) {
        let urls: Vec<String> = self.lock().iter().map(|n| n.url.clone()).collect();
        let latencies = join_all(urls.iter().map(|url| self.probe_one(url))).await;

        let mut nodes: Vec<Node> = urls
            .into_iter()
            .zip(latencies)
            .map(|(url, latency_s)| Node { url, latency_s })
            .collect();
        sort_by_latency(&mut nodes);

        info!(
            "fastest API node: {} ({:.0} ms)",
            nodes[0].url,
            nodes[0].latency_s * 1000.0
        );
        *self.lock() = nodes;
        self.current.store(0, Ordering::Relaxed);
    }

    async fn probe_one(&self, base: &str) -> f64 {
        let start = Instant::now();
        match self.client.get(format!("{base}/eq/eew")).send().await {
            Ok(response) if response.status().is_success() => start.elapsed().as_secs_f64(),
            Ok(response) => {
                debug!("probe {base} answered {}", response.status());
                f64::INFINITY
            }
            Err(e) => {
                debug!("probe {base} failed: {e}");
                f64::INFINITY
            }
        }
    }

    /// Change the current node and return its base URL.
    pub fn switch(&self, mode: SwitchMode) -> String {
        let mut nodes = self.lock();
        let len = nodes.len();
        let idx = match mode {
            SwitchMode::Next => (self.current.load(Ordering::Relaxed) + 1) % len,
            SwitchMode::Fastest => 0,
            SwitchMode::Random => rand::thread_rng().gen_range(0..len),
            SwitchMode::Url(url) => match nodes.iter().position(|n| n.url == url) {
                Some(pos) => pos,
                None => {
                    nodes.push(Node {
                        url,
                        latency_s: f64::INFINITY,
                    });
                    len
                }
            },
        };
        self.current.store(idx, Ordering::Relaxed);
        let url = nodes[idx].url.clone();
        info!("switched to API node: {url}");
        url
    }

    /// Run a JSON request against the current node.
    ///
    /// On I/O, status or decode failure the pool rotates to the next node,
    /// waits one second and retries up to `retry` more times before the last
    /// error propagates.
    ///
    /// # Errors
    ///
    /// Returns the final typed failure once retries are exhausted.
    #[instrument(skip(self))]
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        retry: u32,
    ) -> Result<T, EewcastError> {
        let mut attempts_left = retry;
        loop {
            let url = format!("{}{}", self.current_url(), path);
            match self.try_once::<T>(method.clone(), &url).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!("{method} {url} failed: {e}");
                    self.switch(SwitchMode::Next);
                    if attempts_left == 0 {
                        return Err(e);
                    }
                    attempts_left -= 1;
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
            }
        }
    }

    async fn try_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
    ) -> Result<T, EewcastError> {
        let response = self.client.request(method, url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EewcastError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(response.json::<T>().await?)
    }

    /// Fetch the current EEW snapshot.
    ///
    /// Bulletins that fail to decode are dropped individually so one bad
    /// entry cannot poison the batch.
    ///
    /// # Errors
    ///
    /// Returns an error when the request itself fails after retries.
    pub async fn fetch_eew(&self, retry: u32) -> Result<Vec<RawBulletin>, EewcastError> {
        let raw: Vec<serde_json::Value> =
            self.request_json(Method::GET, "/eq/eew", retry).await?;

        let mut bulletins = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<RawBulletin>(value) {
                Ok(bulletin) => bulletins.push(bulletin),
                Err(e) => warn!("dropping undecodable bulletin: {e}"),
            }
        }
        Ok(bulletins)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Node>> {
        self.nodes.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Stable ascending sort; ties keep their original order.
fn sort_by_latency(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| {
        a.latency_s
            .partial_cmp(&b.latency_s)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_nodes(count: usize) -> NodePool {
        let api = ApiConfig {
            http_nodes: count,
            ..ApiConfig::default()
        };
        NodePool::new(&api).expect("pool")
    }

    #[test]
    fn test_node_urls() {
        let pool = pool_with_nodes(2);
        assert_eq!(pool.current_url(), "https://api-1.exptech.dev/api/v1");
        assert_eq!(
            pool.ws_nodes(),
            &[
                "wss://lb-1.exptech.dev/websocket".to_string(),
                "wss://lb-2.exptech.dev/websocket".to_string(),
                "wss://lb-3.exptech.dev/websocket".to_string(),
                "wss://lb-4.exptech.dev/websocket".to_string(),
            ]
        );
    }

    #[test]
    fn test_switch_modes() {
        let pool = pool_with_nodes(3);
        let first = pool.current_url();

        let second = pool.switch(SwitchMode::Next);
        assert_ne!(first, second);
        pool.switch(SwitchMode::Next);
        let wrapped = pool.switch(SwitchMode::Next);
        assert_eq!(wrapped, first, "rotation must wrap around");

        assert_eq!(pool.switch(SwitchMode::Fastest), first);

        let explicit = pool.switch(SwitchMode::Url("https://api-9.example/api/v1".into()));
        assert_eq!(explicit, "https://api-9.example/api/v1");
        assert_eq!(pool.current_url(), explicit);
    }

    #[test]
    fn test_sort_stable_on_ties() {
        let mut nodes = vec![
            Node { url: "d".into(), latency_s: f64::INFINITY },
            Node { url: "a".into(), latency_s: 0.2 },
            Node { url: "b".into(), latency_s: 0.2 },
            Node { url: "c".into(), latency_s: 0.1 },
        ];
        sort_by_latency(&mut nodes);

        let order: Vec<&str> = nodes.iter().map(|n| n.url.as_str()).collect();
        assert_eq!(order, ["c", "a", "b", "d"]);
    }
}
