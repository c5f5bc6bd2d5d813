//! WebSocket subscription session.
//!
//! One session owns one connection to a chosen node: it dials, authorizes
//! with the subscribe frame, then pumps typed frames into the event sink
//! until a terminal signal. The session never calls back into its owner; the
//! sink channel is handed in at construction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::models::{RawBulletin, ServerFrame, SubscribeFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Authorization must be answered within this window.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(60);

/// A subscribed session exceeding this receive silence reconnects.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection establishment deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before re-subscribing after an info 503.
const SERVICE_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Consecutive malformed frames tolerated before reconnecting.
const MAX_PROTOCOL_VIOLATIONS: u32 = 5;

/// Typed events a session emits.
#[derive(Debug)]
pub enum WsEvent {
    /// A decoded EEW bulletin for the ingest controller
    Eew(RawBulletin),
    /// Server clock sample for skew observers
    Ntp(serde_json::Value),
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Transient failure; the supervisor should re-dial after its delay
    Reconnect { reopen: bool, reason: String },
    /// Credentials rejected; terminal for WebSocket mode
    AuthFailed(String),
    /// Shutdown was requested
    Shutdown,
}

/// What an `info` code during authorization means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthDecision {
    Accept,
    Reconnect { reopen: bool, reason: &'static str },
    Fail(&'static str),
    KeepWaiting,
}

fn auth_decision(code: u16) -> AuthDecision {
    match code {
        200 => AuthDecision::Accept,
        400 => AuthDecision::Reconnect {
            reopen: true,
            reason: "API key already in use",
        },
        429 => AuthDecision::Reconnect {
            reopen: true,
            reason: "rate limit exceeded",
        },
        401 => AuthDecision::Fail("invalid API key"),
        403 => AuthDecision::Fail("membership expired"),
        _ => AuthDecision::KeepWaiting,
    }
}

/// Frame handling failures inside the subscribed loop.
enum HandleError {
    /// Malformed frame; counted, the connection survives
    Violation(String),
    /// The socket itself failed while replying
    Transport(String),
}

/// A stateful connection to one WebSocket node.
pub struct WsSession {
    url: String,
    subscribe: SubscribeFrame,
    events: mpsc::Sender<WsEvent>,
    shutdown: CancellationToken,
    subscribed: AtomicBool,
}

impl WsSession {
    #[must_use]
    pub fn new(
        url: String,
        subscribe: SubscribeFrame,
        events: mpsc::Sender<WsEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            url,
            subscribe,
            events,
            shutdown,
            subscribed: AtomicBool::new(false),
        }
    }

    /// Whether the session reached the subscribed state at least once.
    ///
    /// The supervisor uses this to reset its reconnect delay.
    #[must_use]
    pub fn was_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Relaxed)
    }

    /// Dial, authorize, then pump frames until a terminal signal.
    pub async fn run(&self) -> SessionEnd {
        debug!("connecting to {}", self.url);
        let mut stream =
            match tokio::time::timeout(DIAL_TIMEOUT, connect_async(self.url.as_str())).await {
                Err(_) => {
                    return SessionEnd::Reconnect {
                        reopen: false,
                        reason: "dial timeout".into(),
                    };
                }
                Ok(Err(e)) => {
                    return SessionEnd::Reconnect {
                        reopen: false,
                        reason: format!("dial failed: {e}"),
                    };
                }
                Ok(Ok((stream, _response))) => stream,
            };

        let services = match self.authorize(&mut stream).await {
            Ok(services) => services,
            Err(end) => return end,
        };
        self.subscribed.store(true, Ordering::Relaxed);
        info!(
            "EEW WebSocket is ready\n\
             --------------------------------------------------\n\
             Subscribed services: {}\n\
             --------------------------------------------------",
            services.join(", ")
        );

        let end = self.pump(&mut stream).await;
        if matches!(end, SessionEnd::Reconnect { reopen: true, .. }) {
            let _ = stream.close(None).await;
        }
        end
    }

    /// Send the subscribe frame and wait for the accepting `info`.
    async fn authorize(&self, stream: &mut WsStream) -> Result<Vec<String>, SessionEnd> {
        if let Err(e) = self.send_subscribe(stream).await {
            return Err(SessionEnd::Reconnect {
                reopen: false,
                reason: format!("subscribe failed: {e}"),
            });
        }

        match tokio::time::timeout(AUTH_TIMEOUT, self.wait_for_accept(stream)).await {
            Err(_) => Err(SessionEnd::Reconnect {
                reopen: false,
                reason: "authorization timeout".into(),
            }),
            Ok(result) => result,
        }
    }

    async fn wait_for_accept(&self, stream: &mut WsStream) -> Result<Vec<String>, SessionEnd> {
        loop {
            let message = tokio::select! {
                () = self.shutdown.cancelled() => return Err(SessionEnd::Shutdown),
                message = stream.next() => message,
            };

            let raw = match message {
                None => {
                    return Err(SessionEnd::Reconnect {
                        reopen: true,
                        reason: "closed during authorization".into(),
                    });
                }
                Some(Err(e)) => {
                    return Err(SessionEnd::Reconnect {
                        reopen: false,
                        reason: format!("transport error during authorization: {e}"),
                    });
                }
                Some(Ok(Message::Text(raw))) => raw,
                Some(Ok(_)) => continue,
            };

            let Ok(ServerFrame::Info { data }) = serde_json::from_str::<ServerFrame>(&raw)
            else {
                trace!("ignoring frame before authorization: {raw}");
                continue;
            };

            match auth_decision(data.code) {
                AuthDecision::Accept => return Ok(data.list.unwrap_or_default()),
                AuthDecision::Reconnect { reopen, reason } => {
                    return Err(SessionEnd::Reconnect {
                        reopen,
                        reason: reason.into(),
                    });
                }
                AuthDecision::Fail(reason) => {
                    let detail = data.message.unwrap_or_else(|| reason.to_string());
                    return Err(SessionEnd::AuthFailed(detail));
                }
                AuthDecision::KeepWaiting => {
                    debug!("info code {} during authorization", data.code);
                }
            }
        }
    }

    /// Subscribed state: route frames until the connection degrades.
    async fn pump(&self, stream: &mut WsStream) -> SessionEnd {
        let mut violations = 0u32;
        loop {
            let message = tokio::select! {
                () = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                message = tokio::time::timeout(IDLE_TIMEOUT, stream.next()) => message,
            };

            match message {
                Err(_) => {
                    return SessionEnd::Reconnect {
                        reopen: false,
                        reason: format!("no frame for {IDLE_TIMEOUT:?}"),
                    };
                }
                Ok(None) => {
                    return SessionEnd::Reconnect {
                        reopen: true,
                        reason: "connection closed by server".into(),
                    };
                }
                Ok(Some(Err(e))) => {
                    return SessionEnd::Reconnect {
                        reopen: true,
                        reason: format!("transport error: {e}"),
                    };
                }
                Ok(Some(Ok(Message::Text(raw)))) => {
                    match self.handle_frame(stream, &raw).await {
                        Ok(()) => violations = 0,
                        Err(HandleError::Violation(detail)) => {
                            warn!("protocol violation: {detail}");
                            violations += 1;
                            if violations >= MAX_PROTOCOL_VIOLATIONS {
                                return SessionEnd::Reconnect {
                                    reopen: true,
                                    reason: "repeated protocol violations".into(),
                                };
                            }
                        }
                        Err(HandleError::Transport(detail)) => {
                            return SessionEnd::Reconnect {
                                reopen: true,
                                reason: detail,
                            };
                        }
                    }
                }
                // Binary frames are reserved, currently ignored.
                Ok(Some(Ok(Message::Binary(_)))) => {}
                Ok(Some(Ok(Message::Close(_)))) => {
                    return SessionEnd::Reconnect {
                        reopen: true,
                        reason: "server close frame".into(),
                    };
                }
                // Ping/pong are answered by the transport layer.
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    async fn handle_frame(&self, stream: &mut WsStream, raw: &str) -> Result<(), HandleError> {
        let frame: ServerFrame = serde_json::from_str(raw)
            .map_err(|e| HandleError::Violation(format!("unparseable frame: {e}")))?;

        match frame {
            ServerFrame::Info { data } if data.code == 503 => {
                warn!("service temporarily rejected the subscription, retrying");
                tokio::time::sleep(SERVICE_RETRY_PAUSE).await;
                self.send_subscribe(stream)
                    .await
                    .map_err(HandleError::Transport)?;
            }
            ServerFrame::Info { data } => {
                debug!("info frame code {}", data.code);
            }
            ServerFrame::Verify {} => {
                self.send_subscribe(stream)
                    .await
                    .map_err(HandleError::Transport)?;
            }
            ServerFrame::Ntp { time, version } => {
                let sample = serde_json::json!({ "time": time, "version": version });
                let _ = self.events.send(WsEvent::Ntp(sample)).await;
            }
            ServerFrame::Data { time, data } => {
                let mut inner = data;
                merge_outer_time(&mut inner, time);

                let inner_type = inner
                    .get("type")
                    .and_then(serde_json::Value::as_str)
                    .map(ToString::to_string);
                match inner_type.as_deref() {
                    Some("eew") => match serde_json::from_value::<RawBulletin>(inner) {
                        Ok(bulletin) => {
                            let _ = self.events.send(WsEvent::Eew(bulletin)).await;
                        }
                        Err(e) => warn!("dropping undecodable eew payload: {e}"),
                    },
                    Some(other) => trace!("ignoring data frame of type {other}"),
                    None => {
                        return Err(HandleError::Violation(
                            "data frame without inner type".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_subscribe(&self, stream: &mut WsStream) -> Result<(), String> {
        let payload = serde_json::to_string(&self.subscribe).map_err(|e| e.to_string())?;
        debug!("sending subscribe frame");
        stream
            .send(Message::Text(payload))
            .await
            .map_err(|e| e.to_string())
    }
}

/// Merge the envelope `time` into the inner payload before routing.
fn merge_outer_time(inner: &mut serde_json::Value, time: Option<i64>) {
    if let (serde_json::Value::Object(map), Some(time)) = (inner, time) {
        map.insert("time".into(), serde_json::Value::from(time));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_decision_codes() {
        assert_eq!(auth_decision(200), AuthDecision::Accept);
        assert_eq!(
            auth_decision(400),
            AuthDecision::Reconnect {
                reopen: true,
                reason: "API key already in use"
            }
        );
        assert_eq!(
            auth_decision(429),
            AuthDecision::Reconnect {
                reopen: true,
                reason: "rate limit exceeded"
            }
        );
        assert_eq!(auth_decision(401), AuthDecision::Fail("invalid API key"));
        assert_eq!(auth_decision(403), AuthDecision::Fail("membership expired"));
        assert_eq!(auth_decision(500), AuthDecision::KeepWaiting);
    }

    #[test]
    fn test_merge_outer_time() {
        let mut inner = serde_json::json!({"type": "eew", "id": "A"});
        merge_outer_time(&mut inner, Some(1_700_000_001_000));
        assert_eq!(inner["time"], 1_700_000_001_000_i64);

        // The envelope time wins over any inner one.
        let mut inner = serde_json::json!({"type": "eew", "time": 1});
        merge_outer_time(&mut inner, Some(2));
        assert_eq!(inner["time"], 2);

        // Missing envelope time leaves the payload untouched.
        let mut inner = serde_json::json!({"type": "eew", "time": 1});
        merge_outer_time(&mut inner, None);
        assert_eq!(inner["time"], 1);
    }

    #[tokio::test]
    async fn test_session_records_subscription_state() {
        let (tx, _rx) = mpsc::channel(8);
        let session = WsSession::new(
            "wss://lb-1.example/websocket".into(),
            SubscribeFrame::new("key".into(), vec![]),
            tx,
            CancellationToken::new(),
        );
        assert!(!session.was_subscribed());
    }
}
