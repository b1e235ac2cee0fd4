//! WebSocket fan-out bridge: multiplexes the `features`, `forecasts`,
//! `chconfigs`, and `commands` topics into a single `{type, payload}` event
//! stream per connected client.
//!
//! Grounded on the `helix_bridge` client/converter pair's "subscribe one
//! side, convert, push to the other side" shape, adapted from HTTP polling
//! to a broadcast-fed WebSocket push since every upstream topic here is
//! already a `tokio::sync::broadcast` channel.

use std::net::SocketAddr;

use futures_util::SinkExt;
use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::bus::Topics;

/// The `type` discriminant of a dashboard event, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardEventType {
    FeatureUpdate,
    ForecastUpdate,
    OptimizerPlan,
    CommandStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardEvent {
    #[serde(rename = "type")]
    pub event_type: DashboardEventType,
    pub payload: Value,
}

pub struct DashboardBridge {
    topics: Topics,
}

impl DashboardBridge {
    pub fn new(topics: Topics) -> Self {
        DashboardBridge { topics }
    }

    /// Accept WebSocket connections on `addr` until `shutdown` fires. Each
    /// connection gets its own fan-out task fed by fresh subscriptions to
    /// all four topics.
    pub async fn run(self, addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(target: "meshplane::dashboard", error = %e, "failed to bind dashboard listener");
                return;
            }
        };
        info!(target: "meshplane::dashboard", %addr, "dashboard bridge listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(target: "meshplane::dashboard", "shutdown received, exiting accept loop");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let topics = self.topics.clone();
                            let client_shutdown = shutdown.resubscribe();
                            tokio::spawn(async move {
                                serve_client(stream, peer, topics, client_shutdown).await;
                            });
                        }
                        Err(e) => {
                            warn!(target: "meshplane::dashboard", error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    topics: Topics,
    mut shutdown: broadcast::Receiver<()>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(target: "meshplane::dashboard", %peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    let (mut sink, _stream) = futures_util::StreamExt::split(ws);

    let mut features = topics.features.subscribe();
    let mut forecasts = topics.forecasts.subscribe();
    let mut chconfigs = topics.chconfigs.subscribe();
    let mut commands = topics.commands.subscribe();

    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => break,
            recv = features.recv() => match recv {
                Ok(f) => DashboardEvent {
                    event_type: DashboardEventType::FeatureUpdate,
                    payload: serde_json::to_value(&f).unwrap_or(Value::Null),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(target: "meshplane::dashboard", %peer, skipped = n, "features lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            recv = forecasts.recv() => match recv {
                Ok(f) => DashboardEvent {
                    event_type: DashboardEventType::ForecastUpdate,
                    payload: serde_json::to_value(&f).unwrap_or(Value::Null),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(target: "meshplane::dashboard", %peer, skipped = n, "forecasts lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            recv = chconfigs.recv() => match recv {
                Ok(c) => DashboardEvent {
                    event_type: DashboardEventType::OptimizerPlan,
                    payload: serde_json::to_value(&c).unwrap_or(Value::Null),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(target: "meshplane::dashboard", %peer, skipped = n, "chconfigs lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            recv = commands.recv() => match recv {
                Ok(c) => DashboardEvent {
                    event_type: DashboardEventType::CommandStatus,
                    payload: serde_json::to_value(&c).unwrap_or(Value::Null),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(target: "meshplane::dashboard", %peer, skipped = n, "commands lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let text = match serde_json::to_string(&event) {
            Ok(t) => t,
            Err(e) => {
                warn!(target: "meshplane::dashboard", error = %e, "failed to serialize dashboard event");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            debug!(target: "meshplane::dashboard", %peer, "client disconnected");
            break;
        }
    }
}
