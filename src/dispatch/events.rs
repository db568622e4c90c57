use std::ops::ControlFlow;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::models::{Carrier, CarrierId, CheckpointId};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before dropping the subscriber.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Event types ──────────────────────────────────────────────────────

/// Live dispatch notification. Not persisted; late subscribers miss it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DispatchEvent {
    CarrierPicked {
        carrier: Carrier,
        at: DateTime<Utc>,
    },
    CheckpointCleared {
        checkpoint: CheckpointId,
        carriers: Vec<CarrierId>,
        at: DateTime<Utc>,
    },
    CarrierMoved {
        carrier: Carrier,
        destination: CheckpointId,
        at: DateTime<Utc>,
    },
    CarrierStored {
        carrier_id: CarrierId,
        at: DateTime<Utc>,
    },
    CarriersStranded {
        carriers: Vec<CarrierId>,
        error: String,
        at: DateTime<Utc>,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler_with_sender(
    ws: WebSocketUpgrade,
    tx: broadcast::Sender<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, tx))
}

async fn handle_socket(socket: WebSocket, tx: broadcast::Sender<String>) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    run_socket_loop(sender, receiver, rx).await;
}

/// Forward broadcast events to one subscriber until either side goes away.
///
/// A Ping goes out every [`PING_INTERVAL`]. The first unanswered Ping arms a
/// deadline [`PONG_TIMEOUT`] out; any Pong disarms it, and a keepalive tick
/// past the deadline drops the subscriber.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut keepalive = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let flow = tokio::select! {
            _ = keepalive.tick() => send_ping(&mut sender, &mut pong_deadline).await,
            event = rx.recv() => forward_event(&mut sender, event).await,
            frame = receiver.next() => handle_frame(frame, &mut pong_deadline),
        };
        if flow.is_break() {
            break;
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

async fn send_ping(
    sender: &mut SplitSink<WebSocket, Message>,
    pong_deadline: &mut Option<Instant>,
) -> ControlFlow<()> {
    if pong_overdue(*pong_deadline, Instant::now()) {
        debug!("event subscriber stopped answering pings");
        return ControlFlow::Break(());
    }
    if sender.send(Message::Ping(Default::default())).await.is_err() {
        return ControlFlow::Break(());
    }
    pong_deadline.get_or_insert_with(|| Instant::now() + PONG_TIMEOUT);
    ControlFlow::Continue(())
}

async fn forward_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: Result<String, broadcast::error::RecvError>,
) -> ControlFlow<()> {
    match event {
        Ok(json) => match sender.send(Message::Text(json.into())).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        },
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            warn!(skipped, "event subscriber lagged");
            ControlFlow::Continue(())
        }
        Err(broadcast::error::RecvError::Closed) => ControlFlow::Break(()),
    }
}

fn handle_frame(
    frame: Option<Result<Message, axum::Error>>,
    pong_deadline: &mut Option<Instant>,
) -> ControlFlow<()> {
    match frame {
        Some(Ok(Message::Pong(_))) => {
            *pong_deadline = None;
            ControlFlow::Continue(())
        }
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => ControlFlow::Break(()),
        // Subscribers are read-only.
        Some(Ok(_)) => ControlFlow::Continue(()),
    }
}

fn pong_overdue(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|d| now >= d)
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast an event. Silent when nobody is subscribed.
pub fn broadcast_event(tx: &broadcast::Sender<String>, event: &DispatchEvent) {
    match serde_json::to_string(event) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize dispatch event");
        }
    }
}
