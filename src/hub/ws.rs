use axum::{
    body::Bytes,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::api::SharedState;
use crate::config::WsConfig;
use crate::hub::{Envelope, EventKind, ProgressHub, Subscription};

/// Upgrade handler for `GET /ws/tasks/{id}`.
///
/// Subscribing to an id that does not exist (yet) is allowed; the
/// connection simply receives keepalives until events show up.
pub async fn task_ws_handler(
    Path(task_id): Path<String>,
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, task_id))
}

async fn handle_socket(socket: WebSocket, state: SharedState, task_id: String) {
    let subscription = state.hub.register(&task_id);
    debug!(task_id = %task_id, subscriber_id = subscription.id, "websocket connected");
    run_socket_loop(
        socket,
        Arc::clone(&state.hub),
        subscription,
        state.ws_config.clone(),
    )
    .await;
}

/// Core connection loop: forwards hub events, keeps the connection alive
/// with periodic pings, and answers client JSON `ping` envelopes with
/// `pong`. Exits when the peer goes quiet past the pong timeout, the hub
/// drops the subscription, or the transport errors.
async fn run_socket_loop(
    socket: WebSocket,
    hub: Arc<ProgressHub>,
    mut subscription: Subscription,
    cfg: WsConfig,
) {
    let (mut sender, mut receiver): (SplitSink<WebSocket, Message>, SplitStream<WebSocket>) =
        socket.split();

    // Tell the client which task it is bound to before any events flow.
    if let Ok(hello) = serde_json::to_string(&Envelope::system(&subscription.task_id, "subscribed"))
        && sender.send(Message::Text(hello.into())).await.is_err()
    {
        hub.unregister(subscription.id);
        return;
    }

    let mut ping_interval = tokio::time::interval(cfg.ping_interval());
    // The first tick completes immediately; consume it so the first real
    // ping fires one full interval in.
    ping_interval.tick().await;

    let mut last_activity = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic keepalive ──────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_activity.elapsed() > cfg.pong_timeout() {
                    debug!(subscriber_id = subscription.id, "websocket missed keepalive, closing");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Hub event forwarding ────────────────────────────────
            event = subscription.rx.recv() => {
                match event {
                    Some(payload) => {
                        if sender.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    // Hub dropped us (unregistered or buffer overflow).
                    None => break,
                }
            }

            // ── Client messages ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        awaiting_pong = false;
                        if is_client_ping(text.as_str())
                            && let Ok(pong) = serde_json::to_string(&Envelope::pong())
                            && sender.send(Message::Text(pong.into())).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Binary(_))) => {
                        // Protocol pings are answered by the transport;
                        // either way the peer is alive.
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    hub.unregister(subscription.id);
    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
    debug!(subscriber_id = subscription.id, "websocket closed");
}

/// True when an inbound text frame is an application-level ping envelope.
fn is_client_ping(text: &str) -> bool {
    serde_json::from_str::<Envelope>(text)
        .map(|env| env.kind == EventKind::Ping)
        .unwrap_or(false)
}
