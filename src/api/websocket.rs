use actix_web::{web, Error, HttpRequest, Responder};
use actix_ws::{Message, Session};
use futures_util::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;

use crate::api::AppState;
use crate::capture::scheduler::DeltaSlot;
use crate::models::delta::CaptureDelta;
use crate::models::state::PcapState;

// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Missed heartbeats before the client is dropped
const HEARTBEAT_GRACE: u32 = 3;

/// WebSocket message types that can be sent to clients
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsOutMessage<'a> {
    Delta { delta: &'a CaptureDelta },
    State { state: &'a PcapState },
    Ping { timestamp: i64 },
}

async fn send(session: &mut Session, msg: &WsOutMessage<'_>) -> Result<(), actix_ws::Closed> {
    match serde_json::to_string(msg) {
        Ok(json) => session.text(json).await,
        Err(e) => {
            warn!("Failed to serialize WebSocket message: {}", e);
            Ok(())
        }
    }
}

/// Stream deltas and state changes to one client.
///
/// Each connection has its own coalescing slot, so a slow client only falls
/// behind itself. Listeners are removed when the connection ends.
pub async fn ws_index(
    req: HttpRequest,
    body: web::Payload,
    state: web::Data<AppState>,
) -> Result<impl Responder, Error> {
    let addr = req
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!("WebSocket connection from: {}", addr);

    let (response, session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let hub = state.context.hub().clone();
    let deltas = DeltaSlot::persistent();
    let (state_tx, mut state_rx) = watch::channel(state.context.state());

    let delta_sub = {
        let deltas = deltas.clone();
        hub.on_delta(move |delta| {
            deltas.push(delta.clone());
        })
    };
    let state_sub = hub.on_state_change(move |current| {
        state_tx.send_replace(current.clone());
    });

    let context = state.context.clone();
    actix_web::rt::spawn(async move {
        let last_heartbeat = Arc::new(Mutex::new(Instant::now()));

        let initial = state_rx.borrow_and_update().clone();
        let mut session_for_initial = session.clone();
        if send(&mut session_for_initial, &WsOutMessage::State { state: &initial })
            .await
            .is_err()
        {
            hub.unsubscribe(delta_sub);
            hub.unsubscribe(state_sub);
            return;
        }

        let ws_msg_task = {
            let mut session = session.clone();
            let last_heartbeat = last_heartbeat.clone();

            async move {
                while let Some(Ok(msg)) = msg_stream.next().await {
                    match msg {
                        Message::Ping(bytes) => {
                            *last_heartbeat.lock() = Instant::now();
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Pong(_) => *last_heartbeat.lock() = Instant::now(),
                        Message::Text(text) => {
                            debug!("Received text message: {}", text);
                            *last_heartbeat.lock() = Instant::now();

                            if text.trim() == "state" {
                                let current = context.state();
                                if send(&mut session, &WsOutMessage::State { state: &current })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                        }
                        Message::Close(_) => {
                            info!("Client requested close");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        };

        let delta_task = {
            let mut session = session.clone();
            let deltas = deltas.clone();

            async move {
                while let Some(delta) = deltas.recv().await {
                    if send(&mut session, &WsOutMessage::Delta { delta: &delta }).await.is_err() {
                        break;
                    }
                }
            }
        };

        let state_task = {
            let mut session = session.clone();

            async move {
                while state_rx.changed().await.is_ok() {
                    let current = state_rx.borrow_and_update().clone();
                    if send(&mut session, &WsOutMessage::State { state: &current })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        };

        let heartbeat_task = {
            let mut session = session.clone();

            async move {
                let mut heartbeat = interval(HEARTBEAT_INTERVAL);
                loop {
                    heartbeat.tick().await;

                    if last_heartbeat.lock().elapsed() > HEARTBEAT_INTERVAL * HEARTBEAT_GRACE {
                        warn!("WebSocket client heartbeat timed out");
                        let _ = session.clone().close(None).await;
                        break;
                    }

                    if session.ping(b"").await.is_err() {
                        break;
                    }
                    let ping = WsOutMessage::Ping {
                        timestamp: chrono::Utc::now().timestamp(),
                    };
                    if send(&mut session, &ping).await.is_err() {
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = ws_msg_task => {},
            _ = delta_task => {},
            _ = state_task => {},
            _ = heartbeat_task => {},
        }

        hub.unsubscribe(delta_sub);
        hub.unsubscribe(state_sub);
        deltas.close(None);
        let _ = session.close(None).await;
        info!("WebSocket connection from {} closed", addr);
    });

    Ok(response)
}
