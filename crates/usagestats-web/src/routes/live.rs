//! Live snapshot push.
//!
//! `GET /fetchStats/:token/live` upgrades to a WebSocket after the same token
//! check as the history endpoint. The token is checked before the upgrade
//! headers, so a bad token is a 404 whether or not the client asked to
//! upgrade. Each snapshot the scheduler persists is sent as one JSON text
//! frame. Slow clients skip frames they lagged behind on.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use usagestats_core::Snapshot;

use super::fetch::verify_token;
use crate::{AppState, WebError};

pub fn routes() -> Router<AppState> {
    Router::new().route("/fetchStats/:token/live", get(live_stats))
}

async fn live_stats(
    State(state): State<AppState>,
    Path(token): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, WebError> {
    verify_token(&state, &token)?;
    let ws = ws.ok_or(WebError::UpgradeRequired)?;

    // Subscribe before the upgrade so nothing published during the handshake is missed
    let rx = state.live.subscribe();
    Ok(ws.on_upgrade(move |socket| stream_snapshots(socket, rx)))
}

async fn stream_snapshots(socket: WebSocket, mut rx: broadcast::Receiver<Arc<Snapshot>>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!("live stats subscriber connected");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("live stats subscriber disconnected");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "live stats socket error");
                        break;
                    }
                    _ => {} // Clients have nothing to say
                }
            }

            snapshot = rx.recv() => {
                match snapshot {
                    Ok(snapshot) => {
                        let text = match serde_json::to_string(snapshot.as_ref()) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(error = %e, "failed to encode snapshot for live subscriber");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "live stats subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("snapshot channel closed");
                        break;
                    }
                }
            }
        }
    }
}
