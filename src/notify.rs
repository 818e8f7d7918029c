use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::lanes::Lane;
use crate::state::AppState;

const NOTIFY_CHANNEL_CAP: usize = 64;

/// Round-started broadcast, wire contract fixed by the webapp.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct GameNotice {
    #[serde(rename = "newGame")]
    pub(crate) new_game: bool,
    pub(crate) message: String,
}

/// Best-effort fan-out: no subscribers, lagging subscribers, and dropped
/// connections are all fine, the event is simply missed.
#[derive(Clone)]
pub(crate) struct Notifier {
    tx: broadcast::Sender<GameNotice>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAP);
        Self { tx }
    }

    pub(crate) fn publish(&self, lane: &Lane) {
        let notice = GameNotice {
            new_game: true,
            message: format!("New {}h Game Just Started!", lane.period_hours),
        };
        // Err here just means nobody is listening right now.
        let _ = self.tx.send(notice);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<GameNotice> {
        self.tx.subscribe()
    }
}

pub(crate) async fn ws_subscribe(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let rx = state.notifier.subscribe();
    ws.on_upgrade(move |socket| forward_notices(socket, rx))
}

async fn forward_notices(mut socket: WebSocket, mut rx: broadcast::Receiver<GameNotice>) {
    loop {
        tokio::select! {
            notice = rx.recv() => {
                let notice = match notice {
                    Ok(n) => n,
                    // Lagged: skip ahead, the client missed those events.
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&notice) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}
