//! Server status projection and fan-out to WebSocket observers.

use crate::gate::{ExclusivityGate, GateEvent, GateListener, GateTransition};
use crate::state::{AgentState, AppState, SessionRegistry};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

pub const EVENT_GET_SERVER_STATUS: &str = "get-server-status";
pub const EVENT_SERVER_STATUS: &str = "server-status";
pub const EVENT_SERVER_STATUS_UPDATE: &str = "server-status-update";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusView {
    pub is_processing: bool,
    pub state: AgentState,
}

/// Full status answered to a pull request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub is_exclusive: bool,
    pub running_session_id: Option<String>,
    pub can_accept_new_request: bool,
    pub active_sessions: usize,
    pub session_statuses: BTreeMap<String, SessionStatusView>,
}

/// Pushed to every subscriber after a gate transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusUpdate {
    pub is_exclusive: bool,
    pub running_session_id: Option<String>,
    pub can_accept_new_request: bool,
    pub timestamp: u64,
}

impl From<&GateEvent> for ServerStatusUpdate {
    fn from(event: &GateEvent) -> Self {
        Self {
            is_exclusive: event.is_exclusive,
            running_session_id: event.running_session_id.clone(),
            can_accept_new_request: event.can_accept_new_request(),
            timestamp: event.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
struct Outgoing<'a, T> {
    event: &'a str,
    data: T,
}

#[derive(Debug, Deserialize)]
struct Incoming {
    event: String,
}

/// Projects gate and registry state and fans updates out to subscribers.
pub struct StatusBroadcaster {
    updates: broadcast::Sender<ServerStatusUpdate>,
    debug: bool,
}

impl StatusBroadcaster {
    pub fn new(debug: bool) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self { updates, debug }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerStatusUpdate> {
        self.updates.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.updates.receiver_count()
    }

    pub async fn snapshot(gate: &ExclusivityGate, sessions: &SessionRegistry) -> ServerStatus {
        let statuses = sessions.statuses().await;
        let running_session_id = gate.running_session_id();
        ServerStatus {
            is_exclusive: gate.is_exclusive(),
            can_accept_new_request: !gate.is_exclusive() || running_session_id.is_none(),
            running_session_id,
            active_sessions: statuses.len(),
            session_statuses: statuses
                .into_iter()
                .map(|(id, status)| {
                    let view = SessionStatusView {
                        is_processing: status.is_processing(),
                        state: status.agent_state(),
                    };
                    (id, view)
                })
                .collect(),
        }
    }
}

impl GateListener for StatusBroadcaster {
    fn on_transition(&self, event: &GateEvent) {
        if self.debug {
            match &event.transition {
                GateTransition::Started(id) => info!(session_id = %id, "run slot acquired"),
                GateTransition::Ended(id) => info!(session_id = %id, "run slot released"),
            }
        }

        let update = ServerStatusUpdate::from(event);
        let delivered = self.updates.send(update.clone()).unwrap_or(0);
        if self.debug {
            info!(
                running_session_id = ?update.running_session_id,
                can_accept_new_request = update.can_accept_new_request,
                timestamp = update.timestamp,
                subscribers = delivered,
                "broadcast server status update"
            );
        }
    }
}

/// `GET /socket` - upgrades to the status channel.
pub async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let mut updates = state.broadcaster.subscribe();
    let (mut sender, mut receiver) = socket.split();
    debug!("status subscriber connected");

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!("status socket receive error: {}", e);
                        break;
                    }
                };
                let request: Incoming = match serde_json::from_str(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("ignoring malformed status socket message: {}", e);
                        continue;
                    }
                };
                if request.event != EVENT_GET_SERVER_STATUS {
                    debug!(event = %request.event, "ignoring unknown status socket event");
                    continue;
                }
                let status = StatusBroadcaster::snapshot(&state.gate, &state.sessions).await;
                if state.broadcaster.debug {
                    info!(?status, "answering server status request");
                }
                if send_event(&mut sender, EVENT_SERVER_STATUS, &status).await.is_err() {
                    break;
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(update) => {
                        if send_event(&mut sender, EVENT_SERVER_STATUS_UPDATE, &update).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status subscriber lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    debug!("status subscriber disconnected");
}

async fn send_event<S, T>(sender: &mut S, event: &str, data: &T) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_string(&Outgoing { event, data }).map_err(|e| {
        warn!("failed to serialize {} payload: {}", event, e);
    })?;
    sender.send(Message::Text(payload)).await.map_err(|_| ())
}
