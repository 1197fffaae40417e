use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use eventsense_common::RunId;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::SharedState;
use super::events::RunEvent;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Only forward events for this run. All runs when absent.
    #[serde(default)]
    pub run_id: Option<String>,
}

impl WsParams {
    fn filter(&self) -> Option<RunId> {
        self.run_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(RunId::from)
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let filter = params.filter();
    let rx = state.store.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, filter))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<RunEvent>, filter: Option<RunId>) {
    tracing::debug!(run_id = ?filter, "WebSocket client connected");
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx, filter).await;
    tracing::debug!("WebSocket client disconnected");
}

/// Serialize `event` for the wire if it passes the subscription filter.
fn encode(event: &RunEvent, filter: Option<&RunId>) -> Option<String> {
    if filter.is_some_and(|id| id != event.run_id()) {
        return None;
    }
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize run event");
            None
        }
    }
}

/// Forward run events until the client goes away.
///
/// Combines event forwarding, client message receiving and ping/pong
/// keepalive in one select loop. If no Pong arrives within
/// [`PONG_TIMEOUT`] after a Ping, the connection is considered dead.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<RunEvent>,
    filter: Option<RunId>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("WebSocket pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let Some(json) = encode(&event, filter.as_ref()) else {
                            continue;
                        };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "WebSocket client lagged behind run events");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventsense_common::StepStatus;

    fn step_finished(run_id: &str) -> RunEvent {
        RunEvent::StepFinished {
            run_id: RunId::from(run_id),
            step: 2,
            status: StepStatus::Done,
        }
    }

    #[test]
    fn test_encode_without_filter_forwards_everything() {
        let json = encode(&step_finished("run_aaaaaaaaaaaa"), None).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "step_finished");
        assert_eq!(value["data"]["step"], 2);
        assert_eq!(value["data"]["status"], "done");
    }

    #[test]
    fn test_encode_filters_other_runs() {
        let wanted = RunId::from("run_aaaaaaaaaaaa");
        assert!(encode(&step_finished("run_aaaaaaaaaaaa"), Some(&wanted)).is_some());
        assert!(encode(&step_finished("run_bbbbbbbbbbbb"), Some(&wanted)).is_none());
    }

    #[test]
    fn test_blank_run_id_means_no_filter() {
        let params = WsParams {
            run_id: Some("  ".to_string()),
        };
        assert!(params.filter().is_none());
        assert!(WsParams::default().filter().is_none());
        let params = WsParams {
            run_id: Some("run_aaaaaaaaaaaa".to_string()),
        };
        assert_eq!(params.filter(), Some(RunId::from("run_aaaaaaaaaaaa")));
    }
}
