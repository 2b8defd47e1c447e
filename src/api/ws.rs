//! WebSocket event channel
//!
//! Clients connect to `/api/ws` and receive bus events as JSON text
//! frames. The optional `topic` query parameter narrows the stream to one
//! task (`topic=download:<id>`); without it the connection carries the
//! global stream.

use crate::api::AppState;
use crate::download::{BusEvent, Topic};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub topic: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let topic = match query.topic.as_deref() {
        None => Topic::Global,
        Some(name) => match Topic::parse(name) {
            Some(topic) => topic,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("invalid topic: {}", name),
                )
                    .into_response()
            }
        },
    };

    let events = state.engine.subscribe(topic);
    ws.on_upgrade(move |socket| client_loop(socket, events))
}

async fn client_loop(mut socket: WebSocket, mut events: mpsc::Receiver<BusEvent>) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Pings are answered by the transport; client chatter
                    // carries no protocol meaning here.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
