// ============================
// crates/backend-lib/src/ws_router.rs
// ============================
//! HTTP router and WebSocket connection handling.
use crate::error::AppError;
use crate::handlers::api;
use crate::metrics::{WS_ACTIVE, WS_CONNECTION};
use crate::validation;
use crate::websocket::{error_message, WebSocketHandler};
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use protv_common::{ClientToServer, ServerToClient};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health))
        .route("/api/queue/count", get(api::queue_count))
        .route(
            "/api/profiles/{user_id}",
            get(api::get_profile).put(api::put_profile),
        )
        .route("/api/rooms/{room_id}", get(api::get_room))
        .route(
            "/api/users/{user_id}/connections",
            get(api::list_connections),
        )
        .route(
            "/api/users/{user_id}/matches/{partner_id}",
            get(api::latest_match),
        )
        .route(
            "/api/matches/{match_id}/messages",
            get(api::list_messages).post(api::post_message),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Handler for WebSocket connections
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    counter!(WS_CONNECTION).increment(1);
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    gauge!(WS_ACTIVE).increment(1.0);

    let capacity = state.settings.matchmaking.channel_capacity;
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerToClient>(capacity);
    let (events_tx, mut events_rx) = mpsc::channel::<ServerToClient>(capacity);

    let mut handler = WebSocketHandler::new(state, outbound_tx.clone(), events_tx);

    // Forward everything queued for this client to the socket
    let send_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize server message: {e}");
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                match message {
                    Message::Text(text) => {
                        if process_text(&mut handler, &outbound_tx, text.as_str()).await.is_err() {
                            break;
                        }
                    },
                    Message::Close(_) => break,
                    _ => {}, // Ping/Pong are answered by axum
                }
            },
            Some(event) = events_rx.recv() => {
                if let Err(e) = handler.handle_event(event).await {
                    warn!("failed to forward event: {e}");
                    break;
                }
            },
        }
    }

    handler.on_disconnect().await;
    drop(handler);

    gauge!(WS_ACTIVE).decrement(1.0);
    send_task.abort();
}

/// Parse, validate and dispatch one text frame. Errors are reported to the
/// client; only a dead outbound channel ends the connection.
async fn process_text(
    handler: &mut WebSocketHandler,
    outbound: &mpsc::Sender<ServerToClient>,
    text: &str,
) -> Result<(), mpsc::error::SendError<ServerToClient>> {
    let message = match serde_json::from_str::<ClientToServer>(text) {
        Ok(message) => message,
        Err(e) => {
            return outbound
                .send(ServerToClient::MalformedMessage {
                    err_msg: e.to_string(),
                })
                .await;
        },
    };

    if let Err(validation_err) = validation::validate_client_message(&message) {
        let err = AppError::from(validation_err);
        return outbound.send(error_message(&err)).await;
    }

    if let Err(err) = handler.handle_message(message).await {
        debug!(user_id = ?handler.user_id(), "operation failed: {err}");
        return outbound.send(error_message(&err)).await;
    }

    Ok(())
}
