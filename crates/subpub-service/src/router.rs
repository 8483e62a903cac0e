use crate::Error;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use futures::{sink::SinkExt, stream::StreamExt};
use subpub::{SubPub, Subscription};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Messages buffered between a subscription's handler and its socket.
const STREAM_BUFFER: usize = 64;

/// Unsubscribes when dropped, so a stream that never starts or ends for any
/// reason releases its subscription.
struct SubscriptionGuard(Subscription<String>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

/// Builds the publish/subscribe routes over `bus`.
///
/// - `POST /publish/{key}` publishes the request body.
/// - `GET /subscribe/{key}` upgrades to a WebSocket streaming every message
///   published to `key` as a text frame.
pub fn router(bus: SubPub<String>) -> Router {
    Router::new()
        .route("/publish/{key}", post(publish_handler))
        .route("/subscribe/{key}", get(subscribe_handler))
        .with_state(bus)
}

async fn publish_handler(
    Path(key): Path<String>,
    State(bus): State<SubPub<String>>,
    body: String,
) -> Result<StatusCode, Error> {
    debug!(%key, data = %body, "publish");

    bus.publish(&key, body)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn subscribe_handler(
    Path(key): Path<String>,
    State(bus): State<SubPub<String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, Error> {
    let (sender, receiver) = mpsc::channel(STREAM_BUFFER);

    let subscription = bus.subscribe(key.clone(), move |data: String| {
        let sender = sender.clone();
        async move {
            // Fails only once the socket side has gone away.
            let _ = sender.send(data).await;
        }
    })?;
    let guard = SubscriptionGuard(subscription);

    info!(%key, "subscriber connected");

    Ok(ws.on_upgrade(move |socket| stream_subscription(socket, guard, receiver)))
}

async fn stream_subscription(
    socket: WebSocket,
    guard: SubscriptionGuard,
    mut messages: mpsc::Receiver<String>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            message = messages.recv() => {
                let Some(data) = message else {
                    // The bus stopped delivering (shutdown).
                    sink.send(Message::Close(None)).await.ok();
                    break;
                };

                if let Err(e) = sink.send(Message::Text(data.into())).await {
                    debug!("error sending message: {:?}", e);
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!(key = %guard.0.subject(), "subscriber disconnected");
}
