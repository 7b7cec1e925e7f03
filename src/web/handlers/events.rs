use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::schedule::{BatchScheduler, Observer};

/// Streams the events of one batch as JSON text frames until the client
/// goes away or the batch is deleted.
pub async fn batch_events(
    ws: WebSocketUpgrade,
    State(scheduler): State<Arc<BatchScheduler>>,
    Path(batch_id): Path<String>,
) -> Response {
    // subscribe before the upgrade so no event between the two is missed
    match scheduler.subscribe(&batch_id).await {
        Ok(observer) => ws
            .on_upgrade(move |socket| handle_socket(socket, scheduler, batch_id, observer))
            .into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn handle_socket(socket: WebSocket, scheduler: Arc<BatchScheduler>, batch_id: String, mut observer: Observer) {
    let (mut sender, mut receiver) = socket.split();
    let observer_id = observer.id();
    info!("Observer {} attached to batch {}", observer_id, batch_id);

    loop {
        tokio::select! {
            event = observer.recv() => {
                let Some(event) = event else {
                    // batch deleted
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize event of batch {}: {}", batch_id, e);
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(text)).await {
                    debug!("Observer {} send failed: {}", observer_id, e);
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Observer {} socket error: {}", observer_id, e);
                    break;
                }
            },
        }
    }

    if observer.dropped() > 0 {
        warn!("Observer {} of batch {} missed {} events", observer_id, batch_id, observer.dropped());
    }
    scheduler.hub().unsubscribe(&batch_id, &mut observer);
    info!("Observer {} detached from batch {}", observer_id, batch_id);
}
