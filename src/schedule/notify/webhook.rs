use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::hub::NotificationHub;
use crate::schedule::events::{BatchEvent, EventKind};

// HTTP callback for batches created with a callback_url
#[derive(Clone)]
pub struct HttpCallback {
    client: reqwest::Client,
    callback_url: String,
}

impl HttpCallback {
    pub fn new(callback_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            callback_url,
        }
    }

    pub async fn send(&self, event: &BatchEvent) -> Result<()> {
        self.client
            .post(&self.callback_url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Subscribes to `batch_id` right away and forwards its events from a
    /// background task until the batch reaches a terminal state or is
    /// removed from the hub. Delivery failures are logged and skipped.
    pub fn spawn_forwarder(self, hub: &Arc<NotificationHub>, batch_id: &str) -> JoinHandle<()> {
        let mut observer = hub.observer();
        hub.subscribe(batch_id, &mut observer);

        let hub = hub.clone();
        let batch_id = batch_id.to_string();
        tokio::spawn(async move {
            info!("Forwarding events of batch {} to {}", batch_id, self.callback_url);
            while let Some(event) = observer.recv().await {
                if let Err(e) = self.send(&event).await {
                    error!("Failed to deliver callback for batch {} to {}: {}", batch_id, self.callback_url, e);
                }
                if matches!(event.kind, EventKind::BatchStatusUpdate) && event.status.is_terminal() {
                    break;
                }
            }
            hub.unsubscribe(&batch_id, &mut observer);
        })
    }
}
