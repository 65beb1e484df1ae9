//! Notification handling
//! This module turns the central's event broadcast into a plain channel of
//! notification values for whoever displays live data.

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::types::{CentralEvent, CharacteristicRef};

/// A value pushed by the peripheral
pub type Notification = (CharacteristicRef, Vec<u8>);

/// Background task forwarding notification values
pub struct NotificationListener {
    cancel_token: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl NotificationListener {
    /// Starts forwarding notifications, optionally only those of one
    /// characteristic. The receiver closes when the listener stops or the
    /// central shuts down.
    pub fn start(
        events: broadcast::Receiver<CentralEvent>,
        only: Option<CharacteristicRef>,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let handle = tokio::spawn(async move {
            Self::process_notifications(events, only, tx, token).await;
        });
        (
            Self {
                cancel_token,
                task_handle: Some(handle),
            },
            rx,
        )
    }

    async fn process_notifications(
        mut events: broadcast::Receiver<CentralEvent>,
        only: Option<CharacteristicRef>,
        tx: mpsc::UnboundedSender<Notification>,
        cancel_token: CancellationToken,
    ) {
        info!("Listening for notifications...");
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(CentralEvent::NotificationReceived { characteristic, value }) => {
                        if only.is_some_and(|wanted| wanted != characteristic) {
                            continue;
                        }
                        debug!("Received data on {}: {:?}", characteristic, value);
                        if tx.send((characteristic, value)).is_err() {
                            debug!("Notification receiver dropped.");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Notification listener lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Notification stream ended");
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the task and waits for it to finish.
    pub async fn stop(&mut self) {
        self.cancel_token.cancel();
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                warn!("Notification task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
