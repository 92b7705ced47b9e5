// Realtime channel plumbing
// A Connector opens one channel and hands back a ChannelHandle: an ordered inbound queue plus an outbound sender

use log::debug;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod events;
pub mod socketio;
pub mod websocket;

pub use events::{InboundEvent, OutboundEvent, SendFailure, StatusChange, TypingNotice};
pub use websocket::SocketIoConnector;

use crate::error::SyncError;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Opens authenticated channels. Implementations report the handshake
/// outcome asynchronously as lifecycle events on the returned handle.
pub trait Connector: Send + Sync {
    fn open(&self, token: &str) -> ChannelHandle;
}

/// One live channel. Lifecycle and application events from every
/// underlying connection (including reconnects) arrive on the same queue.
pub struct ChannelHandle {
    outbound: mpsc::UnboundedSender<OutboundEvent>,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
    driver: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundEvent>,
        inbound: mpsc::UnboundedReceiver<InboundEvent>,
        driver: Option<JoinHandle<()>>,
    ) -> Self {
        ChannelHandle { outbound, inbound, driver }
    }

    pub fn emit(&self, event: OutboundEvent) -> Result<(), SyncError> {
        self.outbound
            .send(event)
            .map_err(|e| SyncError::Channel(format!("channel driver gone, dropped {}", e.0.name())))
    }

    /// Next inbound event; None once the driver has stopped for good
    pub async fn recv(&mut self) -> Option<InboundEvent> {
        self.inbound.recv().await
    }

    /// Stop the channel. A connected driver gets a short grace period to send
    /// its disconnect frame before it is aborted.
    pub fn close(&mut self) {
        self.inbound.close();
        // Replacing the only sender ends the driver's outbound queue
        let (closed, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.outbound, closed));
        if let Some(mut driver) = self.driver.take() {
            debug!("Stopping channel driver");
            match Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if tokio::time::timeout(CLOSE_GRACE, &mut driver).await.is_err() {
                            driver.abort();
                        }
                    });
                }
                Err(_) => driver.abort(),
            }
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}
