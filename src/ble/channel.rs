//! Flow-controlled byte channel over a notify/write characteristic pair
//!
//! Device-to-peer traffic goes out as notifications, peer-to-device traffic
//! arrives as characteristic writes. The channel performs no framing of its
//! own; byte-level framing belongs to the protocol decoder.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::ble::adapter::{NotifyTransport, TransportError};

/// Payload ceiling used until the MTU exchange completes (23-byte default
/// ATT MTU minus the 3-byte notification header)
pub const DEFAULT_MAX_SEND_LEN: usize = 20;

/// Callback invoked with each inbound write
pub type ReceiveCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Channel send error types
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("no peer is subscribed to notifications")]
    NotReady,

    #[error("payload of {len} bytes exceeds the negotiated maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("transport rejected the send: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to encode outbound message: {0}")]
    Encode(String),
}

/// Bidirectional byte channel multiplexed over one GATT characteristic pair
pub struct TransportChannel {
    transport: Arc<dyn NotifyTransport>,
    subscribed: AtomicBool,
    max_send_len: AtomicUsize,
    receive_cb: RwLock<Option<ReceiveCallback>>,
}

impl TransportChannel {
    pub fn new(transport: Arc<dyn NotifyTransport>) -> Self {
        Self {
            transport,
            subscribed: AtomicBool::new(false),
            max_send_len: AtomicUsize::new(DEFAULT_MAX_SEND_LEN),
            receive_cb: RwLock::new(None),
        }
    }

    /// Flow-control gate: true only while a peer is subscribed to
    /// notifications. Callers poll or retry rather than block.
    pub fn can_send(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Current payload ceiling
    pub fn max_send_len(&self) -> usize {
        self.max_send_len.load(Ordering::Acquire)
    }

    /// Register the byte-slice callback invoked for each inbound write
    pub fn set_receive_callback(&self, callback: ReceiveCallback) {
        *self
            .receive_cb
            .write()
            .expect("receive callback lock poisoned") = Some(callback);
    }

    /// Send one payload to the subscribed peer. Fails fast when no peer is
    /// subscribed or the payload exceeds the negotiated maximum.
    pub async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        if !self.can_send() {
            return Err(ChannelError::NotReady);
        }
        let max = self.max_send_len();
        if data.len() > max {
            return Err(ChannelError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }
        self.transport.notify(data).await.map_err(|e| {
            tracing::error!("Error sending channel data ({})", e);
            ChannelError::from(e)
        })
    }

    /// Peer subscribed to or unsubscribed from notifications
    pub fn on_subscription_changed(&self, enabled: bool) {
        tracing::debug!(
            "Notification subscription {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.subscribed.store(enabled, Ordering::Release);
    }

    /// MTU exchange completed; raise the payload ceiling to the ATT payload
    pub fn on_mtu_exchanged(&self, mtu: u16) {
        let max = usize::from(mtu).saturating_sub(3);
        tracing::debug!("MTU exchange done. {}", max);
        self.max_send_len.store(max, Ordering::Release);
    }

    /// Link loss: the subscription dies with the connection and the payload
    /// ceiling falls back to the pre-exchange default
    pub fn on_disconnected(&self) {
        self.subscribed.store(false, Ordering::Release);
        self.max_send_len
            .store(DEFAULT_MAX_SEND_LEN, Ordering::Release);
    }

    /// Inbound write from the peer; hands the bytes to the registered owner
    pub fn on_data_received(&self, data: &[u8]) {
        let cb = self
            .receive_cb
            .read()
            .expect("receive callback lock poisoned")
            .clone();
        match cb {
            Some(cb) => cb(data),
            None => tracing::debug!("Dropping {} inbound bytes, no receiver", data.len()),
        }
    }
}
