//! Wristlink - companion-protocol core for a BLE wearable
//!
//! Session logic between a watch peripheral and its companion app: peer
//! admission and link security, GATT service discovery and binding, a
//! flow-controlled byte channel over a notify/write characteristic pair,
//! and the line-framed Gadgetbridge control protocol carried on top of it.
//!
//! The radio, GATT transport, and security-manager cryptography live behind
//! the collaborator traits in [`ble::adapter`]; the embedder delivers their
//! events on a single ordered queue.

pub mod ble;
pub mod config;
pub mod gadgetbridge;

use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use ble::adapter::{
    Clock, DiscoveryEvent, LinkControl, LinkError, LinkEvent, NotifyTransport,
    ServiceDiscoverer, TransportEvent, MIN_SECURITY_LEVEL,
};
use ble::channel::{ChannelError, TransportChannel};
use ble::connection::{ConnectionManager, ConnectionState};
use ble::discovery::{ClientBinding, DiscoveryDispatcher, DiscoveryState, ServiceUuid};
use crate::config::CoreConfig;
use gadgetbridge::parse::{LogHandler, MessageHandler};
use gadgetbridge::GadgetbridgeService;

/// UART-style transport service backing the byte channel
pub const TRANSPORT_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Write characteristic of the transport service (peer to device)
pub const TRANSPORT_RX_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Notify characteristic of the transport service (device to peer)
pub const TRANSPORT_TX_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// Current Time Service (16-bit assigned number)
pub const CTS_SERVICE_UUID: u16 = 0x1805;

/// Apple Media Service
pub const AMS_SERVICE_UUID: &str = "89d3502b-0f36-433a-8ef4-c502ad55f8dc";

/// Apple Notification Center Service
pub const ANCS_SERVICE_UUID: &str = "7905f431-b5ce-4e99-a40f-4b1e122d00d0";

/// Error types for companion-core operations
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Core companion-protocol session
///
/// Owns the connection manager, discovery dispatcher, transport channel, and
/// protocol decoder. All state is mutated from the embedder's single ordered
/// event queue; no two handlers run concurrently.
pub struct CompanionCore {
    config: CoreConfig,
    connection: ConnectionManager,
    discovery: DiscoveryDispatcher,
    channel: Arc<TransportChannel>,
    gadgetbridge: Arc<Mutex<GadgetbridgeService>>,
}

impl CompanionCore {
    /// Build a core whose protocol messages are only logged
    pub fn new(
        config: CoreConfig,
        link: Arc<dyn LinkControl>,
        discoverer: Arc<dyn ServiceDiscoverer>,
        transport: Arc<dyn NotifyTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_handler(config, link, discoverer, transport, clock, Box::new(LogHandler))
    }

    /// Build a core delivering typed protocol messages to `handler`
    pub fn with_handler(
        config: CoreConfig,
        link: Arc<dyn LinkControl>,
        discoverer: Arc<dyn ServiceDiscoverer>,
        transport: Arc<dyn NotifyTransport>,
        clock: Arc<dyn Clock>,
        handler: Box<dyn MessageHandler>,
    ) -> Self {
        let mut connection = ConnectionManager::new(link, MIN_SECURITY_LEVEL);
        connection.set_pairable(config.pairable_on_boot);

        let mut discovery = DiscoveryDispatcher::new(discoverer);
        register_default_services(&mut discovery);

        let channel = Arc::new(TransportChannel::new(transport));
        let gadgetbridge = Arc::new(Mutex::new(GadgetbridgeService::new(clock, handler)));

        let core = Self {
            config,
            connection,
            discovery,
            channel,
            gadgetbridge,
        };
        core.wire_receive_path();
        core
    }

    /// One-time boot side effect: seed the bonded allow-list and install the
    /// radio-level accept filter
    pub async fn init(&mut self) -> Result<(), CoreError> {
        let bond_count = self.connection.rebuild_accept_filter().await?;
        tracing::debug!("Bond count {}", bond_count);
        Ok(())
    }

    /// Handle one link-layer event
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer, error } => {
                self.connection.on_connected(peer, error).await;
            }
            LinkEvent::Disconnected { peer, reason } => {
                self.connection.on_disconnected(peer, reason);
                self.discovery.reset();
                self.channel.on_disconnected();
                self.lock_gadgetbridge().reset();
            }
            LinkEvent::SecurityChanged { level, error } => {
                if self.connection.on_security_changed(level, error).await {
                    // only start services on a secure connection
                    self.discovery.start().await;
                }
            }
            LinkEvent::MtuExchanged { mtu, error } => match error {
                None => self.channel.on_mtu_exchanged(mtu),
                Some(err) => tracing::error!("MTU exchange failed (err {})", err),
            },
            LinkEvent::PasskeyDisplay { passkey } => {
                self.connection.on_passkey_display(passkey);
            }
            LinkEvent::PairingComplete { peer, bonded } => {
                self.connection.on_pairing_complete(peer, bonded).await;
            }
            LinkEvent::PairingFailed { reason } => {
                self.connection.on_pairing_failed(reason).await;
            }
        }
    }

    /// Handle one GATT discovery event
    pub fn handle_discovery_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::ServiceFound(service) => {
                self.discovery.on_service_found(&service);
            }
            DiscoveryEvent::NoMoreServices => {
                self.discovery.on_no_more_services();
            }
            DiscoveryEvent::Failed { code } => {
                self.discovery.on_discovery_failed(code);
            }
        }
    }

    /// Handle one notification-transport event
    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DataReceived(data) => {
                self.channel.on_data_received(&data);
            }
            TransportEvent::SubscriptionChanged { enabled } => {
                self.channel.on_subscription_changed(enabled);
                if enabled && self.connection.is_secure() {
                    if let Err(e) = self.send_version().await {
                        tracing::warn!("Version announcement failed ({})", e);
                    }
                }
            }
        }
    }

    /// Drive time-based work (the discovery retry backoff); call
    /// periodically from the task queue
    pub async fn tick(&mut self) {
        self.discovery.tick().await;
    }

    /// Announce firmware and hardware revisions to the peer
    pub async fn send_version(&self) -> Result<(), ChannelError> {
        gadgetbridge::send_version(
            &self.channel,
            &self.config.fw_revision,
            &self.config.hw_revision,
        )
        .await
    }

    /// Emit one status heartbeat. Skipped silently unless the connection is
    /// secure and a peer is subscribed.
    pub async fn emit_status(
        &self,
        bat: u8,
        volt: f32,
        charging: bool,
    ) -> Result<(), ChannelError> {
        if !self.connection.is_secure() || !self.channel.can_send() {
            tracing::debug!("Skipping status heartbeat, channel not ready");
            return Ok(());
        }
        gadgetbridge::send_status(&self.channel, bat, volt, charging).await
    }

    /// Enable or disable interactive pairing mode
    pub fn set_pairable(&mut self, pairable: bool) {
        self.connection.set_pairable(pairable);
    }

    pub fn is_secure(&self) -> bool {
        self.connection.is_secure()
    }

    pub fn can_send(&self) -> bool {
        self.channel.can_send()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    pub fn channel(&self) -> &TransportChannel {
        &self.channel
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn wire_receive_path(&self) {
        let gadgetbridge = Arc::clone(&self.gadgetbridge);
        self.channel.set_receive_callback(Arc::new(move |data| {
            gadgetbridge
                .lock()
                .expect("gadgetbridge state poisoned")
                .consume(data);
        }));
    }

    fn lock_gadgetbridge(&self) -> std::sync::MutexGuard<'_, GadgetbridgeService> {
        self.gadgetbridge
            .lock()
            .expect("gadgetbridge state poisoned")
    }
}

/// Register the handlers this device knows how to bind. Unmatched services
/// discovered on the peer are logged, and registered services the peer lacks
/// are reported as missing after the pass.
fn register_default_services(discovery: &mut DiscoveryDispatcher) {
    discovery.register(
        ServiceUuid::Short(CTS_SERVICE_UUID),
        "CTS Client",
        Box::new(ClientBinding::default()),
    );
    discovery.register(
        ServiceUuid::Long(Uuid::parse_str(AMS_SERVICE_UUID).expect("Invalid service UUID")),
        "AMS Client",
        Box::new(ClientBinding::default()),
    );
    discovery.register(
        ServiceUuid::Long(Uuid::parse_str(ANCS_SERVICE_UUID).expect("Invalid service UUID")),
        "ANCS Client",
        Box::new(ClientBinding::default()),
    );
    discovery.register(
        ServiceUuid::Long(
            Uuid::parse_str(TRANSPORT_SERVICE_UUID).expect("Invalid service UUID"),
        ),
        "Transport",
        Box::new(ClientBinding::default()),
    );
}
