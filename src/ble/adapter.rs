//! Platform-agnostic collaborator traits for the companion core
//!
//! These traits define the boundary to the BLE host stack; the session core
//! never talks to a radio directly. The host delivers completions and inbound
//! data as events on the embedder's single ordered queue.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Result type for link-layer operations
pub type LinkResult<T> = Result<T, LinkError>;

/// 6-byte BLE peer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress([u8; 6]);

impl PeerAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Error parsing a textual BLE address
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid BLE address: {0}")]
pub struct AddressParseError(String);

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 {
                return Err(AddressParseError(s.to_string()));
            }
            bytes[count] = u8::from_str_radix(part, 16)
                .map_err(|_| AddressParseError(s.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

/// Link security level, lowest to highest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    /// No encryption
    Open,
    /// Encrypted link (unauthenticated pairing)
    Encrypted,
    /// Encrypted link with authenticated pairing
    Authenticated,
    /// Authenticated LE Secure Connections pairing
    AuthenticatedSc,
}

/// Minimum security level required before services may start on a connection
pub const MIN_SECURITY_LEVEL: SecurityLevel = SecurityLevel::Encrypted;

/// Reason codes passed when this core tears a link down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer failed admission or a security upgrade
    AuthenticationFailure,
    /// Local teardown for any other cause
    Other(u8),
}

/// One service visited by a discovery pass
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    /// Full 128-bit service UUID (16-bit identifiers arrive base-expanded)
    pub uuid: Uuid,
    /// First attribute handle of the service
    pub start_handle: u16,
    /// Last attribute handle of the service
    pub end_handle: u16,
}

/// Link-layer events delivered by the host stack
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Link established; `error` carries the HCI code when establishment failed
    Connected {
        peer: PeerAddress,
        error: Option<u8>,
    },
    /// Link lost
    Disconnected {
        peer: PeerAddress,
        reason: u8,
    },
    /// Security upgrade finished
    SecurityChanged {
        level: SecurityLevel,
        error: Option<u8>,
    },
    /// ATT MTU exchange finished; `mtu` is only meaningful when `error` is None
    MtuExchanged {
        mtu: u16,
        error: Option<u8>,
    },
    /// The security manager wants a passkey shown to the user
    PasskeyDisplay {
        passkey: u32,
    },
    /// Interactive pairing finished successfully
    PairingComplete {
        peer: PeerAddress,
        bonded: bool,
    },
    /// Interactive pairing failed
    PairingFailed {
        reason: u8,
    },
}

/// Discovery events delivered by the GATT discovery collaborator
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// One service was visited
    ServiceFound(DiscoveredService),
    /// The discovery pass visited every service
    NoMoreServices,
    /// The discovery procedure failed; terminal for this session
    Failed {
        code: i32,
    },
}

/// Transport events delivered by the notification transport collaborator
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Peer wrote one chunk to the write characteristic
    DataReceived(Vec<u8>),
    /// Peer subscribed to or unsubscribed from notifications
    SubscriptionChanged {
        enabled: bool,
    },
}

/// Link-layer error types
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("security request rejected: {0}")]
    SecurityRequest(String),

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    #[error("MTU exchange request failed: {0}")]
    MtuExchange(String),

    #[error("bond storage unavailable: {0}")]
    BondStorage(String),

    #[error("link filter update failed: {0}")]
    LinkFilter(String),
}

/// Link and security-manager capabilities consumed by the connection manager
#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Ask the security manager to raise the link to `level`; completion is
    /// delivered later as [`LinkEvent::SecurityChanged`]
    async fn request_security(&self, level: SecurityLevel) -> LinkResult<()>;

    /// Tear the current link down
    async fn disconnect(&self, reason: DisconnectReason) -> LinkResult<()>;

    /// Current security level of the link
    fn security_level(&self) -> SecurityLevel;

    /// Enumerate persisted bonds
    async fn enumerate_bonds(&self) -> LinkResult<Vec<PeerAddress>>;

    /// Install the radio-level connection accept filter
    async fn set_link_filter(&self, peers: &[PeerAddress]) -> LinkResult<()>;

    /// Kick off an ATT MTU exchange; completion is delivered later as
    /// [`LinkEvent::MtuExchanged`]
    async fn request_mtu_exchange(&self) -> LinkResult<()>;
}

/// Error returned by a discovery start attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryStartError {
    #[error("a discovery session is already running")]
    Busy,

    #[error("discovery could not be started (err {0})")]
    Failed(i32),
}

/// GATT discovery capability; results arrive as [`DiscoveryEvent`]s
#[async_trait]
pub trait ServiceDiscoverer: Send + Sync {
    async fn start_discovery(&self) -> Result<(), DiscoveryStartError>;
}

/// Notification transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("notification rejected: {0}")]
    NotifyRejected(String),
}

/// Device-to-peer notification capability backing the transport channel
#[async_trait]
pub trait NotifyTransport: Send + Sync {
    /// Push one notification payload to the subscribed peer
    async fn notify(&self, data: &[u8]) -> Result<(), TransportError>;
}

/// Realtime clock capability used by the setTime handler
pub trait Clock: Send + Sync {
    /// Set the realtime clock to the given Unix time
    fn set_realtime(&self, epoch_seconds: i64);

    /// Reconfigure the active timezone offset
    fn set_timezone(&self, offset: i32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_roundtrip() {
        let addr = PeerAddress::new([0xC0, 0x01, 0x1E, 0xE7, 0x00, 0x42]);
        let text = addr.to_string();
        assert_eq!(text, "C0:01:1E:E7:00:42");
        assert_eq!(text.parse::<PeerAddress>().unwrap(), addr);
    }

    #[test]
    fn test_address_parse_rejects_garbage() {
        assert!("C0:01:1E".parse::<PeerAddress>().is_err());
        assert!("C0:01:1E:E7:00:42:99".parse::<PeerAddress>().is_err());
        assert!("zz:01:1E:E7:00:42".parse::<PeerAddress>().is_err());
        assert!("".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_security_level_ordering() {
        assert!(SecurityLevel::Open < SecurityLevel::Encrypted);
        assert!(SecurityLevel::Encrypted < SecurityLevel::Authenticated);
        assert!(SecurityLevel::Authenticated < SecurityLevel::AuthenticatedSc);
        assert!(SecurityLevel::Encrypted >= MIN_SECURITY_LEVEL);
    }
}
