//! Connection and security management
//!
//! Owns the per-peer connection state machine and the bonded-peer admission
//! policy. The device tracks at most one active connection; services are only
//! started once the link reaches the minimum security level.

use std::collections::HashSet;
use std::sync::Arc;

use crate::ble::adapter::{
    DisconnectReason, LinkControl, LinkResult, PeerAddress, SecurityLevel,
};

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Link establishment in progress
    Connecting,
    /// Link up, not yet encrypted
    Connected,
    /// Security upgrade requested, waiting for completion
    SecurityPending,
    /// Link at or above the minimum security level
    Secure,
}

/// Outcome of the admission policy for a connecting peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject,
}

/// Per-peer connection state machine and admission policy
pub struct ConnectionManager {
    link: Arc<dyn LinkControl>,
    state: ConnectionState,
    peer: Option<PeerAddress>,
    security: SecurityLevel,
    min_level: SecurityLevel,
    pairable: bool,
    bonded: HashSet<PeerAddress>,
    services_started: bool,
}

impl ConnectionManager {
    pub fn new(link: Arc<dyn LinkControl>, min_level: SecurityLevel) -> Self {
        Self {
            link,
            state: ConnectionState::Disconnected,
            peer: None,
            security: SecurityLevel::Open,
            min_level,
            pairable: false,
            bonded: HashSet::new(),
            services_started: false,
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Address of the connected peer, if any
    pub fn peer(&self) -> Option<PeerAddress> {
        self.peer
    }

    /// Whether the link is at or above the minimum security level
    pub fn is_secure(&self) -> bool {
        self.state == ConnectionState::Secure
    }

    /// Enable or disable interactive pairing mode
    pub fn set_pairable(&mut self, pairable: bool) {
        tracing::debug!(
            "{} pairing mode",
            if pairable { "Enabling" } else { "Disabling" }
        );
        self.pairable = pairable;
    }

    pub fn pairable(&self) -> bool {
        self.pairable
    }

    /// Seed the bonded-peer set from persistent storage and install the
    /// radio-level accept filter. One-time boot side effect; returns the
    /// number of bonds found.
    pub async fn rebuild_accept_filter(&mut self) -> LinkResult<usize> {
        let bonds = self.link.enumerate_bonds().await?;
        for peer in &bonds {
            tracing::debug!("Added {} to connection accept filter", peer);
        }
        self.bonded = bonds.iter().copied().collect();
        // only activate the filter once at least one bond exists, otherwise
        // nothing could ever pair
        if !bonds.is_empty() {
            self.link.set_link_filter(&bonds).await?;
        }
        Ok(bonds.len())
    }

    /// Admission policy: interactive pairing mode admits anyone, otherwise
    /// only previously bonded peers are let through
    pub fn evaluate_admission(&self, peer: &PeerAddress) -> Admission {
        if self.pairable || self.bonded.contains(peer) {
            Admission::Accept
        } else {
            Admission::Reject
        }
    }

    /// Link-establish event. On acceptance a security upgrade to the minimum
    /// level is requested; rejected peers are torn down with an
    /// authentication-failure reason.
    pub async fn on_connected(&mut self, peer: PeerAddress, error: Option<u8>) {
        if let Some(err) = error {
            tracing::error!("Connection failed (err 0x{:02x})", err);
            self.reset();
            return;
        }
        tracing::debug!("Connected {}", peer);
        self.state = ConnectionState::Connected;
        self.peer = Some(peer);
        self.security = SecurityLevel::Open;
        self.services_started = false;

        // transport parameter negotiation; failure does not affect admission
        if let Err(e) = self.link.request_mtu_exchange().await {
            tracing::error!("MTU exchange failed ({})", e);
        }

        match self.evaluate_admission(&peer) {
            Admission::Accept => {
                if let Err(e) = self.link.request_security(self.min_level).await {
                    tracing::error!("Failed to set security: {}", e);
                    self.terminate_auth_failure().await;
                } else {
                    self.state = ConnectionState::SecurityPending;
                }
            }
            Admission::Reject => {
                tracing::warn!("Rejecting unbonded peer {}", peer);
                self.terminate_auth_failure().await;
            }
        }
    }

    /// Security-upgrade completion. Returns true exactly once per connection,
    /// when the link first reaches the minimum level and services should
    /// start.
    pub async fn on_security_changed(
        &mut self,
        level: SecurityLevel,
        error: Option<u8>,
    ) -> bool {
        if self.state == ConnectionState::Disconnected {
            tracing::debug!("Ignoring security change without a connection");
            return false;
        }
        if let Some(err) = error {
            tracing::error!("Security failed: level {:?} err {}", level, err);
            self.terminate_auth_failure().await;
            return false;
        }
        tracing::debug!("Security changed: level {:?}", level);
        self.security = level;
        if level >= self.min_level {
            self.state = ConnectionState::Secure;
            if !self.services_started {
                self.services_started = true;
                return true;
            }
        }
        false
    }

    /// Link-loss event; releases all per-connection state
    pub fn on_disconnected(&mut self, peer: PeerAddress, reason: u8) {
        tracing::debug!("Disconnected: {} (reason {})", peer, reason);
        self.reset();
    }

    /// Passkey requested for display during interactive pairing
    pub fn on_passkey_display(&self, passkey: u32) {
        tracing::info!("Passkey {:06}", passkey);
    }

    /// Pairing finished; pairing mode turns itself back off and a bonded
    /// peer joins the admission set
    pub async fn on_pairing_complete(&mut self, peer: PeerAddress, bonded: bool) {
        tracing::debug!("Pairing complete: {} (bonded {})", peer, bonded);
        self.set_pairable(false);
        if bonded {
            self.bonded.insert(peer);
            let peers: Vec<PeerAddress> = self.bonded.iter().copied().collect();
            if let Err(e) = self.link.set_link_filter(&peers).await {
                tracing::error!("Failed to update accept filter: {}", e);
            }
        }
    }

    /// Pairing failed; terminal for this connection
    pub async fn on_pairing_failed(&mut self, reason: u8) {
        tracing::warn!("Pairing failed ({}). Disconnecting.", reason);
        self.terminate_auth_failure().await;
    }

    /// Forget every bond and clear the radio accept filter
    pub async fn unpair_all(&mut self) -> LinkResult<()> {
        self.bonded.clear();
        self.link.set_link_filter(&[]).await
    }

    async fn terminate_auth_failure(&mut self) {
        if let Err(e) = self
            .link
            .disconnect(DisconnectReason::AuthenticationFailure)
            .await
        {
            tracing::error!("Disconnect failed ({})", e);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.peer = None;
        self.security = SecurityLevel::Open;
        self.services_started = false;
    }
}
