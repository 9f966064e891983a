//! Wristlink core demonstration
//!
//! Drives the companion core through a scripted session with in-process
//! collaborator stubs: boot, bonded-peer connect, security upgrade, service
//! discovery, then a handful of Gadgetbridge frames and status heartbeats.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use wristlink::ble::adapter::{
    Clock, DiscoveredService, DiscoveryEvent, DiscoveryStartError, DisconnectReason,
    LinkControl, LinkEvent, LinkResult, NotifyTransport, PeerAddress, SecurityLevel,
    ServiceDiscoverer, TransportError, TransportEvent,
};
use wristlink::ble::discovery::expand_short_uuid;
use wristlink::config::CoreConfig;
use wristlink::gadgetbridge::FRAME_START;
use wristlink::{CompanionCore, CTS_SERVICE_UUID, TRANSPORT_SERVICE_UUID};

/// Link stub: accepts every request and reports an encrypted link
struct DemoLink {
    bonds: Vec<PeerAddress>,
}

#[async_trait]
impl LinkControl for DemoLink {
    async fn request_security(&self, level: SecurityLevel) -> LinkResult<()> {
        info!("Link: security upgrade to {:?} requested", level);
        Ok(())
    }

    async fn disconnect(&self, reason: DisconnectReason) -> LinkResult<()> {
        info!("Link: disconnect requested ({:?})", reason);
        Ok(())
    }

    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::Encrypted
    }

    async fn enumerate_bonds(&self) -> LinkResult<Vec<PeerAddress>> {
        Ok(self.bonds.clone())
    }

    async fn set_link_filter(&self, peers: &[PeerAddress]) -> LinkResult<()> {
        info!("Link: accept filter set for {} peer(s)", peers.len());
        Ok(())
    }

    async fn request_mtu_exchange(&self) -> LinkResult<()> {
        info!("Link: MTU exchange requested");
        Ok(())
    }
}

/// Discovery stub: every start succeeds immediately
struct DemoDiscoverer;

#[async_trait]
impl ServiceDiscoverer for DemoDiscoverer {
    async fn start_discovery(&self) -> Result<(), DiscoveryStartError> {
        Ok(())
    }
}

/// Transport stub: prints outbound notifications
struct DemoTransport;

#[async_trait]
impl NotifyTransport for DemoTransport {
    async fn notify(&self, data: &[u8]) -> Result<(), TransportError> {
        info!("TX {}", String::from_utf8_lossy(data).trim_end());
        Ok(())
    }
}

/// Clock stub: prints what the peer asked for
struct DemoClock;

impl Clock for DemoClock {
    fn set_realtime(&self, epoch_seconds: i64) {
        match DateTime::<Utc>::from_timestamp(epoch_seconds, 0) {
            Some(time) => info!("Clock set to {}", time),
            None => info!("Clock set to out-of-range epoch {}", epoch_seconds),
        }
    }

    fn set_timezone(&self, offset: i32) {
        match FixedOffset::east_opt(offset * 3600) {
            Some(zone) => info!("Timezone set to {}", zone),
            None => info!("Timezone offset {} out of range", offset),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();
    dotenv::dotenv().ok();

    #[cfg(feature = "config-file")]
    let config = CoreConfig::load(None)?;
    #[cfg(not(feature = "config-file"))]
    let config = CoreConfig::default();

    info!("Starting {} core demonstration", config.device_name);

    let companion = PeerAddress::from_str("C0:64:2A:11:22:33")?;
    let link = Arc::new(DemoLink {
        bonds: vec![companion],
    });
    let mut core = CompanionCore::new(
        config,
        link,
        Arc::new(DemoDiscoverer),
        Arc::new(DemoTransport),
        Arc::new(DemoClock),
    );

    // Boot: seed the admission allow-list from persisted bonds
    core.init().await?;

    // Scripted link session: connect, secure, discover, subscribe
    core.handle_link_event(LinkEvent::Connected {
        peer: companion,
        error: None,
    })
    .await;
    core.handle_link_event(LinkEvent::SecurityChanged {
        level: SecurityLevel::Encrypted,
        error: None,
    })
    .await;
    core.handle_link_event(LinkEvent::MtuExchanged {
        mtu: 247,
        error: None,
    })
    .await;

    core.handle_discovery_event(DiscoveryEvent::ServiceFound(DiscoveredService {
        uuid: expand_short_uuid(CTS_SERVICE_UUID),
        start_handle: 10,
        end_handle: 20,
    }));
    core.handle_discovery_event(DiscoveryEvent::ServiceFound(DiscoveredService {
        uuid: TRANSPORT_SERVICE_UUID.parse()?,
        start_handle: 21,
        end_handle: 30,
    }));
    core.handle_discovery_event(DiscoveryEvent::NoMoreServices);

    core.handle_transport_event(TransportEvent::SubscriptionChanged { enabled: true })
        .await;

    info!("Session up (secure: {}, tx ready: {})", core.is_secure(), core.can_send());

    // Inbound protocol traffic, including a frame split across writes
    let frames: Vec<Vec<u8>> = vec![
        frame("GB({\"t\":\"notify\",\"id\":1,\"title\":atob(\"SGVsbG8gd29ybGQ=\"),\"sender\":\"Ada\"})"),
        frame("GB({\"t\":\"musicinfo\",\"artist\":\"Kraftwerk\",\"track\":\"Computer Love\",\"dur\":215})"),
        frame("GB({\"t\":\"musicstate\",\"state\":\"play\",\"position\":14})"),
        frame("setTime(1700000000)setTimeZone(2)"),
    ];
    for data in frames {
        // a real peer writes in MTU-sized chunks
        for chunk in data.chunks(20) {
            core.handle_transport_event(TransportEvent::DataReceived(chunk.to_vec()))
                .await;
        }
    }

    // Status heartbeats, battery slowly draining
    for bat in (96u8..=100).rev() {
        let volt = (3 * u32::from(bat) + 30) as f32 / 100.0;
        core.emit_status(bat, volt, false).await?;
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    }

    // Peer walks away
    core.handle_link_event(LinkEvent::Disconnected {
        peer: companion,
        reason: 0x13,
    })
    .await;
    info!("Session closed");

    Ok(())
}

fn frame(body: &str) -> Vec<u8> {
    let mut data = vec![FRAME_START];
    data.extend_from_slice(body.as_bytes());
    data.push(b'\n');
    data
}
