//! Integration tests for the wristlink companion core
//!
//! Drive the whole session through the public API with scripted collaborator
//! doubles: admission, security, discovery, transport, and protocol decode.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wristlink::ble::adapter::{
    Clock, DiscoveredService, DiscoveryEvent, DiscoveryStartError, DisconnectReason,
    LinkControl, LinkEvent, LinkResult, NotifyTransport, PeerAddress, SecurityLevel,
    ServiceDiscoverer, TransportError, TransportEvent,
};
use wristlink::ble::discovery::{expand_short_uuid, DiscoveryState};
use wristlink::config::CoreConfig;
use wristlink::gadgetbridge::parse::{MessageHandler, Notify};
use wristlink::gadgetbridge::{FRAME_START, MAX_RECV_LEN};
use wristlink::{CompanionCore, CTS_SERVICE_UUID};

#[derive(Default)]
struct FakeLink {
    bonds: Vec<PeerAddress>,
    disconnects: Mutex<Vec<DisconnectReason>>,
}

#[async_trait]
impl LinkControl for FakeLink {
    async fn request_security(&self, _level: SecurityLevel) -> LinkResult<()> {
        Ok(())
    }

    async fn disconnect(&self, reason: DisconnectReason) -> LinkResult<()> {
        self.disconnects.lock().unwrap().push(reason);
        Ok(())
    }

    fn security_level(&self) -> SecurityLevel {
        SecurityLevel::Open
    }

    async fn enumerate_bonds(&self) -> LinkResult<Vec<PeerAddress>> {
        Ok(self.bonds.clone())
    }

    async fn set_link_filter(&self, _peers: &[PeerAddress]) -> LinkResult<()> {
        Ok(())
    }

    async fn request_mtu_exchange(&self) -> LinkResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeDiscoverer {
    script: Mutex<VecDeque<Result<(), DiscoveryStartError>>>,
    starts: Mutex<u32>,
}

#[async_trait]
impl ServiceDiscoverer for FakeDiscoverer {
    async fn start_discovery(&self) -> Result<(), DiscoveryStartError> {
        *self.starts.lock().unwrap() += 1;
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct FakeTransport {
    sent: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl NotifyTransport for FakeTransport {
    async fn notify(&self, data: &[u8]) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(())
    }
}

#[derive(Default)]
struct FakeClock;

impl Clock for FakeClock {
    fn set_realtime(&self, _epoch_seconds: i64) {}
    fn set_timezone(&self, _offset: i32) {}
}

#[derive(Default)]
struct CapturingHandler {
    notifies: Arc<Mutex<Vec<Notify>>>,
}

impl MessageHandler for CapturingHandler {
    fn on_notify(&mut self, msg: Notify) {
        self.notifies.lock().unwrap().push(msg);
    }
}

fn peer() -> PeerAddress {
    "C0:64:2A:11:22:33".parse().unwrap()
}

fn frame(body: &str) -> Vec<u8> {
    let mut data = vec![FRAME_START];
    data.extend_from_slice(body.as_bytes());
    data.push(b'\n');
    data
}

struct Session {
    core: CompanionCore,
    link: Arc<FakeLink>,
    discoverer: Arc<FakeDiscoverer>,
    transport: Arc<FakeTransport>,
    notifies: Arc<Mutex<Vec<Notify>>>,
}

fn session(bonds: Vec<PeerAddress>, script: Vec<Result<(), DiscoveryStartError>>) -> Session {
    let link = Arc::new(FakeLink {
        bonds,
        ..FakeLink::default()
    });
    let discoverer = Arc::new(FakeDiscoverer {
        script: Mutex::new(script.into()),
        ..FakeDiscoverer::default()
    });
    let transport = Arc::new(FakeTransport::default());
    let handler = CapturingHandler::default();
    let notifies = Arc::clone(&handler.notifies);
    let core = CompanionCore::with_handler(
        CoreConfig::default(),
        Arc::clone(&link) as _,
        Arc::clone(&discoverer) as _,
        Arc::clone(&transport) as _,
        Arc::new(FakeClock) as _,
        Box::new(handler),
    );
    Session {
        core,
        link,
        discoverer,
        transport,
        notifies,
    }
}

async fn bring_up(session: &mut Session) {
    session.core.init().await.unwrap();
    session
        .core
        .handle_link_event(LinkEvent::Connected {
            peer: peer(),
            error: None,
        })
        .await;
    session
        .core
        .handle_link_event(LinkEvent::SecurityChanged {
            level: SecurityLevel::Encrypted,
            error: None,
        })
        .await;
    session
        .core
        .handle_link_event(LinkEvent::MtuExchanged {
            mtu: 247,
            error: None,
        })
        .await;
    session
        .core
        .handle_transport_event(TransportEvent::SubscriptionChanged { enabled: true })
        .await;
}

#[tokio::test]
async fn test_full_session_roundtrip() {
    let mut session = session(vec![peer()], vec![]);
    bring_up(&mut session).await;

    assert!(session.core.is_secure());
    assert!(session.core.can_send());

    // the version announcement went out when the peer subscribed
    {
        let sent = session.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(String::from_utf8_lossy(&sent[0]).contains("\"t\":\"ver\""));
    }

    // discovery pass binds the registered services
    session
        .core
        .handle_discovery_event(DiscoveryEvent::ServiceFound(DiscoveredService {
            uuid: expand_short_uuid(CTS_SERVICE_UUID),
            start_handle: 10,
            end_handle: 20,
        }));
    session
        .core
        .handle_discovery_event(DiscoveryEvent::NoMoreServices);
    assert_eq!(session.core.discovery_state(), DiscoveryState::Done);

    // an inbound notification, written in MTU-sized chunks
    let data = frame("GB({\"t\":\"notify\",\"id\":1,\"title\":atob(\"aGVsbG8=\")})");
    for chunk in data.chunks(20) {
        session
            .core
            .handle_transport_event(TransportEvent::DataReceived(chunk.to_vec()))
            .await;
    }

    let notifies = session.notifies.lock().unwrap();
    assert_eq!(notifies.len(), 1);
    assert_eq!(notifies[0].id, Some(1));
    assert_eq!(notifies[0].title.as_deref(), Some("hello"));
    drop(notifies);

    // status heartbeat goes out on the open channel
    session.core.emit_status(88, 2.94, false).await.unwrap();
    let sent = session.transport.sent.lock().unwrap();
    assert!(String::from_utf8_lossy(sent.last().unwrap()).contains("\"t\":\"status\""));
}

#[tokio::test]
async fn test_unbonded_peer_rejected_without_pairing_mode() {
    let mut session = session(vec![], vec![]);
    session.core.init().await.unwrap();

    session
        .core
        .handle_link_event(LinkEvent::Connected {
            peer: peer(),
            error: None,
        })
        .await;

    assert_eq!(
        *session.link.disconnects.lock().unwrap(),
        vec![DisconnectReason::AuthenticationFailure]
    );
    assert!(!session.core.is_secure());
}

#[tokio::test]
async fn test_pairing_mode_admits_unknown_peer() {
    let mut session = session(vec![], vec![]);
    session.core.init().await.unwrap();
    session.core.set_pairable(true);

    session
        .core
        .handle_link_event(LinkEvent::Connected {
            peer: peer(),
            error: None,
        })
        .await;

    assert!(session.link.disconnects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_discovery_start_contention_converges() {
    let mut session = session(
        vec![peer()],
        vec![Err(DiscoveryStartError::Busy), Err(DiscoveryStartError::Busy), Ok(())],
    );
    session.core.init().await.unwrap();
    session
        .core
        .handle_link_event(LinkEvent::Connected {
            peer: peer(),
            error: None,
        })
        .await;
    session
        .core
        .handle_link_event(LinkEvent::SecurityChanged {
            level: SecurityLevel::Encrypted,
            error: None,
        })
        .await;

    assert!(matches!(
        session.core.discovery_state(),
        DiscoveryState::Retrying { .. }
    ));

    // drive the retry backoff; two retries must be enough
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(550)).await;
        session.core.tick().await;
    }

    assert_eq!(session.core.discovery_state(), DiscoveryState::Running);
    assert_eq!(*session.discoverer.starts.lock().unwrap(), 3);
}

#[tokio::test]
async fn test_oversized_frame_does_not_poison_decoder() {
    let mut session = session(vec![peer()], vec![]);
    bring_up(&mut session).await;

    let oversized = format!("GB({})", "x".repeat(MAX_RECV_LEN + 10));
    session
        .core
        .handle_transport_event(TransportEvent::DataReceived(frame(&oversized)))
        .await;
    assert!(session.notifies.lock().unwrap().is_empty());

    // the next valid frame parses normally
    session
        .core
        .handle_transport_event(TransportEvent::DataReceived(frame(
            "GB({\"t\":\"notify\",\"id\":2})",
        )))
        .await;
    let notifies = session.notifies.lock().unwrap();
    assert_eq!(notifies.len(), 1);
    assert_eq!(notifies[0].id, Some(2));
}

#[tokio::test]
async fn test_reconnect_runs_a_fresh_session() {
    let mut session = session(vec![peer()], vec![]);
    bring_up(&mut session).await;
    assert_eq!(*session.discoverer.starts.lock().unwrap(), 1);

    session
        .core
        .handle_link_event(LinkEvent::Disconnected {
            peer: peer(),
            reason: 0x13,
        })
        .await;
    assert!(!session.core.is_secure());
    assert!(!session.core.can_send());

    session
        .core
        .handle_link_event(LinkEvent::Connected {
            peer: peer(),
            error: None,
        })
        .await;
    session
        .core
        .handle_link_event(LinkEvent::SecurityChanged {
            level: SecurityLevel::Encrypted,
            error: None,
        })
        .await;

    assert!(session.core.is_secure());
    assert_eq!(*session.discoverer.starts.lock().unwrap(), 2);
}
