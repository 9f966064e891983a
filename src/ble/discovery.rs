//! GATT service discovery dispatch
//!
//! Runs one discovery pass over all services on a secured connection and
//! binds every service whose UUID matches an entry in the service registry.
//! A start attempt that collides with a pass already in flight is retried on
//! a fixed backoff instead of being dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::ble::adapter::{DiscoveredService, DiscoveryStartError, ServiceDiscoverer};

/// Fixed delay before retrying a discovery start that found a session busy
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Bluetooth base UUID with a zeroed 16-bit field
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit service identifier to its full 128-bit form
pub fn expand_short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Registry key: 16-bit assigned number or full 128-bit UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceUuid {
    Short(u16),
    Long(Uuid),
}

impl ServiceUuid {
    fn matches(&self, uuid: &Uuid) -> bool {
        match self {
            ServiceUuid::Short(short) => *uuid == expand_short_uuid(*short),
            ServiceUuid::Long(long) => uuid == long,
        }
    }
}

/// Per-service binding invoked by the dispatcher when its UUID is discovered
pub trait ServiceHandler: Send {
    /// Record the attribute handle range of the discovered service
    fn assign_handles(&mut self, service: &DiscoveredService);

    /// Called once handle assignment for this service is finished
    fn discovery_completed(&mut self);
}

/// Minimal binding for a remote client service: records the discovered
/// handle range and readiness
#[derive(Debug, Default)]
pub struct ClientBinding {
    handles: Option<(u16, u16)>,
    ready: bool,
}

impl ClientBinding {
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn handles(&self) -> Option<(u16, u16)> {
        self.handles
    }
}

impl ServiceHandler for ClientBinding {
    fn assign_handles(&mut self, service: &DiscoveredService) {
        self.handles = Some((service.start_handle, service.end_handle));
    }

    fn discovery_completed(&mut self) {
        self.ready = true;
    }
}

struct RegistryEntry {
    uuid: ServiceUuid,
    name: &'static str,
    handler: Box<dyn ServiceHandler>,
    found: bool,
}

/// Discovery session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// No session, none requested
    Idle,
    /// A pass is walking services
    Running,
    /// Last start collided with a session in flight; retry pending
    Retrying {
        next_attempt: Instant,
        attempts: u32,
    },
    /// The pass finished (all services visited, or the procedure failed)
    Done,
}

/// Matches discovered services against the registry and drives the
/// start/retry state machine
pub struct DiscoveryDispatcher {
    discoverer: Arc<dyn ServiceDiscoverer>,
    registry: Vec<RegistryEntry>,
    state: DiscoveryState,
}

impl DiscoveryDispatcher {
    pub fn new(discoverer: Arc<dyn ServiceDiscoverer>) -> Self {
        Self {
            discoverer,
            registry: Vec::new(),
            state: DiscoveryState::Idle,
        }
    }

    /// Register a service handler; called once per service at startup
    pub fn register(
        &mut self,
        uuid: ServiceUuid,
        name: &'static str,
        handler: Box<dyn ServiceHandler>,
    ) {
        self.registry.push(RegistryEntry {
            uuid,
            name,
            handler,
            found: false,
        });
    }

    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Whether a service was bound during the current/last pass
    pub fn has(&self, uuid: ServiceUuid) -> bool {
        self.registry
            .iter()
            .any(|entry| entry.uuid == uuid && entry.found)
    }

    /// Begin a discovery pass on the secured connection
    pub async fn start(&mut self) {
        match self.state {
            DiscoveryState::Running | DiscoveryState::Retrying { .. } => {
                tracing::debug!("Discovery already in progress, ignoring start");
                return;
            }
            _ => {}
        }
        tracing::debug!("Starting GATT discovery");
        for entry in &mut self.registry {
            entry.found = false;
        }
        self.attempt_start(0).await;
    }

    /// Drive the retry state; call periodically from the task queue
    pub async fn tick(&mut self) {
        if let DiscoveryState::Retrying {
            next_attempt,
            attempts,
        } = self.state
        {
            if Instant::now() >= next_attempt {
                self.attempt_start(attempts).await;
            }
        }
    }

    async fn attempt_start(&mut self, attempts: u32) {
        match self.discoverer.start_discovery().await {
            Ok(()) => {
                self.state = DiscoveryState::Running;
            }
            Err(DiscoveryStartError::Busy) => {
                tracing::debug!(
                    "Discovery busy, retrying in {}ms (attempt {})",
                    RETRY_DELAY.as_millis(),
                    attempts + 1
                );
                self.state = DiscoveryState::Retrying {
                    next_attempt: Instant::now() + RETRY_DELAY,
                    attempts: attempts + 1,
                };
            }
            Err(DiscoveryStartError::Failed(code)) => {
                tracing::error!("Failed to start GATT discovery (err {})", code);
                self.state = DiscoveryState::Idle;
            }
        }
    }

    /// One service visited by the running pass. Exact 16-bit matches win
    /// over 128-bit matches; unmatched services are logged, not an error.
    pub fn on_service_found(&mut self, service: &DiscoveredService) {
        if self.state != DiscoveryState::Running {
            tracing::debug!("Service report outside a running session, ignoring");
            return;
        }
        let short_match = self
            .registry
            .iter()
            .position(|e| matches!(e.uuid, ServiceUuid::Short(_)) && e.uuid.matches(&service.uuid));
        let index = short_match.or_else(|| {
            self.registry
                .iter()
                .position(|e| matches!(e.uuid, ServiceUuid::Long(_)) && e.uuid.matches(&service.uuid))
        });

        match index {
            Some(index) => {
                let entry = &mut self.registry[index];
                if entry.found {
                    tracing::warn!("{} reported twice in one pass, ignoring", entry.name);
                    return;
                }
                entry.found = true;
                entry.handler.assign_handles(service);
                entry.handler.discovery_completed();
                tracing::debug!("{} found", entry.name);
            }
            None => {
                tracing::info!("Unhandled service found {}", service.uuid);
            }
        }
    }

    /// All services visited; report registry entries that never showed up.
    /// Advisory only, optional services are legitimately absent.
    pub fn on_no_more_services(&mut self) {
        tracing::debug!("No more services");
        for entry in &self.registry {
            if !entry.found {
                tracing::warn!("Service {} not found", entry.name);
            }
        }
        self.state = DiscoveryState::Done;
    }

    /// The discovery procedure failed; terminal for this session
    pub fn on_discovery_failed(&mut self, code: i32) {
        tracing::error!("The discovery procedure failed, err {}", code);
        self.state = DiscoveryState::Done;
    }

    /// Link loss: cancel any pending retry and forget this pass's results
    pub fn reset(&mut self) {
        self.state = DiscoveryState::Idle;
        for entry in &mut self.registry {
            entry.found = false;
        }
    }
}
