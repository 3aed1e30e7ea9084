//! Connection Controller
//!
//! The public connection state machine. It is the only writer of
//! [`ConnectionStatus`]; user intents and host signals come in, supervisor
//! results and [`TunnelEvent`]s go out.
//!
//! # States
//!
//! ```text
//! Disabled ──enable──▶ NotInstalled ──install──▶ Installing ──▶ Disconnected
//!                  └──────────────────────────────────────────▶ Disconnected
//!
//! Disconnected ──start──▶ [Evaluating ▶] Connecting ──100%──▶ Connected
//! Evaluating / Connecting / Connected ──stop──▶ Disconnecting ──▶ Disconnected
//! Connected ◀──network change──▶ Reasserting
//! Connected / Reasserting ──tor exits──▶ Disconnected (with error)
//! any ──host fault──▶ Invalid
//! ```
//!
//! All fields live behind one lock, so a [`ConnectionSnapshot`] is always
//! consistent. Listener addresses are only exposed while `Connected`.

use crate::events::{EventBus, TunnelEvent};
use crate::reachability::IpStatus;
use crate::settings::SettingsStore;
use crate::supervisor::{
    StartAttempt, StartError, StartEvent, SupervisorStatus, TunnelAddresses, TunnelSupervisor,
};
use crate::transport::Transport;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// Transports tried in order by Smart Connect
pub const SMART_CONNECT_CANDIDATES: [Transport; 3] =
    [Transport::None, Transport::Snowflake, Transport::Obfs4];

/// Default time one Smart Connect candidate gets to bootstrap
const DEFAULT_CANDIDATE_TIMEOUT: Duration = Duration::from_secs(120);

/// User-facing connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disabled,
    NotInstalled,
    Installing,
    Disconnected,
    Connecting,
    Evaluating,
    Connected,
    Reasserting,
    Disconnecting,
    Invalid,
    Unknown,
}

impl ConnectionStatus {
    /// Is an attempt running or established?
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Evaluating | ConnectionStatus::Connecting | ConnectionStatus::Connected
        )
    }

    /// Is bootstrap progress meaningful?
    pub fn is_bootstrapping(&self) -> bool {
        matches!(self, ConnectionStatus::Evaluating | ConnectionStatus::Connecting)
    }

    fn from_host(state: HostState) -> Self {
        match state {
            HostState::Disabled => ConnectionStatus::Disabled,
            HostState::NotInstalled => ConnectionStatus::NotInstalled,
            HostState::Ready => ConnectionStatus::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionStatus::Disabled => "Disabled",
            ConnectionStatus::NotInstalled => "Not installed",
            ConnectionStatus::Installing => "Installing",
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Evaluating => "Evaluating connection",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Reasserting => "Reconnecting",
            ConnectionStatus::Disconnecting => "Disconnecting",
            ConnectionStatus::Invalid => "Invalid configuration",
            ConnectionStatus::Unknown => "Unknown",
        };
        f.write_str(text)
    }
}

/// Why the connection cannot progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("The tor control cookie could not be read")]
    CookieUnreadable,

    #[error("tor did not report a SOCKS address")]
    NoSocksAddress,

    #[error("tor did not report a DNS address")]
    NoDnsAddress,

    #[error("No transport could connect")]
    SmartConnectFailed,

    #[error("The tunnel is not installed")]
    NotInstalled,

    #[error("Permission to run the tunnel was denied")]
    PermissionDenied,

    #[error("tor could not be started")]
    ProcessLaunchFailed,
}

impl From<&StartError> for ConnectionError {
    fn from(error: &StartError) -> Self {
        match error {
            StartError::CookieUnreadable => ConnectionError::CookieUnreadable,
            StartError::NoSocksAddress => ConnectionError::NoSocksAddress,
            StartError::NoDnsAddress { .. } => ConnectionError::NoDnsAddress,
            StartError::Authentication(_)
            | StartError::Launch(_)
            | StartError::Control(_)
            | StartError::Exited
            | StartError::Cancelled => ConnectionError::ProcessLaunchFailed,
        }
    }
}

/// Host installation / permission state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    NotInstalled,
    Disabled,
    Ready,
}

/// Host platform errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Installation failed: {0}")]
    InstallFailed(String),
}

/// Platform integration (permission, installation)
#[async_trait]
pub trait HostPlatform: Send + Sync {
    async fn state(&self) -> HostState;

    /// Ask for the tunnel to be enabled; `true` on success
    async fn enable(&self) -> bool;

    async fn install(&self) -> Result<(), HostError>;
}

/// Consistent view of the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub error: Option<ConnectionError>,
    /// Present only while `Connected`
    pub addresses: Option<TunnelAddresses>,
    pub progress: u8,
}

#[derive(Debug)]
struct ControllerState {
    status: ConnectionStatus,
    error: Option<ConnectionError>,
    addresses: Option<TunnelAddresses>,
    progress: u8,
    /// Bumped by every start and stop; stale attempts compare against it
    generation: u64,
}

impl ControllerState {
    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            status: self.status,
            error: self.error,
            addresses: self
                .addresses
                .clone()
                .filter(|_| self.status == ConnectionStatus::Connected),
            progress: self.progress,
        }
    }
}

/// Connection state machine
pub struct ConnectionController {
    host: Arc<dyn HostPlatform>,
    supervisor: TunnelSupervisor,
    settings: Arc<SettingsStore>,
    events: EventBus,
    candidate_timeout: Duration,
    state: RwLock<ControllerState>,
}

impl ConnectionController {
    /// Create the controller with its initial status read from the host
    pub async fn new(
        host: Arc<dyn HostPlatform>,
        supervisor: TunnelSupervisor,
        settings: Arc<SettingsStore>,
        events: EventBus,
    ) -> Arc<Self> {
        Self::with_candidate_timeout(host, supervisor, settings, events, DEFAULT_CANDIDATE_TIMEOUT)
            .await
    }

    /// Like [`ConnectionController::new`] with a custom Smart Connect candidate timeout
    pub async fn with_candidate_timeout(
        host: Arc<dyn HostPlatform>,
        supervisor: TunnelSupervisor,
        settings: Arc<SettingsStore>,
        events: EventBus,
        candidate_timeout: Duration,
    ) -> Arc<Self> {
        let status = ConnectionStatus::from_host(host.state().await);
        info!(status = %status, "Connection controller ready");

        let controller = Arc::new(Self {
            host,
            supervisor,
            settings,
            events,
            candidate_timeout,
            state: RwLock::new(ControllerState {
                status,
                error: None,
                addresses: None,
                progress: 0,
                generation: 0,
            }),
        });

        tokio::spawn(watch_supervisor(
            Arc::downgrade(&controller),
            controller.supervisor.watch_status(),
        ));
        controller
    }

    /// Single entry point for user-facing toggling
    ///
    /// With `start_only` set, only a stopped tunnel is acted upon.
    pub async fn control(self: &Arc<Self>, start_only: bool) {
        let mut status = self.status().await;

        if status == ConnectionStatus::Disabled {
            if !self.enable().await {
                return;
            }
            status = self.status().await;
            if status == ConnectionStatus::Disabled {
                return;
            }
            debug!(status = %status, "Enabled, re-running control");
        }

        let stopped = matches!(
            status,
            ConnectionStatus::Disconnected | ConnectionStatus::Disconnecting
        );
        if start_only && !stopped {
            debug!(status = %status, "Start only, nothing to do");
            return;
        }

        match status {
            ConnectionStatus::NotInstalled => self.install().await,
            ConnectionStatus::Evaluating
            | ConnectionStatus::Connecting
            | ConnectionStatus::Connected => self.disconnect().await,
            ConnectionStatus::Disconnected | ConnectionStatus::Disconnecting => self.connect().await,
            _ => debug!(status = %status, "No control action"),
        }
    }

    /// Ask the host to enable the tunnel; `true` on success
    pub async fn enable(&self) -> bool {
        if !self.host.enable().await {
            warn!("Host refused to enable the tunnel");
            self.update(|state| state.error = Some(ConnectionError::PermissionDenied))
                .await;
            return false;
        }

        let status = ConnectionStatus::from_host(self.host.state().await);
        self.update(|state| {
            state.status = status;
            state.error = None;
        })
        .await;
        true
    }

    /// Install through the host
    pub async fn install(&self) {
        self.update(|state| state.status = ConnectionStatus::Installing)
            .await;

        match self.host.install().await {
            Ok(()) => {
                info!("Tunnel installed");
                self.update(|state| {
                    state.status = ConnectionStatus::Disconnected;
                    state.error = None;
                })
                .await;
            }
            Err(e) => {
                warn!("Installation failed: {}", e);
                let error = match e {
                    HostError::PermissionDenied => ConnectionError::PermissionDenied,
                    HostError::InstallFailed(_) => ConnectionError::NotInstalled,
                };
                self.update(|state| {
                    state.status = ConnectionStatus::NotInstalled;
                    state.error = Some(error);
                })
                .await;
            }
        }
    }

    /// Start a connection attempt in the background
    ///
    /// Progress and the outcome are published on the event bus.
    pub async fn connect(self: &Arc<Self>) {
        let smart = self.settings.smart_connect();
        let status = if smart {
            ConnectionStatus::Evaluating
        } else {
            ConnectionStatus::Connecting
        };

        let generation = self
            .update(|state| {
                state.generation += 1;
                state.status = status;
                state.error = None;
                state.addresses = None;
                state.progress = 0;
                state.generation
            })
            .await;

        info!(smart_connect = smart, "Connecting");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if smart {
                this.smart_connect(generation).await;
            } else {
                let transport = this.settings.transport();
                this.connect_with(generation, transport).await;
            }
        });
    }

    async fn connect_with(&self, generation: u64, transport: Transport) {
        match self.attempt(generation, transport).await {
            Ok(addresses) => self.connected(generation, addresses).await,
            Err(StartError::Cancelled) => debug!("Start attempt cancelled"),
            Err(e) => {
                warn!(transport = %transport, "Connection failed: {}", e);
                self.failed(generation, ConnectionError::from(&e)).await;
            }
        }
    }

    async fn smart_connect(&self, generation: u64) {
        for transport in SMART_CONNECT_CANDIDATES {
            if !self.is_current(generation).await {
                return;
            }
            info!(transport = %transport, "Smart Connect trying transport");

            let outcome = tokio::time::timeout(
                self.candidate_timeout,
                self.attempt(generation, transport),
            )
            .await;

            match outcome {
                Ok(Ok(addresses)) => {
                    self.connected(generation, addresses).await;
                    return;
                }
                Ok(Err(StartError::Cancelled)) => return,
                Ok(Err(e)) => warn!(transport = %transport, "Candidate failed: {}", e),
                Err(_) => warn!(transport = %transport, "Candidate timed out"),
            }

            if !self.is_current(generation).await {
                return;
            }
            if let Err(e) = self.supervisor.stop().await {
                warn!("Supervisor unavailable: {}", e);
                break;
            }
            self.update(|state| {
                if state.generation == generation {
                    state.status = ConnectionStatus::Evaluating;
                    state.progress = 0;
                }
            })
            .await;
        }

        self.failed(generation, ConnectionError::SmartConnectFailed)
            .await;
    }

    /// Run one start attempt, forwarding progress while it is current
    async fn attempt(&self, generation: u64, transport: Transport) -> Result<TunnelAddresses, StartError> {
        let mut attempt: StartAttempt = self
            .supervisor
            .start(transport)
            .await
            .map_err(|e| StartError::Launch(e.to_string()))?;

        // A stop that overtook this start leaves a process nobody wants.
        if !self.is_current(generation).await {
            if let Err(e) = self.supervisor.stop().await {
                warn!("Supervisor unavailable: {}", e);
            }
            return Err(StartError::Cancelled);
        }

        while let Some(event) = attempt.next().await {
            match event {
                StartEvent::Progress(progress) => self.report_progress(generation, progress).await,
                StartEvent::Completed(result) => return result,
            }
        }
        Err(StartError::Cancelled)
    }

    async fn report_progress(&self, generation: u64, progress: u8) {
        let current = self
            .update_quiet(|state| {
                if state.generation != generation || !state.status.is_bootstrapping() {
                    return false;
                }
                if state.status == ConnectionStatus::Evaluating && progress > 0 {
                    state.status = ConnectionStatus::Connecting;
                }
                state.progress = state.progress.max(progress);
                true
            })
            .await;

        if current {
            self.events.publish(TunnelEvent::Progress(progress));
        }
    }

    async fn connected(&self, generation: u64, addresses: TunnelAddresses) {
        if self.supervisor.status().await != SupervisorStatus::Started {
            warn!("tor stopped before the connection was reported");
            self.failed(generation, ConnectionError::from(&StartError::Exited))
                .await;
            return;
        }

        info!(addresses = %addresses, "Connected");
        self.update(|state| {
            if state.generation == generation {
                state.status = ConnectionStatus::Connected;
                state.error = None;
                state.addresses = Some(addresses);
                state.progress = 100;
            }
        })
        .await;
    }

    async fn failed(&self, generation: u64, error: ConnectionError) {
        self.update(|state| {
            if state.generation == generation {
                state.status = ConnectionStatus::Disconnected;
                state.error = Some(error);
                state.addresses = None;
                state.progress = 0;
            }
        })
        .await;
    }

    /// Stop the tunnel; pending attempts are abandoned
    ///
    /// Only acts while a tunnel is running, starting or stopping. A start
    /// issued while this stop is in flight wins.
    pub async fn disconnect(&self) {
        let generation = self
            .update(|state| {
                let stoppable = state.status.is_active()
                    || matches!(
                        state.status,
                        ConnectionStatus::Reasserting | ConnectionStatus::Disconnecting
                    );
                if !stoppable {
                    return None;
                }
                state.generation += 1;
                state.status = ConnectionStatus::Disconnecting;
                state.addresses = None;
                Some(state.generation)
            })
            .await;

        let Some(generation) = generation else {
            debug!("Nothing to disconnect");
            return;
        };

        info!("Disconnecting");
        if let Err(e) = self.supervisor.stop().await {
            warn!("Supervisor unavailable: {}", e);
        }

        self.update(|state| {
            if state.generation == generation && state.status == ConnectionStatus::Disconnecting {
                state.status = ConnectionStatus::Disconnected;
                state.progress = 0;
            }
        })
        .await;
    }

    /// tor stopped without being asked to
    async fn tunnel_lost(&self) {
        let lost = self
            .update(|state| {
                if !matches!(
                    state.status,
                    ConnectionStatus::Connected | ConnectionStatus::Reasserting
                ) {
                    return false;
                }
                state.generation += 1;
                state.status = ConnectionStatus::Disconnected;
                state.error = Some(ConnectionError::from(&StartError::Exited));
                state.addresses = None;
                state.progress = 0;
                true
            })
            .await;

        if lost {
            warn!("tor stopped unexpectedly, tunnel is down");
        }
    }

    /// Host reported a fault; the tunnel is stopped
    pub async fn report_fault(&self, error: ConnectionError) {
        warn!("Host fault: {}", error);
        self.update(|state| {
            state.generation += 1;
            state.status = ConnectionStatus::Invalid;
            state.error = Some(error);
            state.addresses = None;
            state.progress = 0;
        })
        .await;

        if let Err(e) = self.supervisor.stop().await {
            warn!("Supervisor unavailable: {}", e);
        }
    }

    /// Re-read the host state after a fault or outside change
    pub async fn refresh_host_state(&self) {
        let status = ConnectionStatus::from_host(self.host.state().await);
        self.update(|state| {
            if !state.status.is_active() && state.status != ConnectionStatus::Reasserting {
                state.status = status;
            }
        })
        .await;
    }

    /// Host network change: `true` while re-establishing, `false` when done
    pub async fn network_changed(&self, reasserting: bool) {
        self.update(|state| match (state.status, reasserting) {
            (ConnectionStatus::Connected, true) => state.status = ConnectionStatus::Reasserting,
            (ConnectionStatus::Reasserting, false) => state.status = ConnectionStatus::Connected,
            _ => {}
        })
        .await;
    }

    /// Settings changed; re-apply them to a live tunnel
    pub async fn config_changed(&self) {
        if self.supervisor.status().await != SupervisorStatus::Stopped {
            let transport = self.settings.transport();
            if let Err(e) = self.supervisor.update_config(transport).await {
                warn!("Supervisor unavailable: {}", e);
            }
        }
        self.events.publish(TunnelEvent::StatusChanged);
    }

    /// New reachability hint from the host
    pub async fn set_reachability(&self, status: IpStatus) {
        if let Err(e) = self.supervisor.set_reachability(status).await {
            warn!("Supervisor unavailable: {}", e);
        }
    }

    pub async fn snapshot(&self) -> ConnectionSnapshot {
        self.state.read().await.snapshot()
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.read().await.status
    }

    pub async fn error(&self) -> Option<ConnectionError> {
        self.state.read().await.error
    }

    /// Listener addresses, only while `Connected`
    pub async fn addresses(&self) -> Option<TunnelAddresses> {
        self.snapshot().await.addresses
    }

    pub async fn progress(&self) -> u8 {
        self.state.read().await.progress
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn supervisor(&self) -> &TunnelSupervisor {
        &self.supervisor
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.state.read().await.generation == generation
    }

    /// Mutate state; publishes `StatusChanged` when status or error moved
    async fn update<T>(&self, change: impl FnOnce(&mut ControllerState) -> T) -> T {
        let (result, changed) = {
            let mut state = self.state.write().await;
            let before = (state.status, state.error);
            let result = change(&mut *state);
            let changed = before != (state.status, state.error);
            if changed {
                debug!(status = %state.status, error = ?state.error, "Connection status changed");
            }
            (result, changed)
        };

        if changed {
            self.events.publish(TunnelEvent::StatusChanged);
        }
        result
    }

    /// Mutate state without publishing
    async fn update_quiet<T>(&self, change: impl FnOnce(&mut ControllerState) -> T) -> T {
        change(&mut *self.state.write().await)
    }
}

/// Reconcile the controller whenever the supervisor reports `Stopped`
///
/// Stops the controller asks for leave `Connected` first, so a stop seen
/// while still `Connected` means tor went away by itself.
async fn watch_supervisor(
    controller: Weak<ConnectionController>,
    mut status: watch::Receiver<SupervisorStatus>,
) {
    while status.changed().await.is_ok() {
        if *status.borrow_and_update() != SupervisorStatus::Stopped {
            continue;
        }
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.tunnel_lost().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_error_mapping() {
        assert_eq!(
            ConnectionError::from(&StartError::CookieUnreadable),
            ConnectionError::CookieUnreadable
        );
        assert_eq!(
            ConnectionError::from(&StartError::NoDnsAddress {
                socks: "127.0.0.1:12345".into()
            }),
            ConnectionError::NoDnsAddress
        );
        assert_eq!(
            ConnectionError::from(&StartError::Launch("missing".into())),
            ConnectionError::ProcessLaunchFailed
        );
    }

    #[test]
    fn test_status_from_host() {
        assert_eq!(ConnectionStatus::from_host(HostState::Disabled), ConnectionStatus::Disabled);
        assert_eq!(
            ConnectionStatus::from_host(HostState::NotInstalled),
            ConnectionStatus::NotInstalled
        );
        assert_eq!(ConnectionStatus::from_host(HostState::Ready), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_addresses_hidden_unless_connected() {
        let mut state = ControllerState {
            status: ConnectionStatus::Reasserting,
            error: None,
            addresses: Some(TunnelAddresses {
                socks: "127.0.0.1:12345".into(),
                dns: "127.0.0.1:12346".into(),
            }),
            progress: 100,
            generation: 1,
        };
        assert!(state.snapshot().addresses.is_none());

        state.status = ConnectionStatus::Connected;
        assert!(state.snapshot().addresses.is_some());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::NotInstalled.to_string(), "Not installed");
        assert!(ConnectionStatus::Evaluating.is_bootstrapping());
        assert!(!ConnectionStatus::Reasserting.is_active());
    }
}
