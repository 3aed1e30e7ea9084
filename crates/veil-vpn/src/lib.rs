//! veil - Onion-Routing Tunnel Supervisor
//!
//! Runs a tor client on behalf of a host application: assembles its
//! transport and bridge configuration, tracks bootstrap progress, exposes
//! circuits, and keeps a small user-facing connection state machine in
//! step with the real process.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        Host Application                       │
//! │                                                               │
//! │  control(start_only)            EventBus ◀── StatusChanged    │
//! │        │                           ▲          Progress(u8)    │
//! │        ▼                           │                          │
//! │  ┌──────────────────────┐     ┌────┴───────────────┐          │
//! │  │ ConnectionController │────▶│  TunnelSupervisor  │          │
//! │  │   (state machine)    │     │  (actor, 1 process)│          │
//! │  └──────────┬───────────┘     └────┬───────────────┘          │
//! │             │ HostPlatform         │ ConfigAssembler          │
//! │             ▼                      ▼  ◀── TransportCatalog    │
//! │      permission / install     TorLauncher ─▶ tor daemon       │
//! │                                    ▲   control port + cookie  │
//! │  RelayCoordinator ─▶ snowflake-proxy (volunteer relay)        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Pluggable transports**: obfs4, snowflake, snowflake-AMP, meek and
//!   user-supplied bridge lines
//! - **Smart Connect**: tries direct, snowflake and obfs4 in turn
//! - **Live reconfiguration**: bridges and node restrictions change
//!   without restarting tor
//! - **Circuit view**: user-facing circuits with relay addresses and
//!   countries
//!
//! # Security
//!
//! - Cookie authentication on a loopback control port
//! - Bridge lines and cookies never reach the logs verbatim
//! - tor exits with the control connection (`TAKEOWNERSHIP`)

mod assembler;
mod circuit;
mod conf;
mod config;
mod control;
mod controller;
mod events;
mod logging;
mod process;
mod reachability;
mod relay;
mod settings;
mod supervisor;
mod transport;

pub use assembler::{ConfigAssembler, NodeConf};
pub use circuit::{Circuit, CircuitStatus, Node};
pub use conf::{ConfEntry, ConfKey, RESET_KEYS, TorConf};
pub use config::{
    ConfigError, DEFAULT_DNS_PORT, DEFAULT_SOCKS_PORT, RelayConfig, TunnelConfig,
    VeilConfig,
};
pub use control::{AsyncEvent, ControlConnection, ControlError, Reply, ReplyLine};
pub use controller::{
    ConnectionController, ConnectionError, ConnectionSnapshot, ConnectionStatus, HostError,
    HostPlatform, HostState, SMART_CONNECT_CANDIDATES,
};
pub use events::{EventBus, TunnelEvent};
pub use logging::{RedactedBridge, RedactedBytes};
pub use process::{DaemonLauncher, LaunchRequest, TorEvent, TorLauncher, TorProcess};
pub use reachability::IpStatus;
pub use relay::{
    RELAY_CAPACITY, RelayCoordinator, RelayError, RelayHandle, RelayLauncher, RelayOptions,
    SessionHook, SnowflakeProxyLauncher,
};
pub use settings::{Settings, SettingsError, SettingsStore};
pub use supervisor::{
    StartAttempt, StartError, StartEvent, SupervisorError, SupervisorStatus, TunnelAddresses,
    TunnelSupervisor,
};
pub use transport::{Transport, TransportPorts};
