//! Tunnel Supervisor
//!
//! Owns the single tor process. A supervisor task executes commands from a
//! queue one at a time, so start, stop, reconfiguration and circuit queries
//! never interleave.
//!
//! # Start attempts
//!
//! ```text
//! start ──▶ Progress(10) ──▶ Progress(45) ──▶ Progress(100) ──▶ Completed(Ok)
//!                       └──────────── failure ───────────────▶ Completed(Err)
//! ```
//!
//! Progress is strictly increasing and followed by exactly one completion.
//! `stop()` drops the attempt before the process goes away; a dropped
//! attempt resolves as [`StartError::Cancelled`].

use crate::assembler::ConfigAssembler;
use crate::circuit::Circuit;
use crate::conf::RESET_KEYS;
use crate::config::TunnelConfig;
use crate::control::ControlError;
use crate::process::{LaunchRequest, TorEvent, TorLauncher, TorProcess};
use crate::reachability::IpStatus;
use crate::settings::SettingsStore;
use crate::transport::Transport;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Listener keys queried once bootstrap finishes
const LISTENER_KEYS: [&str; 2] = ["net/listeners/socks", "net/listeners/dns"];

/// Supervisor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorStatus {
    #[default]
    Stopped,
    Starting,
    Started,
}

/// Resolved listener endpoints (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAddresses {
    pub socks: String,
    pub dns: String,
}

impl fmt::Display for TunnelAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SOCKS {} / DNS {}", self.socks, self.dns)
    }
}

/// Failures that end a start attempt
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("Control-port cookie could not be read")]
    CookieUnreadable,

    #[error("tor reported no SOCKS listener")]
    NoSocksAddress,

    #[error("tor reported no DNS listener (SOCKS at {socks})")]
    NoDnsAddress { socks: String },

    #[error("Control-port authentication failed: {0}")]
    Authentication(String),

    #[error("tor could not be launched: {0}")]
    Launch(String),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("tor exited during bootstrap")]
    Exited,

    #[error("Start attempt was cancelled")]
    Cancelled,
}

/// Supervisor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Tunnel supervisor has shut down")]
    Closed,
}

/// One event of a start attempt
#[derive(Debug)]
pub enum StartEvent {
    Progress(u8),
    Completed(Result<TunnelAddresses, StartError>),
}

/// Observer for one start attempt
pub struct StartAttempt {
    events: mpsc::UnboundedReceiver<StartEvent>,
    finished: bool,
}

impl StartAttempt {
    fn channel() -> (AttemptSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = AttemptSender { tx, last_progress: None };
        let attempt = Self { events: rx, finished: false };
        (sender, attempt)
    }

    /// Next progress or completion; `None` once completion was delivered
    pub async fn next(&mut self) -> Option<StartEvent> {
        if self.finished {
            return None;
        }

        match self.events.recv().await {
            Some(StartEvent::Completed(result)) => {
                self.finished = true;
                Some(StartEvent::Completed(result))
            }
            Some(progress) => Some(progress),
            None => {
                self.finished = true;
                Some(StartEvent::Completed(Err(StartError::Cancelled)))
            }
        }
    }

    /// Skip progress and wait for completion
    pub async fn wait(mut self) -> Result<TunnelAddresses, StartError> {
        while let Some(event) = self.next().await {
            if let StartEvent::Completed(result) = event {
                return result;
            }
        }
        Err(StartError::Cancelled)
    }
}

/// Supervisor side of an attempt
struct AttemptSender {
    tx: mpsc::UnboundedSender<StartEvent>,
    last_progress: Option<u8>,
}

impl AttemptSender {
    fn progress(&mut self, progress: u8) {
        if self.last_progress.is_some_and(|last| progress <= last) {
            return;
        }
        self.last_progress = Some(progress);
        let _ = self.tx.send(StartEvent::Progress(progress));
    }

    fn complete(self, result: Result<TunnelAddresses, StartError>) {
        let _ = self.tx.send(StartEvent::Completed(result));
    }
}

enum Command {
    Start {
        transport: Transport,
        reply: oneshot::Sender<StartAttempt>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    UpdateConfig {
        transport: Transport,
        reply: oneshot::Sender<()>,
    },
    SetReachability {
        status: IpStatus,
        reply: oneshot::Sender<()>,
    },
    Circuits {
        reply: oneshot::Sender<Vec<Circuit>>,
    },
    CloseCircuits {
        ids: Vec<String>,
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to the supervisor task
#[derive(Clone)]
pub struct TunnelSupervisor {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SupervisorStatus>,
}

impl TunnelSupervisor {
    /// Spawn the supervisor task; it ends when every handle is dropped
    pub fn spawn(
        launcher: Arc<dyn TorLauncher>,
        settings: Arc<SettingsStore>,
        config: TunnelConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (status_tx, status) = watch::channel(SupervisorStatus::Stopped);

        let actor = SupervisorActor {
            launcher,
            settings,
            assembler: ConfigAssembler::new(config.transport_ports),
            config,
            status: status_tx,
            reachability: IpStatus::default(),
            transport: Transport::None,
            process: None,
            events: None,
            attempt: None,
            addresses: None,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            commands: command_tx,
            status,
        }
    }

    /// Launch tor for `transport`
    ///
    /// With a process already live this reconfigures it instead; the
    /// returned attempt then completes with the current addresses (or, while
    /// still bootstrapping, replaces the previous observer).
    pub async fn start(&self, transport: Transport) -> Result<StartAttempt, SupervisorError> {
        self.request(|reply| Command::Start { transport, reply }).await
    }

    /// Stop tor; stopping a stopped supervisor is a no-op
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Re-apply node and transport configuration to a live process
    pub async fn update_config(&self, transport: Transport) -> Result<(), SupervisorError> {
        self.request(|reply| Command::UpdateConfig { transport, reply })
            .await
    }

    /// Store a new reachability hint, applied live when running
    pub async fn set_reachability(&self, status: IpStatus) -> Result<(), SupervisorError> {
        self.request(|reply| Command::SetReachability { status, reply })
            .await
    }

    /// User-facing circuits; empty when no process runs
    pub async fn circuits(&self) -> Result<Vec<Circuit>, SupervisorError> {
        self.request(|reply| Command::Circuits { reply }).await
    }

    /// Close circuits; `true` only if every close succeeded
    pub async fn close_circuits(&self, ids: Vec<String>) -> Result<bool, SupervisorError> {
        self.request(|reply| Command::CloseCircuits { ids, reply })
            .await
    }

    pub async fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }

    /// Follow status changes, including tor exiting on its own
    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        reply_rx.await.map_err(|_| SupervisorError::Closed)
    }
}

struct SupervisorActor {
    launcher: Arc<dyn TorLauncher>,
    settings: Arc<SettingsStore>,
    config: TunnelConfig,
    assembler: ConfigAssembler,
    status: watch::Sender<SupervisorStatus>,
    reachability: IpStatus,
    transport: Transport,
    process: Option<Box<dyn TorProcess>>,
    events: Option<mpsc::UnboundedReceiver<TorEvent>>,
    attempt: Option<AttemptSender>,
    addresses: Option<TunnelAddresses>,
}

impl SupervisorActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                event = next_event(&mut self.events) => self.handle_event(event).await,
            }
        }

        self.teardown().await;
        debug!("Tunnel supervisor finished");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { transport, reply } => self.start(transport, reply).await,
            Command::Stop { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
            Command::UpdateConfig { transport, reply } => {
                self.update_config(transport).await;
                let _ = reply.send(());
            }
            Command::SetReachability { status, reply } => {
                self.set_reachability(status).await;
                let _ = reply.send(());
            }
            Command::Circuits { reply } => {
                let _ = reply.send(self.circuits().await);
            }
            Command::CloseCircuits { ids, reply } => {
                let _ = reply.send(self.close_circuits(&ids).await);
            }
        }
    }

    async fn start(&mut self, transport: Transport, reply: oneshot::Sender<StartAttempt>) {
        let (mut sender, attempt) = StartAttempt::channel();
        if reply.send(attempt).is_err() {
            debug!("Start requester went away");
            return;
        }

        if self.process.is_some() {
            info!(transport = %transport, "tor already running, reconfiguring");
            self.update_config(transport).await;

            match &self.addresses {
                Some(addresses) => sender.complete(Ok(addresses.clone())),
                None => {
                    // Replaces the previous observer, which resolves as cancelled.
                    if let Some(previous) = self.attempt.take() {
                        sender.last_progress = previous.last_progress;
                    }
                    self.attempt = Some(sender);
                }
            }
            return;
        }

        self.set_status(SupervisorStatus::Starting);
        self.transport = transport;

        let settings = self.settings.snapshot();
        let request = LaunchRequest {
            conf: self.assembler.launch_conf(&settings, transport, self.reachability),
            socks_port: self.config.socks_port,
            dns_port: self.config.dns_port,
            log_file: self.config.log_file.clone(),
        };

        info!(transport = %transport, "Starting tor");

        let launched = self.launcher.launch(request).await;
        match launched {
            Ok(mut process) => match process.take_events() {
                Some(events) => {
                    sender.progress(0);
                    self.events = Some(events);
                    self.process = Some(process);
                    self.attempt = Some(sender);
                }
                None => {
                    process.shutdown().await;
                    self.fail(sender, StartError::Launch("no event stream".into()))
                        .await;
                }
            },
            Err(e) => self.fail(sender, e).await,
        }
    }

    async fn fail(&mut self, sender: AttemptSender, error: StartError) {
        warn!("tor start failed: {}", error);
        self.set_status(SupervisorStatus::Stopped);
        sender.complete(Err(error));
    }

    async fn handle_event(&mut self, event: Option<TorEvent>) {
        match event {
            Some(TorEvent::Bootstrap(progress)) => {
                debug!(progress, "Bootstrap progress");
                let Some(attempt) = self.attempt.as_mut() else {
                    return;
                };
                attempt.progress(progress);
                if progress >= 100 {
                    self.finish_start().await;
                }
            }
            Some(TorEvent::CircuitEstablished) => {
                if self.attempt.is_some() {
                    self.finish_start().await;
                }
            }
            None => {
                warn!("tor exited");
                self.events = None;
                self.process = None;
                self.addresses = None;
                if let Some(attempt) = self.attempt.take() {
                    attempt.complete(Err(StartError::Exited));
                }
                self.set_status(SupervisorStatus::Stopped);
            }
        }
    }

    async fn finish_start(&mut self) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };

        match self.resolve_listeners().await {
            Ok(addresses) => {
                info!(addresses = %addresses, "tor started");
                attempt.progress(100);
                self.addresses = Some(addresses.clone());
                self.set_status(SupervisorStatus::Started);
                attempt.complete(Ok(addresses));
            }
            Err(e) => {
                // "Stopped" must mean no live process.
                self.shutdown_process().await;
                self.fail(attempt, e).await;
            }
        }
    }

    async fn resolve_listeners(&mut self) -> Result<TunnelAddresses, StartError> {
        let Some(process) = self.process.as_mut() else {
            return Err(StartError::Exited);
        };

        let values = process.get_info(&LISTENER_KEYS).await?;
        let mut values = values.iter().map(|v| first_listener(v));

        let socks = values.next().flatten().ok_or(StartError::NoSocksAddress)?;
        let dns = values
            .next()
            .flatten()
            .ok_or_else(|| StartError::NoDnsAddress { socks: socks.clone() })?;

        Ok(TunnelAddresses { socks, dns })
    }

    async fn update_config(&mut self, transport: Transport) {
        let Some(process) = self.process.as_mut() else {
            debug!("No tor running, nothing to reconfigure");
            return;
        };

        for key in &RESET_KEYS {
            if let Err(e) = process.reset_conf(key).await {
                warn!(key = %key, "RESETCONF failed: {}", e);
            }
        }

        let conf = self
            .assembler
            .update_conf(&self.settings.snapshot(), transport);
        if let Err(e) = process.set_conf(&conf).await {
            warn!(transport = %transport, "Reconfiguration rejected: {}", e);
        }

        self.transport = transport;
        info!(transport = %transport, "tor reconfigured");
    }

    async fn set_reachability(&mut self, status: IpStatus) {
        self.reachability = status;

        if let Some(process) = self.process.as_mut() {
            if let Err(e) = process.set_conf(&status.tor_conf(self.transport)).await {
                warn!("Reachability update rejected: {}", e);
            }
        }
    }

    async fn circuits(&mut self) -> Vec<Circuit> {
        let Some(process) = self.process.as_mut() else {
            return Vec::new();
        };

        let mut circuits = match process.circuits().await {
            Ok(circuits) => Circuit::filter(circuits),
            Err(e) => {
                warn!("Circuit query failed: {}", e);
                return Vec::new();
            }
        };

        for circuit in &mut circuits {
            for node in &mut circuit.nodes {
                process.resolve_node(node).await;
            }
        }

        circuits
    }

    async fn close_circuits(&mut self, ids: &[String]) -> bool {
        let Some(process) = self.process.as_mut() else {
            return false;
        };
        if ids.is_empty() {
            return false;
        }

        let mut all_closed = true;
        for id in ids {
            match process.close_circuit(id).await {
                Ok(true) => debug!(circuit = %id, "Circuit closed"),
                Ok(false) => {
                    debug!(circuit = %id, "Unknown circuit");
                    all_closed = false;
                }
                Err(e) => {
                    warn!(circuit = %id, "CLOSECIRCUIT failed: {}", e);
                    all_closed = false;
                }
            }
        }
        all_closed
    }

    async fn teardown(&mut self) {
        // Drop the observer first so nothing fires for this attempt.
        self.attempt = None;

        if self.process.is_some() {
            info!("Stopping tor");
        }
        self.shutdown_process().await;
        self.set_status(SupervisorStatus::Stopped);
    }

    async fn shutdown_process(&mut self) {
        self.events = None;
        self.addresses = None;
        if let Some(mut process) = self.process.take() {
            process.shutdown().await;
        }
    }

    fn set_status(&mut self, status: SupervisorStatus) {
        self.status.send_replace(status);
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<TorEvent>>) -> Option<TorEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// First address of a listener value (`"127.0.0.1:12345" "[::1]:12345"`)
fn first_listener(value: &str) -> Option<String> {
    value
        .split_whitespace()
        .map(|addr| addr.trim_matches('"'))
        .find(|addr| !addr.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_listener() {
        assert_eq!(
            first_listener(r#""127.0.0.1:12345" "[::1]:12345""#).as_deref(),
            Some("127.0.0.1:12345")
        );
        assert_eq!(first_listener("127.0.0.1:12346").as_deref(), Some("127.0.0.1:12346"));
        assert_eq!(first_listener(""), None);
        assert_eq!(first_listener(r#""""#), None);
    }

    #[test]
    fn test_progress_strictly_increasing() {
        let (mut sender, mut attempt) = StartAttempt::channel();

        for p in [0, 10, 10, 5, 45, 100] {
            sender.progress(p);
        }
        drop(sender);

        let mut seen = Vec::new();
        while let Ok(StartEvent::Progress(p)) = attempt.events.try_recv() {
            seen.push(p);
        }
        assert_eq!(seen, [0, 10, 45, 100]);
    }

    #[tokio::test]
    async fn test_dropped_attempt_is_cancelled() {
        let (sender, attempt) = StartAttempt::channel();
        drop(sender);

        assert!(matches!(attempt.wait().await, Err(StartError::Cancelled)));
    }

    #[tokio::test]
    async fn test_single_completion() {
        let (sender, mut attempt) = StartAttempt::channel();
        sender.complete(Err(StartError::CookieUnreadable));

        assert!(matches!(
            attempt.next().await,
            Some(StartEvent::Completed(Err(StartError::CookieUnreadable)))
        ));
        assert!(attempt.next().await.is_none());
    }
}
