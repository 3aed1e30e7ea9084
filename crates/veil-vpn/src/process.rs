//! Tor Process
//!
//! Launches the tor daemon and drives it over its control port.
//!
//! # Launch sequence
//!
//! ```text
//! spawn tor ──▶ wait for control-port file ──▶ connect
//!     ──▶ read cookie ──▶ AUTHENTICATE ──▶ TAKEOWNERSHIP
//!     ──▶ SETEVENTS STATUS_CLIENT ──▶ TorEvent stream
//! ```
//!
//! The event stream closes when tor exits.

use crate::circuit::{Circuit, Node};
use crate::conf::{ConfKey, TorConf};
use crate::config::TunnelConfig;
use crate::control::{AsyncEvent, ControlConnection, ControlError, parse_control_port_file, parse_keywords};
use crate::logging::RedactedBytes;
use crate::supervisor::StartError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cookie length written by tor
const COOKIE_LEN: usize = 32;

/// Poll interval while waiting for the control-port file
const CONTROL_POLL: Duration = Duration::from_millis(100);

/// Grace period for a clean shutdown before the process is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Events reported by a running process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorEvent {
    /// Bootstrap percentage
    Bootstrap(u8),
    /// First circuit is usable
    CircuitEstablished,
}

impl TorEvent {
    /// Translate a `STATUS_CLIENT` event
    ///
    /// `STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=85 TAG=ap_conn SUMMARY="..."`
    pub fn from_event(event: &AsyncEvent) -> Option<Self> {
        let line = event.lines.first()?;
        let mut parts = line.splitn(4, ' ');

        if parts.next()? != "STATUS_CLIENT" {
            return None;
        }
        let _severity = parts.next()?;

        match parts.next()? {
            "BOOTSTRAP" => parse_keywords(parts.next().unwrap_or(""))
                .into_iter()
                .find(|(key, _)| key == "PROGRESS")
                .and_then(|(_, value)| value.parse::<u8>().ok())
                .map(|progress| TorEvent::Bootstrap(progress.min(100))),
            "CIRCUIT_ESTABLISHED" => Some(TorEvent::CircuitEstablished),
            _ => None,
        }
    }
}

/// Everything needed to launch one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Assembled configuration (transport, nodes, reachability, advanced)
    pub conf: TorConf,
    pub socks_port: u16,
    pub dns_port: u16,
    pub log_file: Option<PathBuf>,
}

/// Starts tor processes
#[async_trait]
pub trait TorLauncher: Send + Sync {
    /// Launch and authenticate; the returned process is ready for commands
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn TorProcess>, StartError>;
}

/// A live, authenticated tor process
#[async_trait]
pub trait TorProcess: Send {
    /// Bootstrap and circuit events; closes when the process exits
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TorEvent>>;

    async fn get_info(&mut self, keys: &[&str]) -> Result<Vec<String>, ControlError>;

    async fn set_conf(&mut self, conf: &TorConf) -> Result<(), ControlError>;

    async fn reset_conf(&mut self, key: &ConfKey) -> Result<(), ControlError>;

    /// All circuits, unfiltered
    async fn circuits(&mut self) -> Result<Vec<Circuit>, ControlError>;

    /// Fill in address and country details, best effort
    async fn resolve_node(&mut self, _node: &mut Node) {}

    /// `false` when the circuit is unknown
    async fn close_circuit(&mut self, id: &str) -> Result<bool, ControlError>;

    /// Stop the process; never fails
    async fn shutdown(&mut self);
}

/// Launches the tor executable from [`TunnelConfig`]
pub struct DaemonLauncher {
    config: TunnelConfig,
}

impl DaemonLauncher {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    /// Fixed options every launch carries, ahead of the request's entries
    pub fn base_conf(&self, request: &LaunchRequest) -> TorConf {
        let config = &self.config;
        let data_dir = config.data_dir.display().to_string();

        let mut conf = TorConf::new();
        conf.push(ConfKey::Other("SocksPort".into()), format!("{}", request.socks_port));
        conf.push(ConfKey::Other("DNSPort".into()), format!("{}", request.dns_port));
        conf.push(ConfKey::Other("AutomapHostsOnResolve".into()), "1");
        conf.push(ConfKey::Other("VirtualAddrNetworkIPv4".into()), "10.192.0.0/10");
        conf.push(ConfKey::Other("VirtualAddrNetworkIPv6".into()), "[FC00::]/7");
        conf.push(ConfKey::Other("LogMessageDomains".into()), "1");
        conf.push(ConfKey::Other("SafeLogging".into()), "1");
        conf.push(ConfKey::Other("MaxMemInQueues".into()), "5MB");
        conf.push(ConfKey::Other("ClientOnly".into()), "1");
        conf.push(ConfKey::Other("AvoidDiskWrites".into()), "1");
        conf.push(ConfKey::Other("CookieAuthentication".into()), "1");
        conf.push(
            ConfKey::Other("CookieAuthFile".into()),
            config.cookie_file().display().to_string(),
        );
        conf.push(ConfKey::Other("ControlPort".into()), "auto");
        conf.push(
            ConfKey::Other("ControlPortWriteToFile".into()),
            config.control_port_file().display().to_string(),
        );
        conf.push(ConfKey::Other("DataDirectory".into()), data_dir);

        if let Some(log_file) = &request.log_file {
            conf.push(
                ConfKey::Other("Log".into()),
                format!("notice file {}", log_file.display()),
            );
        }

        conf
    }

    async fn prepare_files(&self, request: &LaunchRequest) -> Result<(), StartError> {
        tokio::fs::create_dir_all(&self.config.data_dir)
            .await
            .map_err(|e| StartError::Launch(format!("{}: {}", self.config.data_dir.display(), e)))?;

        // Stale files from an earlier run would be picked up as this one's.
        let _ = tokio::fs::remove_file(self.config.control_port_file()).await;
        let _ = tokio::fs::remove_file(self.config.cookie_file()).await;

        if let Some(log_file) = &request.log_file {
            if let Some(parent) = log_file.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            tokio::fs::File::create(log_file)
                .await
                .map_err(|e| StartError::Launch(format!("{}: {}", log_file.display(), e)))?;
        }

        Ok(())
    }

    async fn wait_for_control_port(&self, child: &mut Child) -> Result<String, StartError> {
        let deadline = tokio::time::Instant::now() + self.config.control_wait();
        let path = self.config.control_port_file();

        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| StartError::Launch(e.to_string()))?
            {
                return Err(StartError::Launch(format!("tor exited early ({})", status)));
            }

            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                if let Some(addr) = parse_control_port_file(&content) {
                    return Ok(addr);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(StartError::Launch("control port was not published".into()));
            }
            tokio::time::sleep(CONTROL_POLL).await;
        }
    }

    async fn read_cookie(&self) -> Result<Vec<u8>, StartError> {
        let path = self.config.cookie_file();

        match tokio::fs::read(&path).await {
            Ok(cookie) if cookie.len() == COOKIE_LEN => Ok(cookie),
            Ok(cookie) => {
                warn!(cookie = %RedactedBytes(&cookie), "Unexpected cookie length");
                Err(StartError::CookieUnreadable)
            }
            Err(e) => {
                warn!("Cannot read {}: {}", path.display(), e);
                Err(StartError::CookieUnreadable)
            }
        }
    }
}

#[async_trait]
impl TorLauncher for DaemonLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<Box<dyn TorProcess>, StartError> {
        self.prepare_files(&request).await?;

        let mut conf = self.base_conf(&request);
        conf.extend(request.conf.clone());

        info!(
            binary = %self.config.tor_binary.display(),
            entries = conf.len(),
            "Launching tor"
        );

        let mut child = Command::new(&self.config.tor_binary)
            .arg("--ignore-missing-torrc")
            .arg("-f")
            .arg(self.config.data_dir.join("torrc"))
            .args(conf.to_arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StartError::Launch(format!("{}: {}", self.config.tor_binary.display(), e)))?;

        let addr = self.wait_for_control_port(&mut child).await?;
        debug!(addr = %addr, "Control port published");

        let mut control = ControlConnection::connect(&addr).await?;
        let cookie = self.read_cookie().await?;

        control.authenticate(&cookie).await.map_err(|e| match e {
            ControlError::Rejected { message, .. } => StartError::Authentication(message),
            other => StartError::Control(other),
        })?;
        control.take_ownership().await?;
        control.set_events(&["STATUS_CLIENT"]).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let translator = match control.take_events() {
            Some(mut events) => tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    if let Some(tor_event) = TorEvent::from_event(&event) {
                        if event_tx.send(tor_event).is_err() {
                            break;
                        }
                    }
                }
            }),
            None => return Err(StartError::Launch("control events unavailable".into())),
        };

        Ok(Box::new(DaemonProcess {
            child,
            control,
            events: Some(event_rx),
            translator,
        }))
    }
}

/// tor daemon owned by this process
pub struct DaemonProcess {
    child: Child,
    control: ControlConnection,
    events: Option<mpsc::UnboundedReceiver<TorEvent>>,
    translator: JoinHandle<()>,
}

#[async_trait]
impl TorProcess for DaemonProcess {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TorEvent>> {
        self.events.take()
    }

    async fn get_info(&mut self, keys: &[&str]) -> Result<Vec<String>, ControlError> {
        self.control.get_info(keys).await
    }

    async fn set_conf(&mut self, conf: &TorConf) -> Result<(), ControlError> {
        self.control.set_conf(conf).await
    }

    async fn reset_conf(&mut self, key: &ConfKey) -> Result<(), ControlError> {
        self.control.reset_conf(key).await
    }

    async fn circuits(&mut self) -> Result<Vec<Circuit>, ControlError> {
        let status = self.control.get_info(&["circuit-status"]).await?;
        let lines: Vec<&str> = status.iter().flat_map(|s| s.lines()).collect();
        Ok(Circuit::parse_status(&lines))
    }

    async fn resolve_node(&mut self, node: &mut Node) {
        if let Some(fingerprint) = node.fingerprint.clone() {
            let key = format!("ns/id/{}", fingerprint);
            match self.control.get_info(&[&key]).await {
                Ok(values) => {
                    let lines: Vec<String> = values
                        .iter()
                        .flat_map(|v| v.lines().map(String::from))
                        .collect();
                    node.apply_router_status(&lines);
                }
                Err(e) => debug!(fingerprint = %fingerprint, "No router status: {}", e),
            }
        }

        if let Some(address) = node.address().map(String::from) {
            let key = format!("ip-to-country/{}", address);
            if let Ok(values) = self.control.get_info(&[&key]).await {
                node.country_code = values
                    .into_iter()
                    .next()
                    .filter(|cc| !cc.is_empty() && cc != "??");
            }
        }
    }

    async fn close_circuit(&mut self, id: &str) -> Result<bool, ControlError> {
        self.control.close_circuit(id).await
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.control.signal("SHUTDOWN").await {
            debug!("SHUTDOWN signal failed: {}", e);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => info!("tor exited ({})", status),
            Ok(Err(e)) => warn!("Waiting for tor failed: {}", e),
            Err(_) => {
                warn!("tor did not exit in time, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill tor: {}", e);
                }
            }
        }
    }
}

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        self.translator.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(line: &str) -> AsyncEvent {
        AsyncEvent {
            lines: vec![line.to_string()],
        }
    }

    #[test]
    fn test_bootstrap_event() {
        let e = event(r#"STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=45 TAG=loading_keys SUMMARY="Loading authority key certs""#);
        assert_eq!(TorEvent::from_event(&e), Some(TorEvent::Bootstrap(45)));
    }

    #[test]
    fn test_circuit_established_event() {
        let e = event("STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED");
        assert_eq!(TorEvent::from_event(&e), Some(TorEvent::CircuitEstablished));
    }

    #[test]
    fn test_unrelated_events() {
        assert_eq!(TorEvent::from_event(&event("STATUS_GENERAL NOTICE CLOCK_JUMPED TIME=5")), None);
        assert_eq!(TorEvent::from_event(&event("STATUS_CLIENT WARN ENOUGH_DIR_INFO")), None);
        assert_eq!(TorEvent::from_event(&event("STATUS_CLIENT NOTICE BOOTSTRAP TAG=done")), None);
    }

    #[test]
    fn test_base_conf() {
        let config = TunnelConfig::default();
        let launcher = DaemonLauncher::new(config.clone());
        let request = LaunchRequest {
            conf: TorConf::new(),
            socks_port: 12345,
            dns_port: 12346,
            log_file: Some(PathBuf::from("/tmp/veil/tor.log")),
        };

        let conf = launcher.base_conf(&request);
        let args = conf.to_arguments();

        assert_eq!(&args[..4], ["--SocksPort", "12345", "--DNSPort", "12346"]);
        assert_eq!(conf.get(&ConfKey::Other("MaxMemInQueues".into())), Some("5MB"));
        assert_eq!(
            conf.get(&ConfKey::Other("Log".into())),
            Some("notice file /tmp/veil/tor.log")
        );
        assert_eq!(
            conf.get(&ConfKey::Other("CookieAuthFile".into())),
            Some(config.cookie_file().display().to_string().as_str())
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails_launch() {
        let dir = tempfile::tempdir().unwrap();
        let config = TunnelConfig {
            tor_binary: dir.path().join("no-such-tor"),
            data_dir: dir.path().join("tor"),
            ..TunnelConfig::default()
        };
        let request = LaunchRequest {
            conf: TorConf::new(),
            socks_port: 12345,
            dns_port: 12346,
            log_file: Some(dir.path().join("logs").join("tor.log")),
        };

        let result = DaemonLauncher::new(config).launch(request).await;

        assert!(matches!(result, Err(StartError::Launch(_))));
        assert!(dir.path().join("logs").join("tor.log").exists());
    }
}
