//! Volunteer Relay
//!
//! Runs a snowflake proxy next to the tunnel so censored users can connect
//! through this machine. Independent of the tunnel's own state.
//!
//! Each relayed client session bumps the persisted `sessions_helped`
//! counter and publishes [`TunnelEvent::StatusChanged`].

use crate::config::RelayConfig;
use crate::events::{EventBus, TunnelEvent};
use crate::settings::SettingsStore;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Clients the relay serves at once
pub const RELAY_CAPACITY: u32 = 1;

/// Called once per relayed client session
pub type SessionHook = Arc<dyn Fn() + Send + Sync>;

/// Relay start parameters
#[derive(Clone)]
pub struct RelayOptions {
    /// Simultaneous clients
    pub capacity: u32,
    /// Log file, truncated on start
    pub log_file: Option<PathBuf>,
    pub on_session: SessionHook,
}

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Relay could not be started: {0}")]
    Spawn(String),

    #[error("Relay I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Starts relay processes
#[async_trait]
pub trait RelayLauncher: Send + Sync {
    async fn start(&self, options: RelayOptions) -> Result<Box<dyn RelayHandle>, RelayError>;
}

/// A started relay
#[async_trait]
pub trait RelayHandle: Send {
    fn is_running(&self) -> bool;

    async fn stop(self: Box<Self>);
}

/// Toggles the relay and owns its session counter
pub struct RelayCoordinator {
    launcher: Arc<dyn RelayLauncher>,
    settings: Arc<SettingsStore>,
    events: EventBus,
    config: RelayConfig,
    relay: Mutex<Option<Box<dyn RelayHandle>>>,
}

impl RelayCoordinator {
    pub fn new(
        launcher: Arc<dyn RelayLauncher>,
        settings: Arc<SettingsStore>,
        events: EventBus,
        config: RelayConfig,
    ) -> Self {
        Self {
            launcher,
            settings,
            events,
            config,
            relay: Mutex::new(None),
        }
    }

    /// Stop a running relay or start a stopped one; returns the new state
    ///
    /// `StatusChanged` is published either way.
    pub async fn toggle(&self) -> Result<bool, RelayError> {
        let result = self.toggle_inner().await;
        self.events.publish(TunnelEvent::StatusChanged);
        result
    }

    async fn toggle_inner(&self) -> Result<bool, RelayError> {
        let mut relay = self.relay.lock().await;

        match relay.take() {
            Some(handle) if handle.is_running() => {
                info!("Stopping relay");
                handle.stop().await;
                Ok(false)
            }
            _ => {
                info!(capacity = RELAY_CAPACITY, "Starting relay");
                let handle = self.launcher.start(self.options()).await?;
                *relay = Some(handle);
                Ok(true)
            }
        }
    }

    fn options(&self) -> RelayOptions {
        let settings = Arc::clone(&self.settings);
        let events = self.events.clone();

        RelayOptions {
            capacity: RELAY_CAPACITY,
            log_file: self.config.log_file.clone(),
            on_session: Arc::new(move || {
                match settings.increment_sessions_helped() {
                    Ok(total) => debug!(total, "Relayed a session"),
                    Err(e) => warn!("Failed to store session count: {}", e),
                }
                events.publish(TunnelEvent::StatusChanged);
            }),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.relay
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| handle.is_running())
    }

    pub fn sessions_helped(&self) -> u64 {
        self.settings.sessions_helped()
    }

    /// Stop the relay if it runs, without publishing
    pub async fn shutdown(&self) {
        if let Some(handle) = self.relay.lock().await.take() {
            handle.stop().await;
        }
    }
}

/// Runs the `snowflake-proxy` executable
pub struct SnowflakeProxyLauncher {
    binary: PathBuf,
    session_marker: String,
}

impl SnowflakeProxyLauncher {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            session_marker: config.session_marker.clone(),
        }
    }
}

#[async_trait]
impl RelayLauncher for SnowflakeProxyLauncher {
    async fn start(&self, options: RelayOptions) -> Result<Box<dyn RelayHandle>, RelayError> {
        let log = match &options.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                Some(tokio::fs::File::create(path).await?)
            }
            None => None,
        };

        let mut child = Command::new(&self.binary)
            .arg("-capacity")
            .arg(options.capacity.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Spawn(format!("{}: {}", self.binary.display(), e)))?;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx));
        }
        tokio::spawn(watch_output(
            line_rx,
            log,
            self.session_marker.clone(),
            options.on_session,
        ));

        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let flag = Arc::clone(&running);

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = stop_rx => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to stop relay: {}", e);
                    }
                }
                status = child.wait() => match status {
                    Ok(status) => warn!("Relay exited ({})", status),
                    Err(e) => warn!("Waiting for relay failed: {}", e),
                },
            }
            flag.store(false, Ordering::SeqCst);
        });

        Ok(Box::new(SnowflakeHandle {
            running,
            stop: Some(stop_tx),
            task,
        }))
    }
}

struct SnowflakeHandle {
    running: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

#[async_trait]
impl RelayHandle for SnowflakeHandle {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(mut self: Box<Self>) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Relay task failed: {}", e);
        }
    }
}

async fn forward_lines<R>(stream: R, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if lines.send(line).is_err() {
            break;
        }
    }
}

/// Tee relay output into the log file and fire the hook per session
async fn watch_output(
    mut lines: mpsc::UnboundedReceiver<String>,
    mut log: Option<tokio::fs::File>,
    marker: String,
    on_session: SessionHook,
) {
    while let Some(line) = lines.recv().await {
        if let Some(file) = log.as_mut() {
            if let Err(e) = append_line(file, &line).await {
                warn!("Relay log no longer writable: {}", e);
                log = None;
            }
        }

        if is_session_line(&line, &marker) {
            on_session();
        }
    }
}

async fn append_line(file: &mut tokio::fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

fn is_session_line(line: &str, marker: &str) -> bool {
    !marker.is_empty() && line.contains(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_session_marker() {
        let marker = RelayConfig::default().session_marker;

        assert!(is_session_line("2024/05/01 10:00:00 connected to client 1.2.3.4", &marker));
        assert!(!is_session_line("2024/05/01 10:00:00 starting proxy", &marker));
        assert!(!is_session_line("anything", ""));
    }

    #[tokio::test]
    async fn test_watch_output_tees_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.log");
        let file = tokio::fs::File::create(&path).await.unwrap();

        let sessions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sessions);
        let hook: SessionHook = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, rx) = mpsc::unbounded_channel();
        for line in ["proxy started", "connected to client", "connected to client"] {
            tx.send(line.to_string()).unwrap();
        }
        drop(tx);

        watch_output(rx, Some(file), "connected to client".into(), hook).await;

        assert_eq!(sessions.load(Ordering::SeqCst), 2);
        let log = std::fs::read_to_string(&path).unwrap();
        assert_eq!(log.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig {
            binary: dir.path().join("no-such-proxy"),
            ..RelayConfig::default()
        };
        let options = RelayOptions {
            capacity: RELAY_CAPACITY,
            log_file: None,
            on_session: Arc::new(|| {}),
        };

        let result = SnowflakeProxyLauncher::new(&config).start(options).await;
        assert!(matches!(result, Err(RelayError::Spawn(_))));
    }
}
