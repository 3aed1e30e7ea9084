//! Control Port Client
//!
//! Speaks tor's line-based control protocol over TCP. A background reader
//! task splits the stream into command replies and asynchronous `650`
//! events, so events arriving between commands are never mistaken for a
//! reply.
//!
//! ```text
//! 250-key=value        continuation
//! 250+key=             data block, ends with a lone "."
//! 250 OK               final line
//! 650 STATUS_CLIENT .. async event
//! ```

use crate::conf::{ConfKey, TorConf};
use crate::logging::{RedactedBytes, RedactedCommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Reply code for "unknown circuit"
const UNKNOWN_CIRCUIT: u16 = 552;

/// Reply code for asynchronous events
const ASYNC_EVENT: u16 = 650;

/// One line of a reply, with its data block if it had one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub text: String,
    pub data: Vec<String>,
}

/// Complete reply to one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<ReplyLine>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Text of the final line
    pub fn message(&self) -> &str {
        self.lines.last().map(|l| l.text.as_str()).unwrap_or("")
    }
}

/// Asynchronous event (`650`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncEvent {
    pub lines: Vec<String>,
}

/// Control port errors
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Control port I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Command rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Malformed control reply: {0}")]
    Malformed(String),

    #[error("Control connection closed")]
    Closed,
}

/// Authenticated control-port session
pub struct ControlConnection {
    writer: OwnedWriteHalf,
    replies: mpsc::UnboundedReceiver<Result<Reply, ControlError>>,
    events: Option<mpsc::UnboundedReceiver<AsyncEvent>>,
    reader: JoinHandle<()>,
}

impl ControlConnection {
    /// Connect to a control port
    pub async fn connect(addr: &str) -> Result<Self, ControlError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, reply_tx, event_tx));

        debug!(addr, "Connected to control port");

        Ok(Self {
            writer: write_half,
            replies: reply_rx,
            events: Some(event_rx),
            reader,
        })
    }

    /// Send a command and wait for its reply
    ///
    /// Non-2xx replies become [`ControlError::Rejected`].
    pub async fn command(&mut self, cmd: &str) -> Result<Reply, ControlError> {
        trace!(command = %RedactedCommand(cmd), "Sending control command");

        self.writer.write_all(format!("{}\r\n", cmd).as_bytes()).await?;
        self.writer.flush().await?;

        let reply = self.replies.recv().await.ok_or(ControlError::Closed)??;

        if reply.is_ok() {
            Ok(reply)
        } else {
            Err(ControlError::Rejected {
                code: reply.code,
                message: reply.message().to_string(),
            })
        }
    }

    /// Cookie authentication
    pub async fn authenticate(&mut self, cookie: &[u8]) -> Result<(), ControlError> {
        debug!(cookie = %RedactedBytes(cookie), "Authenticating");

        self.command(&format!("AUTHENTICATE {}", hex::encode(cookie)))
            .await?;

        info!("Authenticated with tor control port");
        Ok(())
    }

    /// Make tor exit when this connection closes
    pub async fn take_ownership(&mut self) -> Result<(), ControlError> {
        self.command("TAKEOWNERSHIP").await.map(drop)
    }

    /// Subscribe to event types
    pub async fn set_events(&mut self, events: &[&str]) -> Result<(), ControlError> {
        self.command(&format!("SETEVENTS {}", events.join(" ")))
            .await
            .map(drop)
    }

    /// Query values, returned in the order of `keys`
    ///
    /// Data-block values are joined with newlines.
    pub async fn get_info(&mut self, keys: &[&str]) -> Result<Vec<String>, ControlError> {
        let reply = self.command(&format!("GETINFO {}", keys.join(" "))).await?;

        let mut found: Vec<(String, String)> = Vec::new();
        for line in &reply.lines {
            if let Some((key, value)) = line.text.split_once('=') {
                let value = if line.data.is_empty() {
                    value.to_string()
                } else {
                    line.data.join("\n")
                };
                found.push((key.to_string(), value));
            }
        }

        keys.iter()
            .map(|key| {
                found
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| ControlError::Malformed(format!("no value for {}", key)))
            })
            .collect()
    }

    /// Apply entries in one `SETCONF`
    ///
    /// Repeated keys are sent repeatedly, which tor treats as a list.
    pub async fn set_conf(&mut self, conf: &TorConf) -> Result<(), ControlError> {
        if conf.is_empty() {
            return Ok(());
        }

        let args: Vec<String> = conf
            .to_pairs()
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, quote(&value)))
            .collect();

        self.command(&format!("SETCONF {}", args.join(" ")))
            .await
            .map(drop)
    }

    /// Reset a key to tor's default
    pub async fn reset_conf(&mut self, key: &ConfKey) -> Result<(), ControlError> {
        self.command(&format!("RESETCONF {}", key)).await.map(drop)
    }

    /// Close a circuit; `false` when tor does not know it
    pub async fn close_circuit(&mut self, id: &str) -> Result<bool, ControlError> {
        match self.command(&format!("CLOSECIRCUIT {}", id)).await {
            Ok(_) => Ok(true),
            Err(ControlError::Rejected { code: UNKNOWN_CIRCUIT, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Send a signal (`SHUTDOWN`, `NEWNYM`, ...)
    pub async fn signal(&mut self, signal: &str) -> Result<(), ControlError> {
        self.command(&format!("SIGNAL {}", signal)).await.map(drop)
    }

    /// Hand out the event stream; only the first caller gets it
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<AsyncEvent>> {
        self.events.take()
    }
}

impl Drop for ControlConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    replies: mpsc::UnboundedSender<Result<Reply, ControlError>>,
    events: mpsc::UnboundedSender<AsyncEvent>,
) {
    let mut reader = BufReader::new(read_half);
    let mut pending: Vec<ReplyLine> = Vec::new();

    loop {
        let line = match read_line(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = replies.send(Err(e.into()));
                break;
            }
        };

        if line.is_empty() {
            continue;
        }

        let (code, separator, text) = match split_status_line(&line) {
            Some(parts) => parts,
            None => {
                warn!("Skipping malformed control line");
                let _ = replies.send(Err(ControlError::Malformed(line)));
                pending.clear();
                continue;
            }
        };

        let mut reply_line = ReplyLine {
            text: text.to_string(),
            data: Vec::new(),
        };

        if separator == '+' {
            match read_data_block(&mut reader).await {
                Ok(data) => reply_line.data = data,
                Err(e) => {
                    let _ = replies.send(Err(e.into()));
                    break;
                }
            }
        }

        pending.push(reply_line);

        if separator != ' ' {
            continue;
        }

        let lines = std::mem::take(&mut pending);
        if code == ASYNC_EVENT {
            let event = AsyncEvent {
                lines: lines.into_iter().map(|l| l.text).collect(),
            };
            // Nobody listening is fine.
            let _ = events.send(event);
        } else if replies.send(Ok(Reply { code, lines })).is_err() {
            break;
        }
    }

    debug!("Control port reader finished");
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn read_data_block(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Vec<String>> {
    let mut data = Vec::new();

    while let Some(line) = read_line(reader).await? {
        if line == "." {
            return Ok(data);
        }
        // Leading dots are doubled on the wire.
        let line = line
            .strip_prefix('.')
            .filter(|l| l.starts_with('.'))
            .unwrap_or(line.as_str());
        data.push(line.to_string());
    }

    Err(std::io::ErrorKind::UnexpectedEof.into())
}

/// Split `NNN<sep>text`
fn split_status_line(line: &str) -> Option<(u16, char, &str)> {
    let code = line.get(..3)?.parse().ok()?;
    let separator = line.get(3..4)?.chars().next()?;
    if !matches!(separator, ' ' | '-' | '+') {
        return None;
    }
    Some((code, separator, line.get(4..)?))
}

/// Quote a value for SETCONF
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Parse `KEY=VALUE` pairs; values may be quoted with backslash escapes
pub(crate) fn parse_keywords(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let key: String = std::iter::from_fn(|| chars.next_if(|c| *c != '=' && !c.is_whitespace()))
            .collect();
        if key.is_empty() {
            break;
        }

        if chars.next_if_eq(&'=').is_none() {
            // Bare positional word.
            continue;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            while let Some(c) = chars.next() {
                match c {
                    '"' => break,
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    c => value.push(c),
                }
            }
        } else {
            value.extend(std::iter::from_fn(|| chars.next_if(|c| !c.is_whitespace())));
        }

        pairs.push((key, value));
    }

    pairs
}

/// Address in tor's `ControlPortWriteToFile` output (`PORT=127.0.0.1:9051`)
pub fn parse_control_port_file(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.trim().strip_prefix("PORT="))
        .filter(|addr| !addr.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve one connection, answering each received line with the next script entry
    async fn fake_tor(script: Vec<&'static str>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut received = Vec::new();

            for answer in script {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                received.push(line.trim_end().to_string());
                write_half.write_all(answer.as_bytes()).await.unwrap();
            }

            drop(write_half);
            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest).await;
            received
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn test_get_info_with_data_block_and_event() {
        let (addr, server) = fake_tor(vec![
            "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=50 TAG=loading_descriptors\r\n\
             250+circuit-status=\r\n\
             1 BUILT $AAAA~a,$BBBB~b PURPOSE=GENERAL\r\n\
             ..dotted\r\n\
             .\r\n\
             250-version=0.4.8.10\r\n\
             250 OK\r\n",
        ])
        .await;

        let mut conn = ControlConnection::connect(&addr).await.unwrap();
        let mut events = conn.take_events().unwrap();
        assert!(conn.take_events().is_none());

        let values = conn.get_info(&["version", "circuit-status"]).await.unwrap();
        assert_eq!(values[0], "0.4.8.10");
        assert_eq!(values[1], "1 BUILT $AAAA~a,$BBBB~b PURPOSE=GENERAL\n.dotted");

        let event = events.recv().await.unwrap();
        assert!(event.lines[0].starts_with("STATUS_CLIENT "));

        drop(conn);
        assert_eq!(server.await.unwrap(), ["GETINFO version circuit-status"]);
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let (addr, _server) = fake_tor(vec!["552 Unrecognized option\r\n"]).await;
        let mut conn = ControlConnection::connect(&addr).await.unwrap();

        let err = conn.reset_conf(&ConfKey::Other("Bogus".into())).await.unwrap_err();
        assert!(matches!(err, ControlError::Rejected { code: 552, .. }));
    }

    #[tokio::test]
    async fn test_close_unknown_circuit() {
        let (addr, _server) = fake_tor(vec![
            "250 OK\r\n",
            "552 Unknown circuit \"99\"\r\n",
        ])
        .await;
        let mut conn = ControlConnection::connect(&addr).await.unwrap();

        assert!(conn.close_circuit("5").await.unwrap());
        assert!(!conn.close_circuit("99").await.unwrap());
    }

    #[tokio::test]
    async fn test_authenticate_and_setconf() {
        let (addr, server) = fake_tor(vec!["250 OK\r\n", "250 OK\r\n", "250 OK\r\n"]).await;
        let mut conn = ControlConnection::connect(&addr).await.unwrap();

        conn.authenticate(&[0xde, 0xad]).await.unwrap();

        let mut conf = TorConf::new();
        conf.push(ConfKey::Bridge, "obfs4 1.2.3.4:443 cert=\"x\"");
        conf.push(ConfKey::UseBridges, "1");
        conn.set_conf(&conf).await.unwrap();
        conn.set_conf(&TorConf::new()).await.unwrap();
        conn.signal("SHUTDOWN").await.unwrap();

        drop(conn);
        assert_eq!(
            server.await.unwrap(),
            [
                "AUTHENTICATE dead",
                r#"SETCONF Bridge="obfs4 1.2.3.4:443 cert=\"x\"" UseBridges="1""#,
                "SIGNAL SHUTDOWN",
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (addr, _server) = fake_tor(vec![]).await;
        let mut conn = ControlConnection::connect(&addr).await.unwrap();

        assert!(conn.take_ownership().await.is_err());
    }

    #[test]
    fn test_parse_keywords() {
        let pairs = parse_keywords(r#"NOTICE PROGRESS=85 SUMMARY="Loading \"relay\" descriptors" TAG=ap_conn"#);

        assert_eq!(
            pairs,
            [
                ("PROGRESS".to_string(), "85".to_string()),
                ("SUMMARY".to_string(), r#"Loading "relay" descriptors"#.to_string()),
                ("TAG".to_string(), "ap_conn".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_control_port_file() {
        assert_eq!(
            parse_control_port_file("PORT=127.0.0.1:39051\n").as_deref(),
            Some("127.0.0.1:39051")
        );
        assert_eq!(parse_control_port_file(""), None);
    }

    #[test]
    fn test_split_status_line() {
        assert_eq!(split_status_line("250-OK"), Some((250, '-', "OK")));
        assert_eq!(split_status_line("25"), None);
        assert_eq!(split_status_line("abc def"), None);
    }
}
