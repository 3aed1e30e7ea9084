//! Circuits
//!
//! Parsed `GETINFO circuit-status` output and the nodes along each path.

use crate::control::parse_keywords;
use std::fmt;

/// Circuit build state as reported by tor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitStatus {
    Launched,
    Built,
    GuardWait,
    Extended,
    Failed,
    Closed,
    Other(String),
}

impl CircuitStatus {
    fn parse(s: &str) -> Self {
        match s {
            "LAUNCHED" => CircuitStatus::Launched,
            "BUILT" => CircuitStatus::Built,
            "GUARD_WAIT" => CircuitStatus::GuardWait,
            "EXTENDED" => CircuitStatus::Extended,
            "FAILED" => CircuitStatus::Failed,
            "CLOSED" => CircuitStatus::Closed,
            other => CircuitStatus::Other(other.to_string()),
        }
    }
}

/// One relay on a circuit path
///
/// Every field is optional; [`Node::display_name`] falls back through
/// nickname, fingerprint, IPv4 and IPv6 address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub nickname: Option<String>,
    pub fingerprint: Option<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub country_code: Option<String>,
}

impl Node {
    /// Parse a path element: `$FP~nick`, `$FP=nick`, `$FP` or `nick`
    pub fn parse_path_element(element: &str) -> Self {
        let mut node = Node::default();

        match element.strip_prefix('$') {
            Some(rest) => {
                let (fingerprint, nickname) = match rest.split_once(['~', '=']) {
                    Some((fp, nick)) => (fp, Some(nick)),
                    None => (rest, None),
                };
                node.fingerprint = Some(fingerprint.to_string()).filter(|f| !f.is_empty());
                node.nickname = nickname.filter(|n| !n.is_empty()).map(String::from);
            }
            None if !element.is_empty() => node.nickname = Some(element.to_string()),
            None => {}
        }

        node
    }

    /// Fill addresses from a router status entry (`GETINFO ns/id/<fp>`)
    ///
    /// ```text
    /// r <nick> <identity> <digest> <date> <time> <IPv4> <ORPort> <DirPort>
    /// a [<IPv6>]:<port>
    /// ```
    pub fn apply_router_status(&mut self, lines: &[String]) {
        for line in lines {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("r") => {
                    let fields: Vec<&str> = parts.collect();
                    if self.nickname.is_none() {
                        self.nickname = fields.first().map(|s| s.to_string());
                    }
                    if let Some(ip) = fields.get(5) {
                        self.ipv4_address = Some(ip.to_string());
                    }
                }
                Some("a") => {
                    if let Some(addr) = parts.next() {
                        if let Some(ip) = addr.strip_prefix('[').and_then(|a| a.split_once(']')) {
                            self.ipv6_address = Some(ip.0.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Best address for a country lookup
    pub fn address(&self) -> Option<&str> {
        self.ipv4_address.as_deref().or(self.ipv6_address.as_deref())
    }

    /// Display label, falling back through the available identifiers
    pub fn display_name(&self) -> &str {
        self.nickname
            .as_deref()
            .or(self.fingerprint.as_deref())
            .or(self.ipv4_address.as_deref())
            .or(self.ipv6_address.as_deref())
            .unwrap_or("unknown node")
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.country_code {
            Some(cc) => write!(f, "{} ({})", self.display_name(), cc.to_uppercase()),
            None => f.write_str(self.display_name()),
        }
    }
}

/// A circuit built by the tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    pub id: String,
    pub status: CircuitStatus,
    pub nodes: Vec<Node>,
    pub build_flags: Vec<String>,
    pub purpose: Option<String>,
}

impl Circuit {
    /// Parse one `circuit-status` line
    ///
    /// `<id> <status> [<path>] [BUILD_FLAGS=..] [PURPOSE=..] ...`
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(3, ' ');
        let id = parts.next().filter(|s| !s.is_empty())?.to_string();
        let status = CircuitStatus::parse(parts.next()?);
        let rest = parts.next().unwrap_or("");

        // A path starts with '$' or has no '='; keywords always have one.
        let is_path = |token: &str| token.starts_with('$') || !token.contains('=');
        let (path, keywords) = match rest.split_once(' ') {
            Some((first, tail)) if is_path(first) => (first, tail),
            None if is_path(rest) => (rest, ""),
            _ => ("", rest),
        };

        let nodes = path
            .split(',')
            .filter(|p| !p.is_empty())
            .map(Node::parse_path_element)
            .collect();

        let mut circuit = Circuit {
            id,
            status,
            nodes,
            build_flags: Vec::new(),
            purpose: None,
        };

        for (key, value) in parse_keywords(keywords) {
            match key.as_str() {
                "BUILD_FLAGS" => {
                    circuit.build_flags = value.split(',').map(String::from).collect();
                }
                "PURPOSE" => circuit.purpose = Some(value),
                _ => {}
            }
        }

        Some(circuit)
    }

    /// Parse the full `circuit-status` payload
    pub fn parse_status<S: AsRef<str>>(lines: &[S]) -> Vec<Circuit> {
        lines
            .iter()
            .filter_map(|line| Circuit::parse(line.as_ref()))
            .collect()
    }

    /// Is this a built, general-purpose circuit carrying user traffic?
    pub fn is_user_facing(&self) -> bool {
        let general = self.purpose.as_deref().is_none_or(|p| p == "GENERAL");
        let housekeeping = self
            .build_flags
            .iter()
            .any(|f| f == "IS_INTERNAL" || f == "ONEHOP_TUNNEL");

        self.status == CircuitStatus::Built && general && !housekeeping
    }

    /// Drop internal and housekeeping circuits
    pub fn filter(circuits: Vec<Circuit>) -> Vec<Circuit> {
        circuits.into_iter().filter(Circuit::is_user_facing).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &[&str] = &[
        "5 BUILT $AAAA1111~guard,$BBBB2222~middle,$CCCC3333~exit BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL TIME_CREATED=2024-05-01T10:00:00.000000",
        "6 BUILT $AAAA1111~guard,$DDDD4444~hsdir BUILD_FLAGS=IS_INTERNAL,NEED_CAPACITY PURPOSE=HS_CLIENT_HSDIR",
        "7 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL",
        "8 BUILT $AAAA1111~guard BUILD_FLAGS=ONEHOP_TUNNEL,IS_INTERNAL PURPOSE=GENERAL",
    ];

    #[test]
    fn test_parse_built_circuit() {
        let circuit = Circuit::parse(STATUS[0]).unwrap();

        assert_eq!(circuit.id, "5");
        assert_eq!(circuit.status, CircuitStatus::Built);
        assert_eq!(circuit.nodes.len(), 3);
        assert_eq!(circuit.nodes[2].nickname.as_deref(), Some("exit"));
        assert_eq!(circuit.nodes[0].fingerprint.as_deref(), Some("AAAA1111"));
        assert_eq!(circuit.purpose.as_deref(), Some("GENERAL"));
    }

    #[test]
    fn test_parse_without_path() {
        let circuit = Circuit::parse(STATUS[2]).unwrap();

        assert_eq!(circuit.status, CircuitStatus::Launched);
        assert!(circuit.nodes.is_empty());
        assert_eq!(circuit.build_flags, ["NEED_CAPACITY"]);
    }

    #[test]
    fn test_parse_legacy_path() {
        let circuit = Circuit::parse("9 EXTENDED $AAAA1111=guard PURPOSE=GENERAL").unwrap();

        assert_eq!(circuit.nodes[0].nickname.as_deref(), Some("guard"));
        assert_eq!(circuit.status, CircuitStatus::Extended);
        assert!(!circuit.is_user_facing());
    }

    #[test]
    fn test_filter_housekeeping() {
        let circuits = Circuit::filter(Circuit::parse_status(STATUS));

        assert_eq!(circuits.len(), 1);
        assert_eq!(circuits[0].id, "5");
    }

    #[test]
    fn test_display_fallback() {
        let mut node = Node::default();
        assert_eq!(node.display_name(), "unknown node");

        node.ipv6_address = Some("2001:db8::1".into());
        assert_eq!(node.display_name(), "2001:db8::1");

        node.ipv4_address = Some("192.0.2.1".into());
        assert_eq!(node.display_name(), "192.0.2.1");

        node.fingerprint = Some("ABCD".into());
        assert_eq!(node.display_name(), "ABCD");

        node.nickname = Some("relay".into());
        node.country_code = Some("de".into());
        assert_eq!(node.to_string(), "relay (DE)");
    }

    #[test]
    fn test_router_status() {
        let mut node = Node::parse_path_element("$AAAA1111");
        node.apply_router_status(&[
            "r relay qUVQ0srL1JI DIGEST 2024-05-01 10:00:00 192.0.2.7 9001 0".to_string(),
            "a [2001:db8::7]:9001".to_string(),
            "s Fast Guard Running Stable Valid".to_string(),
        ]);

        assert_eq!(node.nickname.as_deref(), Some("relay"));
        assert_eq!(node.ipv4_address.as_deref(), Some("192.0.2.7"));
        assert_eq!(node.ipv6_address.as_deref(), Some("2001:db8::7"));
        assert_eq!(node.address(), Some("192.0.2.7"));
    }
}
