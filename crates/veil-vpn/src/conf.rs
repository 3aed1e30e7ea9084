//! Tor Configuration Arguments
//!
//! A closed, typed set of configuration keys and an ordered list of
//! `(key, value)` entries. Entries stay typed until they reach the process
//! boundary, where they become command-line arguments or `SETCONF` pairs.

use std::fmt;

/// Configuration key understood by the tor process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConfKey {
    /// `"0"` or `"1"`
    UseBridges,
    /// One bridge line per entry
    Bridge,
    /// `<transport> socks5 <host:port>`
    ClientTransportPlugin,
    EntryNodes,
    ExitNodes,
    ExcludeNodes,
    /// `"0"` or `"1"`, only meaningful together with `ExcludeNodes`
    StrictNodes,
    ClientUseIPv4,
    ClientUseIPv6,
    ClientPreferIPv6ORPort,
    /// Any other key (fixed options, user-supplied advanced lines)
    Other(String),
}

/// Keys reset before a live reconfiguration re-applies node and transport entries
pub const RESET_KEYS: [ConfKey; 7] = [
    ConfKey::UseBridges,
    ConfKey::ClientTransportPlugin,
    ConfKey::Bridge,
    ConfKey::EntryNodes,
    ConfKey::ExitNodes,
    ConfKey::ExcludeNodes,
    ConfKey::StrictNodes,
];

impl ConfKey {
    /// Wire name of the key
    pub fn as_str(&self) -> &str {
        match self {
            ConfKey::UseBridges => "UseBridges",
            ConfKey::Bridge => "Bridge",
            ConfKey::ClientTransportPlugin => "ClientTransportPlugin",
            ConfKey::EntryNodes => "EntryNodes",
            ConfKey::ExitNodes => "ExitNodes",
            ConfKey::ExcludeNodes => "ExcludeNodes",
            ConfKey::StrictNodes => "StrictNodes",
            ConfKey::ClientUseIPv4 => "ClientUseIPv4",
            ConfKey::ClientUseIPv6 => "ClientUseIPv6",
            ConfKey::ClientPreferIPv6ORPort => "ClientPreferIPv6ORPort",
            ConfKey::Other(name) => name,
        }
    }

    /// Map a wire name back to a key (case-insensitive, as tor is)
    pub fn parse(name: &str) -> Self {
        let name = name.trim_start_matches("--");

        [
            ConfKey::UseBridges,
            ConfKey::Bridge,
            ConfKey::ClientTransportPlugin,
            ConfKey::EntryNodes,
            ConfKey::ExitNodes,
            ConfKey::ExcludeNodes,
            ConfKey::StrictNodes,
            ConfKey::ClientUseIPv4,
            ConfKey::ClientUseIPv6,
            ConfKey::ClientPreferIPv6ORPort,
        ]
        .into_iter()
        .find(|key| key.as_str().eq_ignore_ascii_case(name))
        .unwrap_or_else(|| ConfKey::Other(name.to_string()))
    }
}

impl fmt::Display for ConfKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configuration entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfEntry {
    pub key: ConfKey,
    pub value: String,
}

impl ConfEntry {
    pub fn new(key: ConfKey, value: impl Into<String>) -> Self {
        Self { key, value: value.into() }
    }

    /// Boolean entry rendered as `"0"` / `"1"`
    pub fn flag(key: ConfKey, on: bool) -> Self {
        Self::new(key, if on { "1" } else { "0" })
    }

    /// Parse a `Key value` line (the format of user-supplied advanced lines)
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key, value.trim()),
            None => (line, ""),
        };

        Some(Self::new(ConfKey::parse(key), value))
    }
}

/// Ordered configuration-argument set
///
/// Insertion order is kept so the same inputs always render the same
/// arguments. An identical `(key, value)` pair is never stored twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TorConf {
    entries: Vec<ConfEntry>,
}

impl TorConf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry unless the identical entry is already present
    pub fn push(&mut self, key: ConfKey, value: impl Into<String>) -> bool {
        self.push_entry(ConfEntry::new(key, value))
    }

    /// Append a prepared entry unless it is already present
    pub fn push_entry(&mut self, entry: ConfEntry) -> bool {
        if self.entries.contains(&entry) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Append every entry of `other`, skipping duplicates
    pub fn extend(&mut self, other: TorConf) {
        for entry in other.entries {
            self.push_entry(entry);
        }
    }

    /// Append entries of `other` whose key is not present yet
    pub fn extend_absent(&mut self, other: TorConf) {
        for entry in other.entries {
            if !self.contains_key(&entry.key) {
                self.entries.push(entry);
            }
        }
    }

    pub fn entries(&self) -> &[ConfEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &ConfKey) -> bool {
        self.entries.iter().any(|e| &e.key == key)
    }

    /// First value stored for `key`
    pub fn get(&self, key: &ConfKey) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| &e.key == key)
            .map(|e| e.value.as_str())
    }

    /// All values stored for `key`, in order
    pub fn values<'a>(&'a self, key: &'a ConfKey) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |e| &e.key == key)
            .map(|e| e.value.as_str())
    }

    /// Wire `(key, value)` pairs
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|e| (e.key.as_str().to_string(), e.value.clone()))
            .collect()
    }

    /// Command-line arguments (`--Key value ...`)
    pub fn to_arguments(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|e| [format!("--{}", e.key), e.value.clone()])
            .collect()
    }
}

impl FromIterator<ConfEntry> for TorConf {
    fn from_iter<I: IntoIterator<Item = ConfEntry>>(iter: I) -> Self {
        let mut conf = TorConf::new();
        for entry in iter {
            conf.push_entry(entry);
        }
        conf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse() {
        assert_eq!(ConfKey::parse("UseBridges"), ConfKey::UseBridges);
        assert_eq!(ConfKey::parse("--exitnodes"), ConfKey::ExitNodes);
        assert_eq!(
            ConfKey::parse("SafeLogging"),
            ConfKey::Other("SafeLogging".into())
        );
    }

    #[test]
    fn test_no_duplicates() {
        let mut conf = TorConf::new();
        assert!(conf.push(ConfKey::Bridge, "a"));
        assert!(!conf.push(ConfKey::Bridge, "a"));
        assert!(conf.push(ConfKey::Bridge, "b"));

        assert_eq!(conf.len(), 2);
        assert_eq!(conf.values(&ConfKey::Bridge).collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn test_extend_absent_keeps_earlier_values() {
        let mut conf = TorConf::new();
        conf.push(ConfKey::ClientUseIPv4, "1");

        let mut other = TorConf::new();
        other.push(ConfKey::ClientUseIPv4, "0");
        other.push(ConfKey::ClientUseIPv6, "1");
        conf.extend_absent(other);

        assert_eq!(conf.get(&ConfKey::ClientUseIPv4), Some("1"));
        assert_eq!(conf.get(&ConfKey::ClientUseIPv6), Some("1"));
    }

    #[test]
    fn test_get_outlives_key() {
        let mut conf = TorConf::new();
        conf.push(ConfKey::Other("SafeLogging".into()), "1");

        let value = {
            let key = ConfKey::parse("SafeLogging");
            conf.get(&key)
        };

        assert_eq!(value, Some("1"));
    }

    #[test]
    fn test_arguments() {
        let mut conf = TorConf::new();
        conf.push_entry(ConfEntry::flag(ConfKey::UseBridges, true));
        conf.push(ConfKey::Bridge, "obfs4 1.2.3.4:443 X");

        assert_eq!(
            conf.to_arguments(),
            ["--UseBridges", "1", "--Bridge", "obfs4 1.2.3.4:443 X"]
        );
    }

    #[test]
    fn test_parse_line() {
        let entry = ConfEntry::parse_line("  ConnectionPadding 1 ").unwrap();
        assert_eq!(entry.key, ConfKey::Other("ConnectionPadding".into()));
        assert_eq!(entry.value, "1");

        assert!(ConfEntry::parse_line("# comment").is_none());
        assert!(ConfEntry::parse_line("   ").is_none());
    }
}
