//! Configuration Assembler
//!
//! Builds the configuration-argument set for one connection attempt from
//! the transport catalog, the user's bridge lines, node restrictions and
//! the current reachability hint.
//!
//! # Ordering
//!
//! ```text
//! launch:  advanced lines → nodes → transport → UseBridges → reachability
//! update:                   nodes → transport → UseBridges
//! ```
//!
//! The same inputs always produce the same entries in the same order.

use crate::conf::{ConfEntry, ConfKey, TorConf};
use crate::logging::RedactedBridge;
use crate::reachability::IpStatus;
use crate::settings::Settings;
use crate::transport::{Transport, TransportPorts};
use tracing::{debug, warn};

/// Node in-/exclusions taken from the settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeConf {
    pub entry_nodes: Option<String>,
    pub exit_nodes: Option<String>,
    pub exclude_nodes: Option<String>,
    pub strict_nodes: bool,
}

impl NodeConf {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            entry_nodes: non_empty(&settings.entry_nodes),
            exit_nodes: non_empty(&settings.exit_nodes),
            exclude_nodes: non_empty(&settings.exclude_nodes),
            strict_nodes: settings.strict_nodes,
        }
    }

    /// Render node entries for `transport`
    ///
    /// tor refuses `EntryNodes` together with `UseBridges`, so entry nodes
    /// are only emitted for a direct connection.
    pub fn tor_conf(&self, transport: Transport) -> TorConf {
        let mut conf = TorConf::new();

        if transport == Transport::None {
            if let Some(entry) = &self.entry_nodes {
                conf.push(ConfKey::EntryNodes, entry.as_str());
            }
        }

        if let Some(exit) = &self.exit_nodes {
            conf.push(ConfKey::ExitNodes, exit.as_str());
        }

        if let Some(exclude) = &self.exclude_nodes {
            conf.push(ConfKey::ExcludeNodes, exclude.as_str());
            conf.push_entry(ConfEntry::flag(ConfKey::StrictNodes, self.strict_nodes));
        }

        conf
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Stateless configuration builder
#[derive(Debug, Clone, Default)]
pub struct ConfigAssembler {
    ports: TransportPorts,
}

impl ConfigAssembler {
    pub fn new(ports: TransportPorts) -> Self {
        Self { ports }
    }

    /// Transport, bridge and reachability entries for one attempt
    ///
    /// 1. catalog rendering of `transport`
    /// 2. one `Bridge` per custom line, in order (custom transport only)
    /// 3. `UseBridges`
    /// 4. reachability entries, skipped where a key is already set
    pub fn assemble(
        &self,
        transport: Transport,
        bridge_lines: &[String],
        reachability: IpStatus,
    ) -> TorConf {
        let mut conf = self.transport_conf(transport, bridge_lines);
        conf.extend_absent(reachability.tor_conf(transport));
        conf
    }

    /// Everything handed to a freshly launched process
    pub fn launch_conf(
        &self,
        settings: &Settings,
        transport: Transport,
        reachability: IpStatus,
    ) -> TorConf {
        let mut conf = advanced_conf(&settings.advanced_config);
        conf.extend(NodeConf::from_settings(settings).tor_conf(transport));
        conf.extend(self.transport_conf(transport, &settings.custom_bridges));
        conf.extend_absent(reachability.tor_conf(transport));

        debug!(
            transport = %transport,
            entries = conf.len(),
            "Assembled launch configuration"
        );
        conf
    }

    /// Entries re-applied to a running process after the reset keys
    pub fn update_conf(&self, settings: &Settings, transport: Transport) -> TorConf {
        let mut conf = NodeConf::from_settings(settings).tor_conf(transport);
        conf.extend(self.transport_conf(transport, &settings.custom_bridges));
        conf
    }

    fn transport_conf(&self, transport: Transport, bridge_lines: &[String]) -> TorConf {
        let mut conf = transport.tor_conf(&self.ports);

        if transport == Transport::Custom {
            for line in bridge_lines {
                debug!(bridge = %RedactedBridge(line), "Adding custom bridge");
                conf.push(ConfKey::Bridge, line.as_str());
            }
        }

        conf.push_entry(ConfEntry::flag(ConfKey::UseBridges, transport.uses_bridges()));
        conf
    }
}

/// Parse user-supplied `Key value` lines
fn advanced_conf(lines: &[String]) -> TorConf {
    let mut conf = TorConf::new();

    for line in lines {
        match ConfEntry::parse_line(line) {
            Some(entry) if !entry.value.is_empty() => {
                conf.push_entry(entry);
            }
            Some(entry) => warn!(key = %entry.key, "Ignoring advanced line without value"),
            None => {}
        }
    }

    conf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_custom_bridges_in_order() {
        let assembler = ConfigAssembler::default();
        let conf = assembler.assemble(Transport::Custom, &lines(&["X", "Y"]), IpStatus::Dual);

        let bridges: Vec<_> = conf.values(&ConfKey::Bridge).collect();
        assert_eq!(bridges, ["X", "Y"]);
        assert_eq!(conf.get(&ConfKey::UseBridges), Some("1"));
        assert_eq!(conf.values(&ConfKey::UseBridges).count(), 1);
    }

    #[test]
    fn test_direct_has_no_bridges() {
        let assembler = ConfigAssembler::default();
        let conf = assembler.assemble(Transport::None, &[], IpStatus::Ipv4Only);

        assert_eq!(conf.get(&ConfKey::UseBridges), Some("0"));
        assert!(!conf.contains_key(&ConfKey::Bridge));
    }

    #[test]
    fn test_bridge_lines_ignored_for_managed_transport() {
        let assembler = ConfigAssembler::default();
        let conf = assembler.assemble(Transport::Obfs4, &lines(&["custom line"]), IpStatus::Unavailable);

        assert!(!conf.values(&ConfKey::Bridge).any(|b| b == "custom line"));
        assert!(conf.values(&ConfKey::Bridge).all(|b| b.starts_with("obfs4 ")));
    }

    #[test]
    fn test_bridge_lines_passed_verbatim() {
        let assembler = ConfigAssembler::default();
        let conf = assembler.assemble(Transport::Custom, &lines(&["", "garbage"]), IpStatus::Unavailable);

        assert_eq!(conf.values(&ConfKey::Bridge).collect::<Vec<_>>(), ["", "garbage"]);
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let assembler = ConfigAssembler::default();
        let bridges = lines(&["A", "B", "C"]);

        let first = assembler.assemble(Transport::Custom, &bridges, IpStatus::Ipv6Only);
        let second = assembler.assemble(Transport::Custom, &bridges, IpStatus::Ipv6Only);
        assert_eq!(first, second);
    }

    #[test]
    fn test_entry_nodes_only_without_bridges() {
        let nodes = NodeConf {
            entry_nodes: Some("{de}".into()),
            exit_nodes: Some("{ch}".into()),
            exclude_nodes: None,
            strict_nodes: true,
        };

        let direct = nodes.tor_conf(Transport::None);
        assert_eq!(direct.get(&ConfKey::EntryNodes), Some("{de}"));
        assert!(!direct.contains_key(&ConfKey::StrictNodes));

        let bridged = nodes.tor_conf(Transport::Snowflake);
        assert!(!bridged.contains_key(&ConfKey::EntryNodes));
        assert_eq!(bridged.get(&ConfKey::ExitNodes), Some("{ch}"));
    }

    #[test]
    fn test_strict_nodes_follows_exclusions() {
        let mut settings = Settings::default();
        settings.exclude_nodes = Some(" {ru} ".into());

        let conf = NodeConf::from_settings(&settings).tor_conf(Transport::None);
        assert_eq!(conf.get(&ConfKey::ExcludeNodes), Some("{ru}"));
        assert_eq!(conf.get(&ConfKey::StrictNodes), Some("0"));
    }

    #[test]
    fn test_launch_conf_order() {
        let mut settings = Settings::default();
        settings.advanced_config = lines(&["ConnectionPadding 1", "NoValue"]);
        settings.exit_nodes = Some("{se}".into());

        let conf = ConfigAssembler::default().launch_conf(&settings, Transport::None, IpStatus::Dual);
        let keys: Vec<_> = conf.entries().iter().map(|e| e.key.as_str().to_string()).collect();

        assert_eq!(
            keys,
            [
                "ConnectionPadding",
                "ExitNodes",
                "UseBridges",
                "ClientUseIPv4",
                "ClientUseIPv6",
                "ClientPreferIPv6ORPort",
            ]
        );
    }

    #[test]
    fn test_reachability_never_overrides() {
        let mut settings = Settings::default();
        settings.advanced_config = lines(&["ClientUseIPv6 0"]);

        let conf = ConfigAssembler::default().launch_conf(&settings, Transport::None, IpStatus::Dual);
        assert_eq!(conf.values(&ConfKey::ClientUseIPv6).collect::<Vec<_>>(), ["0"]);
    }
}
