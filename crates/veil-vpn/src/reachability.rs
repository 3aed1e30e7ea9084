//! Network reachability hints
//!
//! The host reports which IP families currently route to the internet.
//! These hints become additive `ClientUseIPv*` entries.

use crate::conf::{ConfEntry, ConfKey, TorConf};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};

/// IP families reachable from the current network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IpStatus {
    /// Unknown, let tor decide
    #[default]
    Unavailable,
    Ipv4Only,
    Ipv6Only,
    Dual,
}

impl IpStatus {
    /// Configuration entries implied by this status
    ///
    /// On an IPv6-only network a direct connection must not try IPv4, but a
    /// pluggable transport connects on its own and keeps IPv4 available.
    pub fn tor_conf(&self, transport: Transport) -> TorConf {
        let entries = match self {
            IpStatus::Unavailable => vec![],
            IpStatus::Ipv4Only => vec![
                ConfEntry::flag(ConfKey::ClientUseIPv4, true),
                ConfEntry::flag(ConfKey::ClientUseIPv6, false),
            ],
            IpStatus::Ipv6Only => vec![
                ConfEntry::flag(ConfKey::ClientUseIPv4, transport.uses_bridges()),
                ConfEntry::flag(ConfKey::ClientUseIPv6, true),
                ConfEntry::flag(ConfKey::ClientPreferIPv6ORPort, true),
            ],
            IpStatus::Dual => vec![
                ConfEntry::flag(ConfKey::ClientUseIPv4, true),
                ConfEntry::flag(ConfKey::ClientUseIPv6, true),
                ConfEntry::new(ConfKey::ClientPreferIPv6ORPort, "auto"),
            ],
        };

        entries.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_empty() {
        assert!(IpStatus::Unavailable.tor_conf(Transport::None).is_empty());
    }

    #[test]
    fn test_ipv6_only_direct() {
        let conf = IpStatus::Ipv6Only.tor_conf(Transport::None);
        assert_eq!(conf.get(&ConfKey::ClientUseIPv4), Some("0"));
        assert_eq!(conf.get(&ConfKey::ClientPreferIPv6ORPort), Some("1"));
    }

    #[test]
    fn test_ipv6_only_bridged_keeps_ipv4() {
        let conf = IpStatus::Ipv6Only.tor_conf(Transport::Obfs4);
        assert_eq!(conf.get(&ConfKey::ClientUseIPv4), Some("1"));
    }
}
