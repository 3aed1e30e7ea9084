//! Transport Catalog
//!
//! Known ways of reaching the Tor network and the configuration each one
//! needs. The pluggable-transport clients themselves run elsewhere; this
//! module only decides which client tor should talk to and which bridges
//! it should use.
//!
//! | Transport | Client plugin | Built-in bridges |
//! |-----------|---------------|------------------|
//! | none | - | - |
//! | obfs4 | obfs4 | yes |
//! | snowflake | snowflake | yes |
//! | snowflake-amp | snowflake | yes (AMP cache rendezvous) |
//! | meek-azure | meek_lite | yes |
//! | webtunnel | webtunnel | yes |
//! | custom | all | user-supplied |

use crate::conf::{ConfKey, TorConf};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Way of reaching the Tor network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Direct connection, no bridges
    #[default]
    None,
    /// obfs4 with the built-in bridge list
    Obfs4,
    /// Snowflake with domain-fronted rendezvous
    Snowflake,
    /// Snowflake with AMP cache rendezvous
    SnowflakeAmp,
    /// meek through Azure
    MeekAzure,
    /// HTTPS-tunnelled bridges
    Webtunnel,
    /// User-supplied bridge lines
    Custom,
}

impl Transport {
    /// Get all transports
    pub fn all() -> &'static [Transport] {
        &[
            Transport::None,
            Transport::Obfs4,
            Transport::Snowflake,
            Transport::SnowflakeAmp,
            Transport::MeekAzure,
            Transport::Webtunnel,
            Transport::Custom,
        ]
    }

    /// Human-readable descriptor
    pub fn description(&self) -> &'static str {
        match self {
            Transport::None => "Direct Connection",
            Transport::Obfs4 => "Obfs4 bridges",
            Transport::Snowflake => "Snowflake",
            Transport::SnowflakeAmp => "Snowflake (AMP)",
            Transport::MeekAzure => "Meek (Azure)",
            Transport::Webtunnel => "WebTunnel",
            Transport::Custom => "Custom bridges",
        }
    }

    /// Does this transport route through bridges?
    pub fn uses_bridges(&self) -> bool {
        !matches!(self, Transport::None)
    }

    /// Plugins tor has to be told about for this transport
    fn plugins(&self) -> &'static [Plugin] {
        match self {
            Transport::None => &[],
            Transport::Obfs4 => &[Plugin::Obfs4],
            Transport::Snowflake | Transport::SnowflakeAmp => &[Plugin::Snowflake],
            Transport::MeekAzure => &[Plugin::Meek],
            Transport::Webtunnel => &[Plugin::Webtunnel],
            Transport::Custom => &[
                Plugin::Obfs4,
                Plugin::Meek,
                Plugin::Snowflake,
                Plugin::Webtunnel,
            ],
        }
    }

    /// Bridge lines shipped with the catalog
    pub fn builtin_bridges(&self) -> &'static [&'static str] {
        match self {
            Transport::Obfs4 => OBFS4_BRIDGES,
            Transport::Snowflake => SNOWFLAKE_BRIDGES,
            Transport::SnowflakeAmp => SNOWFLAKE_AMP_BRIDGES,
            Transport::MeekAzure => MEEK_BRIDGES,
            Transport::Webtunnel => WEBTUNNEL_BRIDGES,
            Transport::None | Transport::Custom => &[],
        }
    }

    /// Render the transport-specific configuration entries
    ///
    /// Custom bridge lines are not part of the catalog; the assembler adds
    /// them after this rendering.
    pub fn tor_conf(&self, ports: &TransportPorts) -> TorConf {
        let mut conf = TorConf::new();

        for plugin in self.plugins() {
            conf.push(
                ConfKey::ClientTransportPlugin,
                format!("{} socks5 127.0.0.1:{}", plugin.name(), plugin.port(ports)),
            );
        }

        for line in self.builtin_bridges() {
            conf.push(ConfKey::Bridge, *line);
        }

        conf
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Pluggable-transport client as tor sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plugin {
    Obfs4,
    Meek,
    Snowflake,
    Webtunnel,
}

impl Plugin {
    fn name(&self) -> &'static str {
        match self {
            Plugin::Obfs4 => "obfs4",
            Plugin::Meek => "meek_lite",
            Plugin::Snowflake => "snowflake",
            Plugin::Webtunnel => "webtunnel",
        }
    }

    fn port(&self, ports: &TransportPorts) -> u16 {
        match self {
            Plugin::Obfs4 => ports.obfs4,
            Plugin::Meek => ports.meek,
            Plugin::Snowflake => ports.snowflake,
            Plugin::Webtunnel => ports.webtunnel,
        }
    }
}

/// Local SOCKS ports of the pluggable-transport clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportPorts {
    pub obfs4: u16,
    pub meek: u16,
    pub snowflake: u16,
    pub webtunnel: u16,
}

impl Default for TransportPorts {
    fn default() -> Self {
        Self {
            obfs4: 47351,
            meek: 47352,
            snowflake: 52610,
            webtunnel: 47353,
        }
    }
}

const OBFS4_BRIDGES: &[&str] = &[
    "obfs4 192.95.36.142:443 CDF2E852BF539B82BD10E27E9115A31734E378C2 cert=qUVQ0srL1JI/vO6V6m/24anYXiJD3QP2HgzUKQtQ7GRqqUvs7P+tG43RtAqdhLOALP7DJQ iat-mode=1",
    "obfs4 37.218.245.14:38224 D9A82D2F9C2F65A18407B1D2B764F130847F8B5D cert=bjRaMrr1BRiAW8IE9U5z27fQaYgOhX1UCmOpg2pFpoMvo6ZgQMzLsaTzzQNTlm7hNcb+Sg iat-mode=0",
    "obfs4 85.31.186.98:443 011F2599C0E9B27EE74B353155E244813763C3E5 cert=ayq0XzCwhpdysn5o0EyDUbmSOx3X/oTEbzDMvczHOdBJKlvIdHHLJGkZARtT4dcBFArPPg iat-mode=0",
];

const SNOWFLAKE_BRIDGES: &[&str] = &[
    "snowflake 192.0.2.3:80 2B280B23E1107BB62ABFC40DDCC8824814F80A72 fingerprint=2B280B23E1107BB62ABFC40DDCC8824814F80A72 url=https://1098762253.rsc.cdn77.org/ fronts=www.cdn77.com,www.phpmyadmin.net ice=stun:stun.l.google.com:19302,stun:stun.antisip.com:3478,stun:stun.bluesip.net:3478 utls-imitate=hellorandomizedalpn",
    "snowflake 192.0.2.4:80 8838024498816A039FCBBAB14E6F40A0843051FA fingerprint=8838024498816A039FCBBAB14E6F40A0843051FA url=https://1098762253.rsc.cdn77.org/ fronts=www.cdn77.com,www.phpmyadmin.net ice=stun:stun.l.google.com:19302,stun:stun.antisip.com:3478,stun:stun.bluesip.net:3478 utls-imitate=hellorandomizedalpn",
];

const SNOWFLAKE_AMP_BRIDGES: &[&str] = &[
    "snowflake 192.0.2.5:80 2B280B23E1107BB62ABFC40DDCC8824814F80A72 fingerprint=2B280B23E1107BB62ABFC40DDCC8824814F80A72 url=https://snowflake-broker.torproject.net/ ampcache=https://cdn.ampproject.org/ front=www.google.com ice=stun:stun.l.google.com:19302,stun:stun.antisip.com:3478,stun:stun.bluesip.net:3478 utls-imitate=hellorandomizedalpn",
];

const MEEK_BRIDGES: &[&str] = &[
    "meek_lite 192.0.2.20:80 url=https://1314488750.rsc.cdn77.org front=www.phpmyadmin.net utls=HelloRandomizedALPN",
];

const WEBTUNNEL_BRIDGES: &[&str] = &[
    "webtunnel [2001:db8:9443:367a:3276:1e74:91c3:7a5a]:443 54BF1146B161573185FBA0299B0DC3A8F7D08080 url=https://d3pyjtpvxs6z0u.cloudfront.net/Exactly5/ ver=0.0.1",
];
