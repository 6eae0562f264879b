//! Data entities: server records, groups and their measured state
//!
//! A record is split into a mandatory core (identity, address, transport)
//! plus a [`ProtocolSettings`] variant holding only the fields meaningful to
//! its protocol, so invalid field combinations cannot be represented.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// EWMA weights for latency smoothing. Recent samples dominate 70/30,
/// damping single-sample spikes without discarding trend. Applied at every
/// sample count (see DESIGN.md).
pub const EWMA_NEW_WEIGHT: f64 = 0.7;
pub const EWMA_OLD_WEIGHT: f64 = 0.3;

/// Consecutive failed probes after which a record is flagged unreachable
/// and excluded from candidate selection.
pub const UNREACHABLE_AFTER_FAILURES: u32 = 3;

/// Wire protocol tag (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Hysteria,
    Reality,
    Xhttp,
}

impl Protocol {
    /// Default remote port when a URI omits one.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Shadowsocks => 8388,
            _ => 443,
        }
    }

    /// Whether the protocol cannot run without a TLS-class security layer.
    pub fn security_mandatory(&self) -> bool {
        matches!(
            self,
            Protocol::Trojan | Protocol::Hysteria | Protocol::Reality
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Vmess => write!(f, "vmess"),
            Protocol::Vless => write!(f, "vless"),
            Protocol::Trojan => write!(f, "trojan"),
            Protocol::Shadowsocks => write!(f, "shadowsocks"),
            Protocol::Hysteria => write!(f, "hysteria"),
            Protocol::Reality => write!(f, "reality"),
            Protocol::Xhttp => write!(f, "xhttp"),
        }
    }
}

impl TryFrom<&str> for Protocol {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vmess" => Ok(Protocol::Vmess),
            "vless" => Ok(Protocol::Vless),
            "trojan" => Ok(Protocol::Trojan),
            "ss" | "shadowsocks" => Ok(Protocol::Shadowsocks),
            "hysteria" | "hysteria2" | "hy2" => Ok(Protocol::Hysteria),
            "reality" => Ok(Protocol::Reality),
            "xhttp" => Ok(Protocol::Xhttp),
            _ => Err(Error::parse(format!("Unknown protocol: {}", s))),
        }
    }
}

/// Protocol-specific credential and setting fields. Exactly one variant per
/// protocol tag; synthesis matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolSettings {
    Vmess {
        uuid: String,
        alter_id: u16,
        /// Cipher hint carried in the share link (`auto`, `aes-128-gcm`, ...)
        security: String,
    },
    Vless {
        uuid: String,
        flow: Option<String>,
        encryption: String,
    },
    Trojan {
        password: String,
    },
    Shadowsocks {
        method: String,
        password: String,
    },
    Hysteria {
        password: String,
        obfs: Option<String>,
        obfs_password: Option<String>,
    },
    Reality {
        uuid: String,
        public_key: String,
        short_id: Option<String>,
        spider_x: Option<String>,
        flow: Option<String>,
    },
    Xhttp {
        uuid: String,
        mode: Option<String>,
    },
}

impl ProtocolSettings {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolSettings::Vmess { .. } => Protocol::Vmess,
            ProtocolSettings::Vless { .. } => Protocol::Vless,
            ProtocolSettings::Trojan { .. } => Protocol::Trojan,
            ProtocolSettings::Shadowsocks { .. } => Protocol::Shadowsocks,
            ProtocolSettings::Hysteria { .. } => Protocol::Hysteria,
            ProtocolSettings::Reality { .. } => Protocol::Reality,
            ProtocolSettings::Xhttp { .. } => Protocol::Xhttp,
        }
    }
}

/// Stream transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    #[default]
    Tcp,
    Ws,
    Grpc,
    Xhttp,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Tcp => write!(f, "tcp"),
            NetworkType::Ws => write!(f, "ws"),
            NetworkType::Grpc => write!(f, "grpc"),
            NetworkType::Xhttp => write!(f, "xhttp"),
        }
    }
}

impl TryFrom<&str> for NetworkType {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "tcp" | "" => Ok(NetworkType::Tcp),
            "ws" | "websocket" => Ok(NetworkType::Ws),
            "grpc" => Ok(NetworkType::Grpc),
            "xhttp" => Ok(NetworkType::Xhttp),
            _ => Err(Error::parse(format!("Unknown network type: {}", s))),
        }
    }
}

/// Security layer of the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityType {
    #[default]
    None,
    Tls,
    Reality,
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityType::None => write!(f, "none"),
            SecurityType::Tls => write!(f, "tls"),
            SecurityType::Reality => write!(f, "reality"),
        }
    }
}

/// Transport settings shared by all protocols
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportSettings {
    pub network: NetworkType,
    pub security: SecurityType,
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    pub fingerprint: Option<String>,
    pub ws_path: Option<String>,
    pub ws_host: Option<String>,
    pub grpc_service_name: Option<String>,
    pub allow_insecure: bool,
}

/// Per-record routing overrides
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoutingOverrides {
    pub bypass_domains: Vec<String>,
    pub block_domains: Vec<String>,
    pub bypass_cidrs: Vec<IpNet>,
    pub block_cidrs: Vec<IpNet>,
    pub dns_servers: Vec<String>,
}

/// Probe-driven measured state.
///
/// `smoothed_ping_ms == 0` is the "never probed" sentinel; a failed probe
/// never writes a numeric ping, it only bumps the failure counter.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeasuredState {
    pub smoothed_ping_ms: u32,
    pub sample_count: u32,
    pub consecutive_failures: u32,
    pub unreachable: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl MeasuredState {
    /// Fold a successful latency measurement into the smoothed value and
    /// clear any failure streak.
    pub fn record_sample(&mut self, measured_ms: u32, now: DateTime<Utc>) {
        self.smoothed_ping_ms = if self.sample_count == 0 {
            measured_ms
        } else {
            (EWMA_NEW_WEIGHT * measured_ms as f64 + EWMA_OLD_WEIGHT * self.smoothed_ping_ms as f64)
                .round() as u32
        };
        self.sample_count += 1;
        self.consecutive_failures = 0;
        self.unreachable = false;
        self.last_probe_at = Some(now);
        self.last_success_at = Some(now);
    }

    /// Record a failed probe; flips the unreachable marker after
    /// [`UNREACHABLE_AFTER_FAILURES`] misses in a row.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= UNREACHABLE_AFTER_FAILURES {
            self.unreachable = true;
        }
        self.last_probe_at = Some(now);
    }

    /// Eligible for selection: probed at least once and not flagged out.
    pub fn selectable(&self) -> bool {
        self.sample_count > 0 && !self.unreachable
    }
}

/// Traffic counters, fed by the engine's stats channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub connection_count: u64,
}

/// One remote proxy endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub settings: ProtocolSettings,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub routing: RoutingOverrides,
    #[serde(default)]
    pub measured: MeasuredState,
    #[serde(default)]
    pub stats: UsageStats,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub note: Option<String>,
}

impl ServerRecord {
    pub fn new(group_id: Uuid, name: String, address: String, port: u16, settings: ProtocolSettings) -> Self {
        ServerRecord {
            id: Uuid::new_v4(),
            group_id,
            name,
            address,
            port,
            settings,
            transport: TransportSettings::default(),
            routing: RoutingOverrides::default(),
            measured: MeasuredState::default(),
            stats: UsageStats::default(),
            favorite: false,
            note: None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.settings.protocol()
    }

    /// Stable identity used to diff subscription refreshes.
    pub fn subscription_key(&self) -> String {
        format!("{}:{}:{}", self.protocol(), self.address, self.port)
    }

    /// Core sanity checks shared by every protocol.
    pub fn validate_core(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::missing_field(&self.protocol().to_string(), "address"));
        }
        if self.port == 0 {
            return Err(Error::validation(format!(
                "{}: port must be in 1..=65535",
                self.protocol()
            )));
        }
        Ok(())
    }
}

/// Basic-auth credentials for subscription fetches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchAuth {
    pub username: String,
    pub password: String,
}

/// A named set of servers, optionally backed by a subscription URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerGroup {
    pub id: Uuid,
    pub name: String,
    pub subscription_url: Option<String>,
    pub auto_update: bool,
    /// Base refresh interval in seconds; backoff multiplies this.
    pub update_interval_secs: u64,
    pub user_agent: Option<String>,
    pub auth: Option<FetchAuth>,
    pub last_update_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Set after too many consecutive refresh failures. The last-known-good
    /// record set stays usable.
    pub stale: bool,
}

impl ServerGroup {
    pub fn new(name: String) -> Self {
        ServerGroup {
            id: Uuid::new_v4(),
            name,
            subscription_url: None,
            auto_update: false,
            update_interval_secs: 3600,
            user_agent: None,
            auth: None,
            last_update_at: None,
            consecutive_failures: 0,
            last_error: None,
            stale: false,
        }
    }

    pub fn with_subscription(name: String, url: String, interval: Duration) -> Self {
        let mut g = Self::new(name);
        g.subscription_url = Some(url);
        g.auto_update = true;
        g.update_interval_secs = interval.as_secs();
        g
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_first_sample_taken_verbatim() {
        let mut m = MeasuredState::default();
        m.record_sample(120, Utc::now());
        assert_eq!(m.smoothed_ping_ms, 120);
        assert_eq!(m.sample_count, 1);
    }

    #[test]
    fn ewma_weights_recent_sample() {
        let mut m = MeasuredState {
            smoothed_ping_ms: 100,
            sample_count: 4,
            ..Default::default()
        };
        m.record_sample(50, Utc::now());
        // round(0.7*50 + 0.3*100) = 65
        assert_eq!(m.smoothed_ping_ms, 65);
        assert_eq!(m.sample_count, 5);
    }

    #[test]
    fn failure_never_writes_numeric_ping() {
        let mut m = MeasuredState {
            smoothed_ping_ms: 42,
            sample_count: 3,
            ..Default::default()
        };
        m.record_failure(Utc::now());
        assert_eq!(m.smoothed_ping_ms, 42);
        assert!(!m.unreachable);
    }

    #[test]
    fn three_failures_flag_unreachable() {
        let mut m = MeasuredState {
            smoothed_ping_ms: 10,
            sample_count: 5,
            ..Default::default()
        };
        let now = Utc::now();
        m.record_failure(now);
        m.record_failure(now);
        assert!(m.selectable());
        m.record_failure(now);
        assert!(m.unreachable);
        assert!(!m.selectable());
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut m = MeasuredState::default();
        let now = Utc::now();
        m.record_sample(30, now);
        m.record_failure(now);
        m.record_failure(now);
        m.record_failure(now);
        assert!(m.unreachable);
        m.record_sample(35, now);
        assert!(!m.unreachable);
        assert_eq!(m.consecutive_failures, 0);
    }

    #[test]
    fn never_probed_is_not_selectable() {
        assert!(!MeasuredState::default().selectable());
    }

    #[test]
    fn protocol_from_str_aliases() {
        assert_eq!(Protocol::try_from("ss").unwrap(), Protocol::Shadowsocks);
        assert_eq!(Protocol::try_from("hy2").unwrap(), Protocol::Hysteria);
        assert!(Protocol::try_from("snell").is_err());
    }

    #[test]
    fn subscription_key_is_protocol_addr_port() {
        let r = ServerRecord::new(
            Uuid::new_v4(),
            "n".into(),
            "example.com".into(),
            443,
            ProtocolSettings::Trojan {
                password: "p".into(),
            },
        );
        assert_eq!(r.subscription_key(), "trojan:example.com:443");
    }

    #[test]
    fn core_validation_rejects_port_zero() {
        let mut r = ServerRecord::new(
            Uuid::new_v4(),
            "n".into(),
            "example.com".into(),
            443,
            ProtocolSettings::Trojan {
                password: "p".into(),
            },
        );
        r.port = 0;
        assert!(matches!(r.validate_core(), Err(Error::Validation(_))));
    }
}
