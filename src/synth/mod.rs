//! Protocol synthesizer: ServerRecord -> OutboundConfig and URI codecs
//!
//! One submodule per wire family. REALITY and XHTTP records travel as
//! `vless://` share links and are told apart by `security=reality` /
//! `type=xhttp`, so the vless codec owns all three. Dispatch is exhaustive
//! over the protocol enum; there is no default case to fall through to a
//! wrong protocol's settings.

mod hysteria;
mod shadowsocks;
mod trojan;
mod uri;
mod vless;
mod vmess;

pub(crate) use uri::{encode_query, query_get, split_authority};

use crate::model::{NetworkType, Protocol, SecurityType, ServerRecord, TransportSettings};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outbound tag used for the primary proxy path.
pub const PROXY_TAG: &str = "proxy";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";

/// Engine-facing outbound object. Produced, never hand-edited: any change
/// goes through a `ServerRecord` mutation followed by re-synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    pub tag: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

impl OutboundConfig {
    pub fn direct() -> Self {
        OutboundConfig {
            tag: DIRECT_TAG.to_string(),
            protocol: "freedom".to_string(),
            settings: None,
            stream_settings: None,
        }
    }

    pub fn block() -> Self {
        OutboundConfig {
            tag: BLOCK_TAG.to_string(),
            protocol: "blackhole".to_string(),
            settings: None,
            stream_settings: None,
        }
    }
}

/// Protocol settings block of an outbound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    /// vmess / vless style
    Vnext { vnext: Vec<VnextServer> },
    /// trojan / shadowsocks style
    Servers { servers: Vec<ServerEntry> },
    /// hysteria2 style
    Hysteria2 {
        address: String,
        port: u16,
        password: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        obfs: Option<ObfsSettings>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VnextServer {
    pub address: String,
    pub port: u16,
    pub users: Vec<OutboundUser>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundUser {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObfsSettings {
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Stream (transport + security) block of an outbound
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality_settings: Option<RealitySettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WsSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xhttp_settings: Option<XhttpSettings>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub alpn: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealitySettings {
    pub public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spider_x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrpcSettings {
    pub service_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XhttpSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Build the stream block from a record's transport settings. REALITY
/// records get a reality block regardless of what the transport block says,
/// because for them the security layer is not optional.
pub(crate) fn stream_from_transport(
    record: &ServerRecord,
    t: &TransportSettings,
) -> Result<StreamSettings> {
    let mut stream = StreamSettings {
        network: t.network.to_string(),
        security: t.security.to_string(),
        ..Default::default()
    };

    match record.protocol() {
        Protocol::Reality => stream.security = SecurityType::Reality.to_string(),
        p if p.security_mandatory() && t.security == SecurityType::None => {
            stream.security = SecurityType::Tls.to_string();
        }
        _ => {}
    }

    if stream.security == "tls" {
        stream.tls_settings = Some(TlsSettings {
            server_name: t.sni.clone().or_else(|| Some(record.address.clone())),
            alpn: t.alpn.clone(),
            fingerprint: t.fingerprint.clone(),
            allow_insecure: t.allow_insecure,
        });
    }

    match t.network {
        NetworkType::Ws => {
            let headers = t.ws_host.as_ref().map(|h| {
                let mut m = HashMap::new();
                m.insert("Host".to_string(), h.clone());
                m
            });
            stream.ws_settings = Some(WsSettings {
                path: t.ws_path.clone(),
                headers,
            });
        }
        NetworkType::Grpc => {
            let service_name = t
                .grpc_service_name
                .clone()
                .ok_or_else(|| Error::missing_field(&record.protocol().to_string(), "grpc_service_name"))?;
            stream.grpc_settings = Some(GrpcSettings { service_name });
        }
        NetworkType::Xhttp => {
            stream.xhttp_settings = Some(XhttpSettings {
                path: t.ws_path.clone(),
                host: t.ws_host.clone(),
                mode: None,
            });
        }
        NetworkType::Tcp => {}
    }

    Ok(stream)
}

/// Read the common transport query keys (`type`, `security`, `sni`, `path`,
/// `host`, `serviceName`, `alpn`, `fp`, `allowInsecure`) of a share link.
pub(crate) fn transport_from_query(
    query: &[(String, String)],
    default_security: SecurityType,
) -> Result<TransportSettings> {
    let network = match query_get(query, "type") {
        Some(s) => NetworkType::try_from(s)?,
        None => NetworkType::Tcp,
    };
    let security = match query_get(query, "security") {
        Some("tls") => SecurityType::Tls,
        Some("reality") => SecurityType::Reality,
        Some("none") => SecurityType::None,
        Some(other) => return Err(Error::parse(format!("unknown security: {}", other))),
        None => default_security,
    };

    Ok(TransportSettings {
        network,
        security,
        sni: query_get(query, "sni").map(str::to_string),
        alpn: query_get(query, "alpn")
            .map(|a| a.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        fingerprint: query_get(query, "fp").map(str::to_string),
        ws_path: query_get(query, "path").map(str::to_string),
        ws_host: query_get(query, "host").map(str::to_string),
        grpc_service_name: query_get(query, "serviceName").map(str::to_string),
        allow_insecure: matches!(query_get(query, "allowInsecure"), Some("1") | Some("true")),
    })
}

/// Inverse of [`transport_from_query`]: the query pairs a transport block
/// contributes to a generated link.
pub(crate) fn transport_query_pairs(t: &TransportSettings) -> Vec<(&'static str, String)> {
    let mut pairs = vec![
        ("security", t.security.to_string()),
        ("sni", t.sni.clone().unwrap_or_default()),
        ("type", t.network.to_string()),
        ("path", t.ws_path.clone().unwrap_or_default()),
        ("host", t.ws_host.clone().unwrap_or_default()),
        ("serviceName", t.grpc_service_name.clone().unwrap_or_default()),
        ("alpn", t.alpn.join(",")),
        ("fp", t.fingerprint.clone().unwrap_or_default()),
    ];
    if t.allow_insecure {
        pairs.push(("allowInsecure", "1".to_string()));
    }
    pairs
}

/// Synthesize the engine outbound for a record. Fails with a validation
/// error naming the missing/invalid field.
pub fn synthesize(record: &ServerRecord) -> Result<OutboundConfig> {
    record.validate_core()?;
    match record.protocol() {
        Protocol::Vmess => vmess::synthesize(record),
        Protocol::Vless | Protocol::Reality | Protocol::Xhttp => vless::synthesize(record),
        Protocol::Trojan => trojan::synthesize(record),
        Protocol::Shadowsocks => shadowsocks::synthesize(record),
        Protocol::Hysteria => hysteria::synthesize(record),
    }
}

/// Parse a share-link URI into a record (group assigned by the caller).
pub fn parse_uri(text: &str) -> Result<ServerRecord> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("vmess://") {
        vmess::parse(rest)
    } else if let Some(rest) = text.strip_prefix("vless://") {
        vless::parse(rest)
    } else if let Some(rest) = text.strip_prefix("trojan://") {
        trojan::parse(rest)
    } else if let Some(rest) = text.strip_prefix("ss://") {
        shadowsocks::parse(rest)
    } else if let Some(rest) = text
        .strip_prefix("hysteria2://")
        .or_else(|| text.strip_prefix("hy2://"))
    {
        hysteria::parse(rest)
    } else {
        Err(Error::parse(format!("Unknown URI scheme: {}", text)))
    }
}

/// Generate the canonical share-link URI for a record.
pub fn generate_uri(record: &ServerRecord) -> Result<String> {
    record.validate_core()?;
    match record.protocol() {
        Protocol::Vmess => vmess::generate(record),
        Protocol::Vless | Protocol::Reality | Protocol::Xhttp => vless::generate(record),
        Protocol::Trojan => trojan::generate(record),
        Protocol::Shadowsocks => shadowsocks::generate(record),
        Protocol::Hysteria => hysteria::generate(record),
    }
}
