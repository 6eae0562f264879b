//! VLESS codec: `vless://uuid@host:port?query#name`
//!
//! REALITY and XHTTP servers ship as vless links too, dispatched by
//! `security=reality` and `type=xhttp`. This module parses and generates
//! all three and synthesizes their outbounds.

use super::{
    encode_query, query_get, split_authority, stream_from_transport, transport_from_query,
    transport_query_pairs, OutboundConfig, OutboundSettings, OutboundUser, RealitySettings,
    VnextServer, XhttpSettings, PROXY_TAG,
};
use crate::model::{NetworkType, Protocol, ProtocolSettings, SecurityType, ServerRecord};
use crate::{Error, Result};
use uuid::Uuid;

pub(super) fn synthesize(record: &ServerRecord) -> Result<OutboundConfig> {
    let (uuid, user) = match &record.settings {
        ProtocolSettings::Vless {
            uuid,
            flow,
            encryption,
        } => (
            uuid,
            OutboundUser {
                id: uuid.clone(),
                encryption: Some(if encryption.is_empty() {
                    "none".to_string()
                } else {
                    encryption.clone()
                }),
                flow: flow.clone(),
                ..Default::default()
            },
        ),
        ProtocolSettings::Reality { uuid, flow, .. } => (
            uuid,
            OutboundUser {
                id: uuid.clone(),
                encryption: Some("none".to_string()),
                flow: flow.clone(),
                ..Default::default()
            },
        ),
        ProtocolSettings::Xhttp { uuid, .. } => (
            uuid,
            OutboundUser {
                id: uuid.clone(),
                encryption: Some("none".to_string()),
                ..Default::default()
            },
        ),
        _ => return Err(Error::internal("vless synthesizer got foreign settings")),
    };

    if uuid.is_empty() {
        return Err(Error::missing_field(&record.protocol().to_string(), "uuid"));
    }
    Uuid::parse_str(uuid).map_err(|_| {
        Error::validation(format!("{}: invalid uuid '{}'", record.protocol(), uuid))
    })?;

    let mut stream = match &record.settings {
        // xhttp implies its own transport kind no matter what the record says
        ProtocolSettings::Xhttp { mode, .. } => {
            let mut t = record.transport.clone();
            t.network = NetworkType::Xhttp;
            let mut stream = stream_from_transport(record, &t)?;
            if let Some(x) = stream.xhttp_settings.as_mut() {
                x.mode = mode.clone();
            } else {
                stream.xhttp_settings = Some(XhttpSettings {
                    mode: mode.clone(),
                    ..Default::default()
                });
            }
            stream
        }
        _ => stream_from_transport(record, &record.transport)?,
    };

    if let ProtocolSettings::Reality {
        public_key,
        short_id,
        spider_x,
        ..
    } = &record.settings
    {
        if public_key.is_empty() {
            return Err(Error::missing_field("reality", "public_key"));
        }
        stream.security = SecurityType::Reality.to_string();
        stream.tls_settings = None;
        stream.reality_settings = Some(RealitySettings {
            public_key: public_key.clone(),
            server_name: record.transport.sni.clone(),
            short_id: short_id.clone(),
            spider_x: spider_x.clone(),
            fingerprint: record.transport.fingerprint.clone(),
        });
    }

    Ok(OutboundConfig {
        tag: PROXY_TAG.to_string(),
        protocol: "vless".to_string(),
        settings: Some(OutboundSettings::Vnext {
            vnext: vec![VnextServer {
                address: record.address.clone(),
                port: record.port,
                users: vec![user],
            }],
        }),
        stream_settings: Some(stream),
    })
}

pub(super) fn parse(rest: &str) -> Result<ServerRecord> {
    let parts = split_authority(rest)?;
    let uuid = parts
        .userinfo
        .filter(|u| !u.is_empty())
        .ok_or_else(|| Error::parse("vless: missing uuid"))?;
    let port = parts.port.unwrap_or_else(|| Protocol::Vless.default_port());
    let name = parts
        .fragment
        .clone()
        .unwrap_or_else(|| format!("{}:{}", parts.host, port));
    let query = &parts.query;

    let is_reality = query_get(query, "security") == Some("reality");
    let is_xhttp = query_get(query, "type") == Some("xhttp");

    let settings = if is_reality {
        let public_key = query_get(query, "pbk")
            .ok_or_else(|| Error::parse("reality: missing 'pbk' public key"))?
            .to_string();
        ProtocolSettings::Reality {
            uuid,
            public_key,
            short_id: query_get(query, "sid").map(str::to_string),
            spider_x: query_get(query, "spx").map(str::to_string),
            flow: query_get(query, "flow").map(str::to_string),
        }
    } else if is_xhttp {
        ProtocolSettings::Xhttp {
            uuid,
            mode: query_get(query, "mode").map(str::to_string),
        }
    } else {
        ProtocolSettings::Vless {
            uuid,
            flow: query_get(query, "flow").map(str::to_string),
            encryption: query_get(query, "encryption")
                .unwrap_or("none")
                .to_string(),
        }
    };

    let mut record = ServerRecord::new(Uuid::nil(), name, parts.host, port, settings);
    record.transport = transport_from_query(query, SecurityType::None)?;
    if is_reality {
        record.transport.security = SecurityType::Reality;
    }
    if is_xhttp {
        record.transport.network = NetworkType::Xhttp;
    }
    Ok(record)
}

pub(super) fn generate(record: &ServerRecord) -> Result<String> {
    let query = match &record.settings {
        ProtocolSettings::Vless {
            flow, encryption, ..
        } => {
            let mut pairs = vec![(
                "encryption",
                if encryption.is_empty() {
                    "none".to_string()
                } else {
                    encryption.clone()
                },
            )];
            pairs.push(("flow", flow.clone().unwrap_or_default()));
            pairs.extend(transport_query_pairs(&record.transport));
            encode_query(&pairs)
        }
        ProtocolSettings::Reality {
            public_key,
            short_id,
            spider_x,
            flow,
            ..
        } => {
            if public_key.is_empty() {
                return Err(Error::missing_field("reality", "public_key"));
            }
            let mut pairs = vec![
                ("encryption", "none".to_string()),
                ("pbk", public_key.clone()),
                ("sid", short_id.clone().unwrap_or_default()),
                ("spx", spider_x.clone().unwrap_or_default()),
                ("flow", flow.clone().unwrap_or_default()),
            ];
            // the transport block carries the ws/grpc sub-settings too
            let mut t = record.transport.clone();
            t.security = SecurityType::Reality;
            pairs.extend(transport_query_pairs(&t));
            encode_query(&pairs)
        }
        ProtocolSettings::Xhttp { mode, .. } => {
            let mut pairs = vec![
                ("encryption", "none".to_string()),
                ("mode", mode.clone().unwrap_or_default()),
            ];
            let mut t = record.transport.clone();
            t.network = NetworkType::Xhttp;
            pairs.extend(transport_query_pairs(&t));
            encode_query(&pairs)
        }
        _ => return Err(Error::internal("vless generator got foreign settings")),
    };

    let uuid = match &record.settings {
        ProtocolSettings::Vless { uuid, .. }
        | ProtocolSettings::Reality { uuid, .. }
        | ProtocolSettings::Xhttp { uuid, .. } => uuid,
        _ => unreachable!(),
    };
    if uuid.is_empty() {
        return Err(Error::missing_field(&record.protocol().to_string(), "uuid"));
    }

    Ok(format!(
        "vless://{}@{}:{}?{}#{}",
        uuid,
        super::uri::format_host(&record.address),
        record.port,
        query,
        urlencoding::encode(&record.name)
    ))
}
