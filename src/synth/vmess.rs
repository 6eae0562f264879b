//! VMess codec: `vmess://base64(json)` envelope (v2 share format)

use super::{
    stream_from_transport, OutboundConfig, OutboundSettings, OutboundUser, VnextServer, PROXY_TAG,
};
use crate::model::{
    NetworkType, ProtocolSettings, SecurityType, ServerRecord, TransportSettings,
};
use crate::{Error, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde_json::{json, Value};
use uuid::Uuid;

pub(super) fn synthesize(record: &ServerRecord) -> Result<OutboundConfig> {
    let ProtocolSettings::Vmess {
        uuid,
        alter_id,
        security,
    } = &record.settings
    else {
        return Err(Error::internal("vmess synthesizer got non-vmess settings"));
    };
    if uuid.is_empty() {
        return Err(Error::missing_field("vmess", "uuid"));
    }
    Uuid::parse_str(uuid)
        .map_err(|_| Error::validation(format!("vmess: invalid uuid '{}'", uuid)))?;

    Ok(OutboundConfig {
        tag: PROXY_TAG.to_string(),
        protocol: "vmess".to_string(),
        settings: Some(OutboundSettings::Vnext {
            vnext: vec![VnextServer {
                address: record.address.clone(),
                port: record.port,
                users: vec![OutboundUser {
                    id: uuid.clone(),
                    alter_id: Some(*alter_id),
                    security: Some(if security.is_empty() {
                        "auto".to_string()
                    } else {
                        security.clone()
                    }),
                    ..Default::default()
                }],
            }],
        }),
        stream_settings: Some(stream_from_transport(record, &record.transport)?),
    })
}

pub(super) fn parse(rest: &str) -> Result<ServerRecord> {
    let decoded = STANDARD
        .decode(rest.trim())
        .or_else(|_| URL_SAFE.decode(rest.trim()))
        .map_err(|e| Error::parse(format!("vmess: invalid base64: {}", e)))?;
    let text = String::from_utf8(decoded)
        .map_err(|e| Error::parse(format!("vmess: invalid UTF-8: {}", e)))?;
    let obj: Value =
        serde_json::from_str(&text).map_err(|e| Error::parse(format!("vmess: invalid JSON: {}", e)))?;

    let address = str_field(&obj, "add").ok_or_else(|| Error::parse("vmess: missing 'add'"))?;
    let port = num_field(&obj, "port").ok_or_else(|| Error::parse("vmess: missing 'port'"))?;
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::parse("vmess: port out of range"))?;
    let uuid = str_field(&obj, "id").ok_or_else(|| Error::parse("vmess: missing 'id'"))?;
    let alter_id = match num_field(&obj, "aid") {
        Some(aid) => {
            u16::try_from(aid).map_err(|_| Error::parse("vmess: alterId out of range"))?
        }
        None => 0,
    };
    let name = str_field(&obj, "ps").unwrap_or_else(|| format!("{}:{}", address, port));

    let mut record = ServerRecord::new(
        Uuid::nil(),
        name,
        address,
        port,
        ProtocolSettings::Vmess {
            uuid,
            alter_id,
            security: str_field(&obj, "scy").unwrap_or_else(|| "auto".to_string()),
        },
    );

    let network = match str_field(&obj, "net") {
        Some(n) => NetworkType::try_from(n.as_str())?,
        None => NetworkType::Tcp,
    };
    record.transport = TransportSettings {
        network,
        security: if str_field(&obj, "tls").as_deref() == Some("tls") {
            SecurityType::Tls
        } else {
            SecurityType::None
        },
        sni: str_field(&obj, "sni"),
        alpn: str_field(&obj, "alpn")
            .map(|a| a.split(',').map(str::to_string).collect())
            .unwrap_or_default(),
        fingerprint: str_field(&obj, "fp"),
        ws_path: str_field(&obj, "path"),
        ws_host: str_field(&obj, "host"),
        grpc_service_name: match network {
            // the v2 envelope reuses 'path' for the gRPC service name
            NetworkType::Grpc => str_field(&obj, "path"),
            _ => None,
        },
        allow_insecure: false,
    };
    if network == NetworkType::Grpc {
        record.transport.ws_path = None;
    }

    Ok(record)
}

pub(super) fn generate(record: &ServerRecord) -> Result<String> {
    let ProtocolSettings::Vmess {
        uuid,
        alter_id,
        security,
    } = &record.settings
    else {
        return Err(Error::internal("vmess generator got non-vmess settings"));
    };
    if uuid.is_empty() {
        return Err(Error::missing_field("vmess", "uuid"));
    }

    let t = &record.transport;
    let path = match t.network {
        NetworkType::Grpc => t.grpc_service_name.clone(),
        _ => t.ws_path.clone(),
    };
    let envelope = json!({
        "v": "2",
        "ps": record.name,
        "add": record.address,
        "port": record.port.to_string(),
        "id": uuid,
        "aid": alter_id.to_string(),
        "scy": security,
        "net": t.network.to_string(),
        "tls": if t.security == SecurityType::Tls { "tls" } else { "" },
        "sni": t.sni.clone().unwrap_or_default(),
        "host": t.ws_host.clone().unwrap_or_default(),
        "path": path.unwrap_or_default(),
        "alpn": t.alpn.join(","),
        "fp": t.fingerprint.clone().unwrap_or_default(),
    });

    Ok(format!("vmess://{}", STANDARD.encode(envelope.to_string())))
}

fn str_field(obj: &Value, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Link generators disagree on whether numeric fields are numbers or
/// strings; accept both.
fn num_field(obj: &Value, key: &str) -> Option<u64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
