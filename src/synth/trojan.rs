//! Trojan codec: `trojan://password@host:port?query#name`

use super::{
    encode_query, split_authority, stream_from_transport, transport_from_query,
    transport_query_pairs, OutboundConfig, OutboundSettings, ServerEntry, PROXY_TAG,
};
use crate::model::{Protocol, ProtocolSettings, SecurityType, ServerRecord};
use crate::{Error, Result};
use uuid::Uuid;

pub(super) fn synthesize(record: &ServerRecord) -> Result<OutboundConfig> {
    let ProtocolSettings::Trojan { password } = &record.settings else {
        return Err(Error::internal("trojan synthesizer got non-trojan settings"));
    };
    if password.is_empty() {
        return Err(Error::missing_field("trojan", "password"));
    }

    Ok(OutboundConfig {
        tag: PROXY_TAG.to_string(),
        protocol: "trojan".to_string(),
        settings: Some(OutboundSettings::Servers {
            servers: vec![ServerEntry {
                address: record.address.clone(),
                port: record.port,
                password: Some(password.clone()),
                method: None,
            }],
        }),
        stream_settings: Some(stream_from_transport(record, &record.transport)?),
    })
}

pub(super) fn parse(rest: &str) -> Result<ServerRecord> {
    let parts = split_authority(rest)?;
    let password = parts
        .userinfo
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::parse("trojan: missing password"))?;
    let port = parts.port.unwrap_or_else(|| Protocol::Trojan.default_port());
    let name = parts
        .fragment
        .unwrap_or_else(|| format!("{}:{}", parts.host, port));

    let mut record = ServerRecord::new(
        Uuid::nil(),
        name,
        parts.host,
        port,
        ProtocolSettings::Trojan { password },
    );
    // trojan always runs over TLS
    record.transport = transport_from_query(&parts.query, SecurityType::Tls)?;
    if record.transport.security == SecurityType::None {
        record.transport.security = SecurityType::Tls;
    }
    Ok(record)
}

pub(super) fn generate(record: &ServerRecord) -> Result<String> {
    let ProtocolSettings::Trojan { password } = &record.settings else {
        return Err(Error::internal("trojan generator got non-trojan settings"));
    };
    if password.is_empty() {
        return Err(Error::missing_field("trojan", "password"));
    }

    let query = encode_query(&transport_query_pairs(&record.transport));
    Ok(format!(
        "trojan://{}@{}:{}?{}#{}",
        urlencoding::encode(password),
        super::uri::format_host(&record.address),
        record.port,
        query,
        urlencoding::encode(&record.name)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetworkType;
    use crate::synth::{generate_uri, parse_uri};

    #[test]
    fn parse_basic_link() {
        let r = parse_uri("trojan://secret@node.example.com:8443?sni=cdn.example.com#HK%201")
            .unwrap();
        assert_eq!(r.protocol(), Protocol::Trojan);
        assert_eq!(r.address, "node.example.com");
        assert_eq!(r.port, 8443);
        assert_eq!(r.name, "HK 1");
        assert_eq!(
            r.settings,
            ProtocolSettings::Trojan {
                password: "secret".into()
            }
        );
        assert_eq!(r.transport.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(r.transport.security, SecurityType::Tls);
    }

    #[test]
    fn missing_password_is_parse_error() {
        assert!(parse_uri("trojan://node.example.com:443").is_err());
    }

    #[test]
    fn synthesize_requires_password() {
        let mut r = ServerRecord::new(
            Uuid::new_v4(),
            "n".into(),
            "h.example.com".into(),
            443,
            ProtocolSettings::Trojan {
                password: String::new(),
            },
        );
        r.transport.security = SecurityType::Tls;
        let err = synthesize(&r).unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn synthesize_forces_tls() {
        let r = ServerRecord::new(
            Uuid::new_v4(),
            "n".into(),
            "h.example.com".into(),
            443,
            ProtocolSettings::Trojan {
                password: "pw".into(),
            },
        );
        // transport says none; trojan cannot run without a security layer
        let out = synthesize(&r).unwrap();
        assert_eq!(out.stream_settings.unwrap().security, "tls");
    }

    #[test]
    fn round_trip_required_fields() {
        let mut r = ServerRecord::new(
            Uuid::new_v4(),
            "Tokyo WS".into(),
            "t.example.com".into(),
            443,
            ProtocolSettings::Trojan {
                password: "p@ss:word".into(),
            },
        );
        r.transport.security = SecurityType::Tls;
        r.transport.network = NetworkType::Ws;
        r.transport.sni = Some("t.example.com".into());
        r.transport.ws_path = Some("/tunnel".into());
        r.transport.ws_host = Some("t.example.com".into());

        let parsed = parse_uri(&generate_uri(&r).unwrap()).unwrap();
        assert_eq!(parsed.settings, r.settings);
        assert_eq!(parsed.address, r.address);
        assert_eq!(parsed.port, r.port);
        assert_eq!(parsed.name, r.name);
        assert_eq!(parsed.transport, r.transport);
    }
}
