//! Hysteria2 codec: `hysteria2://password@host:port?query#name` (alias `hy2://`)

use super::{
    encode_query, query_get, split_authority, stream_from_transport, ObfsSettings,
    OutboundConfig, OutboundSettings, PROXY_TAG,
};
use crate::model::{Protocol, ProtocolSettings, SecurityType, ServerRecord};
use crate::{Error, Result};
use uuid::Uuid;

pub(super) fn synthesize(record: &ServerRecord) -> Result<OutboundConfig> {
    let ProtocolSettings::Hysteria {
        password,
        obfs,
        obfs_password,
    } = &record.settings
    else {
        return Err(Error::internal("hysteria synthesizer got foreign settings"));
    };
    if password.is_empty() {
        return Err(Error::missing_field("hysteria", "password"));
    }
    if obfs.is_some() && obfs_password.is_none() {
        return Err(Error::missing_field("hysteria", "obfs_password"));
    }

    Ok(OutboundConfig {
        tag: PROXY_TAG.to_string(),
        protocol: "hysteria2".to_string(),
        settings: Some(OutboundSettings::Hysteria2 {
            address: record.address.clone(),
            port: record.port,
            password: password.clone(),
            obfs: obfs.as_ref().map(|o| ObfsSettings {
                r#type: o.clone(),
                password: obfs_password.clone(),
            }),
        }),
        stream_settings: Some(stream_from_transport(record, &record.transport)?),
    })
}

pub(super) fn parse(rest: &str) -> Result<ServerRecord> {
    let parts = split_authority(rest)?;
    let password = parts
        .userinfo
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::parse("hysteria: missing password"))?;
    let port = parts
        .port
        .unwrap_or_else(|| Protocol::Hysteria.default_port());
    let name = parts
        .fragment
        .unwrap_or_else(|| format!("{}:{}", parts.host, port));
    let query = &parts.query;

    let mut record = ServerRecord::new(
        Uuid::nil(),
        name,
        parts.host,
        port,
        ProtocolSettings::Hysteria {
            password,
            obfs: query_get(query, "obfs").map(str::to_string),
            obfs_password: query_get(query, "obfs-password").map(str::to_string),
        },
    );
    // hysteria2 is QUIC/TLS only
    record.transport.security = SecurityType::Tls;
    record.transport.sni = query_get(query, "sni").map(str::to_string);
    record.transport.allow_insecure =
        matches!(query_get(query, "insecure"), Some("1") | Some("true"));
    Ok(record)
}

pub(super) fn generate(record: &ServerRecord) -> Result<String> {
    let ProtocolSettings::Hysteria {
        password,
        obfs,
        obfs_password,
    } = &record.settings
    else {
        return Err(Error::internal("hysteria generator got foreign settings"));
    };
    if password.is_empty() {
        return Err(Error::missing_field("hysteria", "password"));
    }

    let t = &record.transport;
    let query = encode_query(&[
        ("sni", t.sni.clone().unwrap_or_default()),
        (
            "insecure",
            if t.allow_insecure {
                "1".to_string()
            } else {
                String::new()
            },
        ),
        ("obfs", obfs.clone().unwrap_or_default()),
        ("obfs-password", obfs_password.clone().unwrap_or_default()),
    ]);

    Ok(format!(
        "hysteria2://{}@{}:{}?{}#{}",
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
    use crate::synth::{generate_uri, parse_uri, synthesize};

    #[test]
    fn parse_with_obfs() {
        let r = parse_uri(
            "hysteria2://letmein@hy.example.com:443?sni=hy.example.com&obfs=salamander&obfs-password=ob#HY",
        )
        .unwrap();
        assert_eq!(r.protocol(), Protocol::Hysteria);
        assert_eq!(
            r.settings,
            ProtocolSettings::Hysteria {
                password: "letmein".into(),
                obfs: Some("salamander".into()),
                obfs_password: Some("ob".into()),
            }
        );
        assert_eq!(r.transport.security, SecurityType::Tls);
    }

    #[test]
    fn hy2_alias_accepted() {
        let r = parse_uri("hy2://pw@hy.example.com:8443#N").unwrap();
        assert_eq!(r.port, 8443);
        assert_eq!(r.protocol(), Protocol::Hysteria);
    }

    #[test]
    fn insecure_flag_parses() {
        let r = parse_uri("hysteria2://pw@hy.example.com:443?insecure=1").unwrap();
        assert!(r.transport.allow_insecure);
    }

    #[test]
    fn obfs_without_password_rejected_at_synthesis() {
        let r = ServerRecord::new(
            Uuid::new_v4(),
            "n".into(),
            "h.example.com".into(),
            443,
            ProtocolSettings::Hysteria {
                password: "pw".into(),
                obfs: Some("salamander".into()),
                obfs_password: None,
            },
        );
        let err = synthesize(&r).unwrap_err();
        assert!(err.to_string().contains("obfs_password"));
    }

    #[test]
    fn round_trip_required_fields() {
        let mut r = ServerRecord::new(
            Uuid::new_v4(),
            "HY SG".into(),
            "sg.example.com".into(),
            443,
            ProtocolSettings::Hysteria {
                password: "p w".into(),
                obfs: Some("salamander".into()),
                obfs_password: Some("o p".into()),
            },
        );
        r.transport.security = SecurityType::Tls;
        r.transport.sni = Some("sg.example.com".into());

        let parsed = parse_uri(&generate_uri(&r).unwrap()).unwrap();
        assert_eq!(parsed.settings, r.settings);
        assert_eq!(parsed.address, r.address);
        assert_eq!(parsed.port, r.port);
        assert_eq!(parsed.name, r.name);
        assert_eq!(parsed.transport.sni, r.transport.sni);
    }
}
