//! Shadowsocks codec: `ss://base64(method:password)@host:port#name`

use super::{split_authority, OutboundConfig, OutboundSettings, ServerEntry, PROXY_TAG};
use crate::model::{Protocol, ProtocolSettings, ServerRecord};
use crate::{Error, Result};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use uuid::Uuid;

/// AEAD ciphers the engine accepts.
const KNOWN_METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
    "none",
];

pub(super) fn synthesize(record: &ServerRecord) -> Result<OutboundConfig> {
    let ProtocolSettings::Shadowsocks { method, password } = &record.settings else {
        return Err(Error::internal("shadowsocks synthesizer got non-ss settings"));
    };
    if method.is_empty() {
        return Err(Error::missing_field("shadowsocks", "method"));
    }
    if !KNOWN_METHODS.contains(&method.as_str()) {
        return Err(Error::validation(format!(
            "shadowsocks: unknown cipher method '{}'",
            method
        )));
    }
    if password.is_empty() {
        return Err(Error::missing_field("shadowsocks", "password"));
    }

    Ok(OutboundConfig {
        tag: PROXY_TAG.to_string(),
        protocol: "shadowsocks".to_string(),
        settings: Some(OutboundSettings::Servers {
            servers: vec![ServerEntry {
                address: record.address.clone(),
                port: record.port,
                password: Some(password.clone()),
                method: Some(method.clone()),
            }],
        }),
        stream_settings: None,
    })
}

pub(super) fn parse(rest: &str) -> Result<ServerRecord> {
    let parts = split_authority(rest)?;
    let userinfo = parts
        .userinfo
        .ok_or_else(|| Error::parse("ss: missing userinfo"))?;

    // SIP002 carries base64(method:password); older links may leave it plain.
    let decoded = decode_userinfo(&userinfo).unwrap_or(userinfo);
    let (method, password) = decoded
        .split_once(':')
        .ok_or_else(|| Error::parse("ss: userinfo is not method:password"))?;
    if method.is_empty() {
        return Err(Error::parse("ss: empty cipher method"));
    }

    let port = parts
        .port
        .unwrap_or_else(|| Protocol::Shadowsocks.default_port());
    let name = parts
        .fragment
        .unwrap_or_else(|| format!("{}:{}", parts.host, port));

    Ok(ServerRecord::new(
        Uuid::nil(),
        name,
        parts.host,
        port,
        ProtocolSettings::Shadowsocks {
            method: method.to_string(),
            password: password.to_string(),
        },
    ))
}

fn decode_userinfo(userinfo: &str) -> Option<String> {
    let trimmed = userinfo.trim_end_matches('=');
    let bytes = STANDARD_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
        .ok()?;
    String::from_utf8(bytes).ok().filter(|s| s.contains(':'))
}

pub(super) fn generate(record: &ServerRecord) -> Result<String> {
    let ProtocolSettings::Shadowsocks { method, password } = &record.settings else {
        return Err(Error::internal("shadowsocks generator got non-ss settings"));
    };
    if method.is_empty() {
        return Err(Error::missing_field("shadowsocks", "method"));
    }
    if password.is_empty() {
        return Err(Error::missing_field("shadowsocks", "password"));
    }

    let userinfo = URL_SAFE_NO_PAD.encode(format!("{}:{}", method, password));
    Ok(format!(
        "ss://{}@{}:{}#{}",
        userinfo,
        super::uri::format_host(&record.address),
        record.port,
        urlencoding::encode(&record.name)
    ))
}
