//! Shared share-link plumbing: authority/query/fragment splitting

use crate::{Error, Result};

/// Decomposed `userinfo@host:port?query#fragment` tail of a share link.
/// Userinfo, query values and the fragment come back percent-decoded.
#[derive(Debug, Default)]
pub(crate) struct UriParts {
    pub userinfo: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub query: Vec<(String, String)>,
    pub fragment: Option<String>,
}

pub(crate) fn split_authority(rest: &str) -> Result<UriParts> {
    let mut parts = UriParts::default();

    let rest = match rest.rfind('#') {
        Some(idx) => {
            let frag = urlencoding::decode(&rest[idx + 1..])
                .map_err(|e| Error::parse(format!("bad fragment encoding: {}", e)))?;
            if !frag.is_empty() {
                parts.fragment = Some(frag.into_owned());
            }
            &rest[..idx]
        }
        None => rest,
    };

    let rest = match rest.find('?') {
        Some(idx) => {
            parts.query = parse_query(&rest[idx + 1..])?;
            &rest[..idx]
        }
        None => rest,
    };

    let rest = match rest.rfind('@') {
        Some(idx) => {
            let user = urlencoding::decode(&rest[..idx])
                .map_err(|e| Error::parse(format!("bad userinfo encoding: {}", e)))?;
            parts.userinfo = Some(user.into_owned());
            &rest[idx + 1..]
        }
        None => rest,
    };

    // host[:port], with bracketed IPv6 support
    let (host, port_str) = if let Some(stripped) = rest.strip_prefix('[') {
        let close = stripped
            .find(']')
            .ok_or_else(|| Error::parse("unterminated IPv6 literal"))?;
        let host = &stripped[..close];
        let tail = &stripped[close + 1..];
        let port = tail.strip_prefix(':');
        (host.to_string(), port)
    } else {
        match rest.rfind(':') {
            Some(idx) => (rest[..idx].to_string(), Some(&rest[idx + 1..])),
            None => (rest.to_string(), None),
        }
    };

    if host.is_empty() {
        return Err(Error::parse("empty host"));
    }
    parts.host = host;
    parts.port = match port_str {
        Some(p) => Some(
            p.parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| Error::parse(format!("invalid port: {}", p)))?,
        ),
        None => None,
    };

    Ok(parts)
}

pub(crate) fn parse_query(query: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for param in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match param.find('=') {
            Some(idx) => (&param[..idx], &param[idx + 1..]),
            None => (param, ""),
        };
        let value = urlencoding::decode(value)
            .map_err(|e| Error::parse(format!("bad query encoding: {}", e)))?;
        pairs.push((key.to_string(), value.into_owned()));
    }
    Ok(pairs)
}

pub(crate) fn query_get<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

/// Serialize query pairs in the given order, percent-encoding values and
/// dropping empties so generated links stay canonical.
pub(crate) fn encode_query(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Format a host for the authority section, bracketing IPv6 literals.
pub(crate) fn format_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}
