//! Config assembler: one selected record -> a full tunnel configuration
//!
//! Deterministic for identical inputs; no wall clock, no randomness. The
//! rule list is ordered so explicit bypass/block always pre-empts the
//! catch-all (first matching rule wins in the engine).

use crate::model::ServerRecord;
use crate::synth::{self, OutboundConfig, BLOCK_TAG, DIRECT_TAG, PROXY_TAG};
use crate::Result;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Hard-coded resolver pair used when a record carries no DNS override.
pub const FALLBACK_DNS: [&str; 2] = ["1.1.1.1", "8.8.8.8"];

/// Extra routing data merged into every assembled config, sourced from the
/// live routing ruleset (see `reconcile::routing`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePolicy {
    pub bypass_domains: Vec<String>,
    pub block_domains: Vec<String>,
    pub bypass_cidrs: Vec<IpNet>,
    pub block_cidrs: Vec<IpNet>,
}

/// Fully assembled engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub dns: DnsSection,
    pub outbounds: Vec<OutboundConfig>,
    pub routing: RoutingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsSection {
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSection {
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    pub outbound_tag: String,
}

impl RoutingRule {
    fn domains(domains: Vec<String>, tag: &str) -> Self {
        RoutingRule {
            rule_type: "field".to_string(),
            domain: Some(domains),
            ip: None,
            outbound_tag: tag.to_string(),
        }
    }

    fn ips(cidrs: Vec<String>, tag: &str) -> Self {
        RoutingRule {
            rule_type: "field".to_string(),
            domain: None,
            ip: Some(cidrs),
            outbound_tag: tag.to_string(),
        }
    }

    fn catch_all(tag: &str) -> Self {
        RoutingRule {
            rule_type: "field".to_string(),
            domain: None,
            ip: None,
            outbound_tag: tag.to_string(),
        }
    }
}

impl RoutingSection {
    /// First-match-wins preview of where a domain would be routed.
    pub fn match_domain(&self, domain: &str) -> &str {
        for rule in &self.rules {
            match &rule.domain {
                Some(domains) => {
                    if domains
                        .iter()
                        .any(|d| domain == d || domain.ends_with(&format!(".{}", d)))
                    {
                        return &rule.outbound_tag;
                    }
                }
                None if rule.ip.is_none() => return &rule.outbound_tag,
                None => {}
            }
        }
        PROXY_TAG
    }

    /// First-match-wins preview of where an address would be routed.
    pub fn match_ip(&self, addr: IpAddr) -> &str {
        for rule in &self.rules {
            match &rule.ip {
                Some(cidrs) => {
                    let hit = cidrs
                        .iter()
                        .filter_map(|c| c.parse::<IpNet>().ok())
                        .any(|net| net.contains(&addr));
                    if hit {
                        return &rule.outbound_tag;
                    }
                }
                None if rule.domain.is_none() => return &rule.outbound_tag,
                None => {}
            }
        }
        PROXY_TAG
    }
}

/// Compose the full tunnel config for one record plus routing policy.
pub fn assemble(record: &ServerRecord, policy: &RoutePolicy) -> Result<TunnelConfig> {
    let primary = synth::synthesize(record)?;

    let dns = if record.routing.dns_servers.is_empty() {
        FALLBACK_DNS.iter().map(|s| s.to_string()).collect()
    } else {
        record.routing.dns_servers.clone()
    };

    let bypass_domains = merge(&record.routing.bypass_domains, &policy.bypass_domains);
    let block_domains = merge(&record.routing.block_domains, &policy.block_domains);
    let bypass_cidrs = merge_cidrs(&record.routing.bypass_cidrs, &policy.bypass_cidrs);
    let block_cidrs = merge_cidrs(&record.routing.block_cidrs, &policy.block_cidrs);

    let mut rules = Vec::new();
    if !bypass_domains.is_empty() {
        rules.push(RoutingRule::domains(bypass_domains, DIRECT_TAG));
    }
    if !block_domains.is_empty() {
        rules.push(RoutingRule::domains(block_domains, BLOCK_TAG));
    }
    if !bypass_cidrs.is_empty() {
        rules.push(RoutingRule::ips(bypass_cidrs, DIRECT_TAG));
    }
    if !block_cidrs.is_empty() {
        rules.push(RoutingRule::ips(block_cidrs, BLOCK_TAG));
    }
    rules.push(RoutingRule::catch_all(PROXY_TAG));

    Ok(TunnelConfig {
        dns: DnsSection { servers: dns },
        outbounds: vec![primary, OutboundConfig::direct(), OutboundConfig::block()],
        routing: RoutingSection { rules },
    })
}

fn merge(own: &[String], extra: &[String]) -> Vec<String> {
    let mut out = own.to_vec();
    for item in extra {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn merge_cidrs(own: &[IpNet], extra: &[IpNet]) -> Vec<String> {
    let mut nets = own.to_vec();
    for net in extra {
        if !nets.contains(net) {
            nets.push(*net);
        }
    }
    nets.iter().map(|n| n.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProtocolSettings;
    use uuid::Uuid;

    fn record() -> ServerRecord {
        ServerRecord::new(
            Uuid::new_v4(),
            "n".into(),
            "t.example.com".into(),
            443,
            ProtocolSettings::Trojan {
                password: "pw".into(),
            },
        )
    }

    #[test]
    fn outbounds_are_primary_direct_block() {
        let cfg = assemble(&record(), &RoutePolicy::default()).unwrap();
        let tags: Vec<_> = cfg.outbounds.iter().map(|o| o.tag.as_str()).collect();
        assert_eq!(tags, vec!["proxy", "direct", "block"]);
    }

    #[test]
    fn bypass_rule_preempts_catch_all() {
        let mut r = record();
        r.routing.bypass_domains = vec!["example.com".into()];
        let cfg = assemble(&r, &RoutePolicy::default()).unwrap();

        assert_eq!(cfg.routing.match_domain("example.com"), DIRECT_TAG);
        assert_eq!(cfg.routing.match_domain("sub.example.com"), DIRECT_TAG);
        assert_eq!(cfg.routing.match_domain("other.net"), PROXY_TAG);
    }

    #[test]
    fn block_rule_preempts_catch_all() {
        let mut r = record();
        r.routing.block_domains = vec!["ads.example.net".into()];
        let cfg = assemble(&r, &RoutePolicy::default()).unwrap();
        assert_eq!(cfg.routing.match_domain("ads.example.net"), BLOCK_TAG);
    }

    #[test]
    fn bypass_beats_block_when_both_present() {
        // rule order: bypass first, so an overlap resolves direct
        let mut r = record();
        r.routing.bypass_domains = vec!["dual.example.com".into()];
        r.routing.block_domains = vec!["dual.example.com".into()];
        let cfg = assemble(&r, &RoutePolicy::default()).unwrap();
        assert_eq!(cfg.routing.match_domain("dual.example.com"), DIRECT_TAG);
    }

    #[test]
    fn cidr_rules_route_ips() {
        let mut r = record();
        r.routing.bypass_cidrs = vec!["10.0.0.0/8".parse().unwrap()];
        let policy = RoutePolicy {
            block_cidrs: vec!["203.0.113.0/24".parse().unwrap()],
            ..Default::default()
        };
        let cfg = assemble(&r, &policy).unwrap();
        assert_eq!(cfg.routing.match_ip("10.1.2.3".parse().unwrap()), DIRECT_TAG);
        assert_eq!(
            cfg.routing.match_ip("203.0.113.9".parse().unwrap()),
            BLOCK_TAG
        );
        assert_eq!(cfg.routing.match_ip("8.8.4.4".parse().unwrap()), PROXY_TAG);
    }

    #[test]
    fn dns_falls_back_to_hardcoded_pair() {
        let cfg = assemble(&record(), &RoutePolicy::default()).unwrap();
        assert_eq!(cfg.dns.servers, vec!["1.1.1.1", "8.8.8.8"]);

        let mut r = record();
        r.routing.dns_servers = vec!["9.9.9.9".into()];
        let cfg = assemble(&r, &RoutePolicy::default()).unwrap();
        assert_eq!(cfg.dns.servers, vec!["9.9.9.9"]);
    }

    #[test]
    fn assembly_is_deterministic() {
        let mut r = record();
        r.routing.bypass_domains = vec!["a.example.com".into()];
        let policy = RoutePolicy {
            bypass_domains: vec!["b.example.com".into()],
            ..Default::default()
        };
        let a = assemble(&r, &policy).unwrap();
        let b = assemble(&r, &policy).unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }
}
