//! Routing-rule refresh: fetch, validate, atomic swap
//!
//! Invalid data keeps the previous ruleset fully intact; a new policy is
//! built and checked in full before the live handle ever sees it.

use super::{backoff_interval, ReconcileConfig};
use crate::assemble::RoutePolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Upstream ruleset document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingRuleset {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub bypass_domains: Vec<String>,
    #[serde(default)]
    pub block_domains: Vec<String>,
    #[serde(default)]
    pub bypass_cidrs: Vec<String>,
    #[serde(default)]
    pub block_cidrs: Vec<String>,
}

impl RoutingRuleset {
    /// Full validation pass: every CIDR must parse before any of the
    /// ruleset is accepted.
    pub fn validate(&self) -> Result<RoutePolicy> {
        Ok(RoutePolicy {
            bypass_domains: self.bypass_domains.clone(),
            block_domains: self.block_domains.clone(),
            bypass_cidrs: parse_cidrs(&self.bypass_cidrs)?,
            block_cidrs: parse_cidrs(&self.block_cidrs)?,
        })
    }
}

fn parse_cidrs(cidrs: &[String]) -> Result<Vec<IpNet>> {
    cidrs
        .iter()
        .map(|c| {
            c.parse::<IpNet>()
                .map_err(|e| Error::parse(format!("invalid CIDR '{}': {}", c, e)))
        })
        .collect()
}

/// Fetch collaborator for the upstream ruleset.
#[async_trait]
pub trait RulesetFetch: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// GET of the ruleset JSON from a fixed upstream source.
pub struct HttpRulesetFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpRulesetFetcher {
    pub fn new(url: String, cfg: &ReconcileConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.fetch_timeout)
            .build()?;
        Ok(HttpRulesetFetcher { client, url })
    }
}

#[async_trait]
impl RulesetFetch for HttpRulesetFetcher {
    async fn fetch(&self) -> Result<String> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(Error::network(format!(
                "ruleset fetch returned {}",
                response.status()
            )));
        }
        Ok(response.text().await?)
    }
}

#[derive(Debug, Default)]
struct RulesetStatus {
    version: u64,
    consecutive_failures: u32,
    last_error: Option<String>,
    next_due: Option<DateTime<Utc>>,
}

/// Keeps the live [`RoutePolicy`] handle fresh.
pub struct RoutingReconciler {
    fetcher: Box<dyn RulesetFetch>,
    live: Arc<RwLock<RoutePolicy>>,
    status: Mutex<RulesetStatus>,
    base_interval: std::time::Duration,
    cfg: ReconcileConfig,
    gate: tokio::sync::Mutex<()>,
}

impl RoutingReconciler {
    pub fn new(
        fetcher: Box<dyn RulesetFetch>,
        live: Arc<RwLock<RoutePolicy>>,
        base_interval: std::time::Duration,
        cfg: ReconcileConfig,
    ) -> Self {
        RoutingReconciler {
            fetcher,
            live,
            status: Mutex::new(RulesetStatus::default()),
            base_interval,
            cfg,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// The live policy handle shared with the assembler.
    pub fn live_policy(&self) -> Arc<RwLock<RoutePolicy>> {
        self.live.clone()
    }

    pub fn current_version(&self) -> u64 {
        self.status.lock().version
    }

    /// Scheduled entry point; respects the backoff window. A trigger while
    /// a tick is in flight is a no-op.
    pub async fn tick(&self) -> Result<()> {
        let Ok(_guard) = self.gate.try_lock() else {
            info!("routing refresh already in flight, skipping trigger");
            return Ok(());
        };
        let due = self
            .status
            .lock()
            .next_due
            .map_or(true, |at| Utc::now() >= at);
        if !due {
            return Ok(());
        }
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "routing refresh failed, keeping previous ruleset");
        }
        Ok(())
    }

    /// Fetch and swap once. Any failure leaves the live policy untouched.
    pub async fn refresh(&self) -> Result<()> {
        let outcome = self.try_refresh().await;
        let mut status = self.status.lock();
        match outcome {
            Ok(version) => {
                status.version = version;
                status.consecutive_failures = 0;
                status.last_error = None;
                status.next_due = Some(
                    Utc::now()
                        + ChronoDuration::from_std(self.base_interval).unwrap_or_default(),
                );
                Ok(())
            }
            Err(e) => {
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                status.last_error = Some(e.to_string());
                let delay = backoff_interval(
                    self.base_interval,
                    self.cfg.max_backoff,
                    status.consecutive_failures,
                );
                status.next_due = Some(Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default());
                Err(e)
            }
        }
    }

    async fn try_refresh(&self) -> Result<u64> {
        let body = self.fetcher.fetch().await?;
        let ruleset: RoutingRuleset = serde_json::from_str(&body)?;
        // build the replacement in full before touching the live handle
        let policy = ruleset.validate()?;
        *self.live.write() = policy;
        info!(
            version = ruleset.version,
            bypass = ruleset.bypass_domains.len() + ruleset.bypass_cidrs.len(),
            block = ruleset.block_domains.len() + ruleset.block_cidrs.len(),
            "routing ruleset swapped"
        );
        Ok(ruleset.version)
    }
}
