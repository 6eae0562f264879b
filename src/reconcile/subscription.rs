//! Subscription refresh: fetch, parse, diff, atomic replace

use super::{backoff_interval, ReconcileConfig};
use crate::model::{ServerGroup, ServerRecord};
use crate::store::StoreHandle;
use crate::synth;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};
use uuid::Uuid;

static DEFAULT_USER_AGENT: Lazy<String> = Lazy::new(|| format!("xray-pilot/{}", crate::VERSION));

/// Fetch collaborator for subscription bodies.
#[async_trait]
pub trait SubscriptionFetch: Send + Sync {
    async fn fetch(&self, group: &ServerGroup) -> Result<String>;
}

/// HTTP GET with optional basic auth and custom user-agent.
pub struct HttpSubscriptionFetcher {
    client: reqwest::Client,
}

impl HttpSubscriptionFetcher {
    pub fn new(cfg: &ReconcileConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.fetch_timeout)
            .build()?;
        Ok(HttpSubscriptionFetcher { client })
    }
}

#[async_trait]
impl SubscriptionFetch for HttpSubscriptionFetcher {
    async fn fetch(&self, group: &ServerGroup) -> Result<String> {
        let url = group
            .subscription_url
            .as_ref()
            .ok_or_else(|| Error::config(format!("group '{}' has no subscription URL", group.name)))?;

        let ua = group
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.clone());
        let mut request = self.client.get(url).header(reqwest::header::USER_AGENT, ua);
        if let Some(auth) = &group.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::network(format!(
                "subscription fetch returned {}",
                response.status()
            )));
        }
        Ok(response.text().await?)
    }
}

/// Decode the optional base64 envelope, then parse one record per line.
/// Malformed entries are skipped, never fatal. Returns the records and the
/// skipped-entry count.
pub fn parse_payload(content: &str) -> (Vec<ServerRecord>, usize) {
    let body = decode_envelope(content.trim());

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match synth::parse_uri(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(error = %e, entry = line, "skipping malformed subscription entry");
                skipped += 1;
            }
        }
    }
    (records, skipped)
}

/// Subscriptions commonly ship as one big base64 blob of the URI list.
fn decode_envelope(content: &str) -> String {
    let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let trimmed = compact.trim_end_matches('=');
    let decoded = STANDARD
        .decode(&compact)
        .or_else(|_| URL_SAFE.decode(&compact))
        .or_else(|_| STANDARD.decode(trimmed))
        .or_else(|_| URL_SAFE.decode(trimmed));
    match decoded {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) if text.contains("://") => text,
            _ => content.to_string(),
        },
        Err(_) => content.to_string(),
    }
}

/// Merge a fetched record list against the group's current one. Records with
/// a matching subscription key keep their id, measured state, usage stats
/// and user flags; everything protocol-side comes from the fetch.
pub fn diff_records(
    group_id: Uuid,
    existing: Vec<ServerRecord>,
    fetched: Vec<ServerRecord>,
) -> Vec<ServerRecord> {
    let mut by_key: HashMap<String, ServerRecord> = existing
        .into_iter()
        .map(|r| (r.subscription_key(), r))
        .collect();

    let mut out = Vec::with_capacity(fetched.len());
    let mut seen = HashSet::new();
    for mut record in fetched {
        let key = record.subscription_key();
        if !seen.insert(key.clone()) {
            continue; // duplicate entry in the feed
        }
        record.group_id = group_id;
        if let Some(kept) = by_key.remove(&key) {
            record.id = kept.id;
            record.measured = kept.measured;
            record.stats = kept.stats;
            record.favorite = kept.favorite;
            record.note = kept.note;
        }
        out.push(record);
    }
    out
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub total: usize,
    pub kept: usize,
    pub skipped: usize,
}

/// Drives per-group subscription refreshes with backoff.
pub struct SubscriptionReconciler {
    store: StoreHandle,
    fetcher: Box<dyn SubscriptionFetch>,
    cfg: ReconcileConfig,
    next_due: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    gate: tokio::sync::Mutex<()>,
}

impl SubscriptionReconciler {
    pub fn new(store: StoreHandle, fetcher: Box<dyn SubscriptionFetch>, cfg: ReconcileConfig) -> Self {
        SubscriptionReconciler {
            store,
            fetcher,
            cfg,
            next_due: Mutex::new(HashMap::new()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Refresh every auto-update group that is due. Idempotent and safe to
    /// re-trigger; groups that are not due yet are left alone, and a trigger
    /// while a tick is in flight is a no-op.
    pub async fn tick(&self) -> Result<()> {
        let Ok(_guard) = self.gate.try_lock() else {
            info!("subscription refresh already in flight, skipping trigger");
            return Ok(());
        };
        let groups = self.store.groups_with_auto_update().await?;
        let now = Utc::now();
        for group in groups {
            let due = self
                .next_due
                .lock()
                .get(&group.id)
                .copied()
                .map_or(true, |at| now >= at);
            if !due {
                continue;
            }
            if let Err(e) = self.refresh_group(&group).await {
                warn!(group = %group.name, error = %e, "subscription refresh failed");
            }
        }
        Ok(())
    }

    /// Refresh one group unconditionally.
    pub async fn refresh_group(&self, group: &ServerGroup) -> Result<RefreshOutcome> {
        let base = std::time::Duration::from_secs(group.update_interval_secs.max(60));

        let fetched = match self.fetcher.fetch(group).await {
            Ok(body) => body,
            Err(e) => {
                self.record_failure(group, e.to_string()).await?;
                return Err(e);
            }
        };

        let (records, skipped) = parse_payload(&fetched);
        if records.is_empty() {
            // an empty or unparseable feed never wipes the group
            let msg = format!("feed yielded no valid entries ({} skipped)", skipped);
            self.record_failure(group, msg.clone()).await?;
            return Err(Error::parse(msg));
        }

        let existing = self.store.records_in_group(group.id).await?;
        let merged = diff_records(group.id, existing, records);
        let outcome = RefreshOutcome {
            total: merged.len(),
            kept: merged.iter().filter(|r| r.measured.sample_count > 0).count(),
            skipped,
        };
        self.store.replace_group_records(group.id, merged).await?;

        let now = Utc::now();
        self.store
            .mark_group_result(group.id, Ok(now), self.cfg.stale_after)
            .await?;
        self.next_due
            .lock()
            .insert(group.id, now + ChronoDuration::from_std(base).unwrap_or_default());

        info!(
            group = %group.name,
            total = outcome.total,
            skipped = outcome.skipped,
            "subscription refreshed"
        );
        Ok(outcome)
    }

    async fn record_failure(&self, group: &ServerGroup, msg: String) -> Result<()> {
        let base = std::time::Duration::from_secs(group.update_interval_secs.max(60));
        let updated = self
            .store
            .mark_group_result(group.id, Err(msg), self.cfg.stale_after)
            .await?;
        let delay = backoff_interval(base, self.cfg.max_backoff, updated.consecutive_failures);
        self.next_due.lock().insert(
            group.id,
            Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use std::sync::Arc;

    const TROJAN_A: &str = "trojan://pw@a.example.com:443?security=tls#A";
    const TROJAN_B: &str = "trojan://pw@b.example.com:443?security=tls#B";
    const TROJAN_C: &str = "trojan://pw@c.example.com:443?security=tls#C";

    struct StaticFetcher(std::result::Result<String, String>);

    #[async_trait]
    impl SubscriptionFetch for StaticFetcher {
        async fn fetch(&self, _group: &ServerGroup) -> Result<String> {
            self.0
                .clone()
                .map_err(Error::network)
        }
    }

    fn reconciler(store: StoreHandle, body: std::result::Result<String, String>) -> SubscriptionReconciler {
        SubscriptionReconciler::new(
            store,
            Box::new(StaticFetcher(body)),
            ReconcileConfig {
                stale_after: 3,
                ..Default::default()
            },
        )
    }

    async fn subscribed_group(store: &MemoryStore) -> ServerGroup {
        let group = ServerGroup::with_subscription(
            "sub".into(),
            "https://feed.example.com/sub".into(),
            std::time::Duration::from_secs(3600),
        );
        store.insert_group(group.clone()).await.unwrap();
        group
    }

    #[test]
    fn payload_skips_malformed_lines() {
        let body = format!("{}\nnot-a-uri\n{}\n", TROJAN_A, TROJAN_B);
        let (records, skipped) = parse_payload(&body);
        assert_eq!(records.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn payload_unwraps_base64_envelope() {
        let plain = format!("{}\n{}", TROJAN_A, TROJAN_B);
        let enveloped = STANDARD.encode(&plain);
        let (records, skipped) = parse_payload(&enveloped);
        assert_eq!(records.len(), 2);
        assert_eq!(skipped, 0);
    }

    #[test]
    fn diff_preserves_kept_identity() {
        let gid = Uuid::new_v4();
        let (mut existing, _) = parse_payload(&format!("{}\n{}", TROJAN_A, TROJAN_B));
        for r in &mut existing {
            r.group_id = gid;
        }
        existing[0].measured.smoothed_ping_ms = 42;
        existing[0].measured.sample_count = 3;
        let a_id = existing[0].id;

        let (fetched, _) = parse_payload(&format!("{}\n{}", TROJAN_A, TROJAN_C));
        let merged = diff_records(gid, existing, fetched);

        let mut names: Vec<_> = merged.iter().map(|r| r.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["A", "C"]);

        let a = merged.iter().find(|r| r.name == "A").unwrap();
        assert_eq!(a.id, a_id);
        assert_eq!(a.measured.smoothed_ping_ms, 42);
        let c = merged.iter().find(|r| r.name == "C").unwrap();
        assert_eq!(c.measured.sample_count, 0);
    }

    #[tokio::test]
    async fn refresh_replaces_group_atomically() {
        let store = Arc::new(MemoryStore::new());
        let group = subscribed_group(&store).await;

        // seed {A, B}
        let (mut seed, _) = parse_payload(&format!("{}\n{}", TROJAN_A, TROJAN_B));
        for r in &mut seed {
            r.group_id = group.id;
            store.insert_record(r.clone()).await.unwrap();
        }
        let a_id = seed.iter().find(|r| r.name == "A").unwrap().id;

        // feed now yields {A, C}
        let rec = reconciler(store.clone(), Ok(format!("{}\n{}", TROJAN_A, TROJAN_C)));
        let outcome = rec.refresh_group(&group).await.unwrap();
        assert_eq!(outcome.total, 2);

        let mut names: Vec<_> = store
            .records_in_group(group.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.name.clone(), r.id))
            .collect();
        names.sort();
        assert_eq!(names[0].0, "A");
        assert_eq!(names[0].1, a_id);
        assert_eq!(names[1].0, "C");
    }

    #[tokio::test]
    async fn fetch_failure_backs_off_and_keeps_records() {
        let store = Arc::new(MemoryStore::new());
        let group = subscribed_group(&store).await;

        let (mut seed, _) = parse_payload(TROJAN_A);
        seed[0].group_id = group.id;
        store.insert_record(seed[0].clone()).await.unwrap();

        let rec = reconciler(store.clone(), Err("connection refused".into()));
        for _ in 0..3 {
            assert!(rec.refresh_group(&group).await.is_err());
        }

        let g = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(g.consecutive_failures, 3);
        assert!(g.stale);
        assert!(g.last_error.is_some());
        // last-known-good record set intact
        assert_eq!(store.records_in_group(group.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_feed_is_a_failure_not_a_wipe() {
        let store = Arc::new(MemoryStore::new());
        let group = subscribed_group(&store).await;

        let (mut seed, _) = parse_payload(TROJAN_A);
        seed[0].group_id = group.id;
        store.insert_record(seed[0].clone()).await.unwrap();

        let rec = reconciler(store.clone(), Ok("garbage\nmore garbage".into()));
        assert!(rec.refresh_group(&group).await.is_err());
        assert_eq!(store.records_in_group(group.id).await.unwrap().len(), 1);
    }

    struct SlowFailingFetcher {
        fetches: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl SubscriptionFetch for SlowFailingFetcher {
        async fn fetch(&self, _group: &ServerGroup) -> Result<String> {
            self.fetches
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Err(Error::network("upstream down"))
        }
    }

    #[tokio::test]
    async fn concurrent_ticks_fetch_once() {
        let store = Arc::new(MemoryStore::new());
        let group = subscribed_group(&store).await;

        let fetches = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let rec = SubscriptionReconciler::new(
            store.clone(),
            Box::new(SlowFailingFetcher {
                fetches: fetches.clone(),
            }),
            ReconcileConfig {
                stale_after: 3,
                ..Default::default()
            },
        );

        // a manual trigger racing the scheduled tick is a no-op
        let (a, b) = tokio::join!(rec.tick(), rec.tick());
        a.unwrap();
        b.unwrap();

        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
        let g = store.get_group(group.id).await.unwrap().unwrap();
        assert_eq!(g.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn tick_skips_groups_not_due() {
        let store = Arc::new(MemoryStore::new());
        let group = subscribed_group(&store).await;
        let rec = reconciler(store.clone(), Ok(TROJAN_A.to_string()));

        rec.tick().await.unwrap();
        assert_eq!(store.records_in_group(group.id).await.unwrap().len(), 1);

        // second tick inside the interval leaves the store alone even if the
        // feed changed
        let rec2 = SubscriptionReconciler {
            next_due: Mutex::new(rec.next_due.lock().clone()),
            ..reconciler(store.clone(), Ok(TROJAN_B.to_string()))
        };
        rec2.tick().await.unwrap();
        let names: Vec<_> = store
            .records_in_group(group.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["A"]);
    }
}
