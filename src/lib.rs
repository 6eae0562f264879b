//! xray-pilot - proxy endpoint pool manager
//!
//! Keeps a pool of remote-proxy endpoints measured and decides which one
//! the active tunnel should use:
//! - Protocol synthesizer (vmess/vless/trojan/ss/hysteria2/reality/xhttp)
//! - Latency probing with EWMA smoothing
//! - Hysteresis-gated auto-switch with rollback
//! - Subscription and routing-rule reconciliation with backoff
//!
//! # Architecture
//!
//! ```text
//!                  +----------------+
//!                  |  Pilot (svc)   |
//!                  +-------+--------+
//!                          |
//!      +---------+---------+----------+-----------+
//!      |         |         |          |           |
//! +----v---+ +---v----+ +--v else-+ +-v-------+ +-v--------+
//! | probe/ | |selector| |reconcile| | store/  | | engine/  |
//! | (ping) | | (core) | | (sync)  | | (CRUD)  | | (extern) |
//! +--------+ +---+----+ +----+----+ +---------+ +----------+
//!                |           |
//!          +-----v----+ +----v----+
//!          | assemble/| |  synth/ |
//!          +----------+ +---------+
//! ```

pub mod assemble;
pub mod common;
pub mod config;
pub mod engine;
pub mod model;
pub mod probe;
pub mod reconcile;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod synth;

pub use common::error::{Error, Result};
pub use config::Config;

use assemble::RoutePolicy;
use engine::{CaptureInterface, TunnelEngine};
use parking_lot::RwLock;
use probe::SweepOptions;
use reconcile::{
    HttpRulesetFetcher, HttpSubscriptionFetcher, ReconcileConfig, RoutingReconciler,
    SubscriptionReconciler,
};
use scheduler::Scheduler;
use selector::{SelectionController, SelectionPolicy};
use std::sync::Arc;
use std::time::Duration;
use store::StoreHandle;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service instance wiring probes, selection and reconciliation together.
/// The store and engine handles are constructed by the host and passed in.
pub struct Pilot {
    config: Config,
    store: StoreHandle,
    controller: Arc<SelectionController>,
    subscriptions: Arc<SubscriptionReconciler>,
    routing: Option<Arc<RoutingReconciler>>,
    scheduler: Scheduler,
    sweep_gate: Mutex<()>,
}

impl Pilot {
    pub fn new(config: Config, store: StoreHandle, engine: Arc<dyn TunnelEngine>) -> Result<Self> {
        let reconcile_cfg = ReconcileConfig {
            max_backoff: Duration::from_secs(config.reconcile.max_backoff_secs),
            stale_after: config.reconcile.stale_after,
            fetch_timeout: Duration::from_secs(config.reconcile.fetch_timeout_secs),
        };

        let route_policy = Arc::new(RwLock::new(RoutePolicy::default()));

        let controller = Arc::new(SelectionController::new(
            store.clone(),
            engine,
            CaptureInterface {
                name: config.capture.name.clone(),
                mtu: config.capture.mtu,
                fd: None,
            },
            SelectionPolicy {
                auto_switch: config.selection.auto_switch,
                min_ping_threshold_ms: config.selection.min_ping_threshold_ms,
            },
            route_policy.clone(),
        ));

        let subscriptions = Arc::new(SubscriptionReconciler::new(
            store.clone(),
            Box::new(HttpSubscriptionFetcher::new(&reconcile_cfg)?),
            reconcile_cfg,
        ));

        let routing = match &config.routing.ruleset_url {
            Some(url) => Some(Arc::new(RoutingReconciler::new(
                Box::new(HttpRulesetFetcher::new(url.clone(), &reconcile_cfg)?),
                route_policy,
                Duration::from_secs(config.routing.refresh_interval_secs),
                reconcile_cfg,
            ))),
            None => None,
        };

        Ok(Pilot {
            config,
            store,
            controller,
            subscriptions,
            routing,
            scheduler: Scheduler::new(),
            sweep_gate: Mutex::new(()),
        })
    }

    pub fn store(&self) -> StoreHandle {
        self.store.clone()
    }

    pub fn controller(&self) -> Arc<SelectionController> {
        self.controller.clone()
    }

    /// Spawn the three periodic tasks.
    pub fn start(self: &Arc<Self>) {
        info!("xray-pilot v{} starting", VERSION);

        let pilot = self.clone();
        self.scheduler.spawn(
            "ping-sweep",
            Duration::from_secs(self.config.ping.interval_secs),
            0.1,
            move || {
                let pilot = pilot.clone();
                async move {
                    if let Err(e) = pilot.run_ping_sweep().await {
                        warn!(error = %e, "ping sweep tick failed");
                    }
                }
            },
        );

        let pilot = self.clone();
        self.scheduler.spawn(
            "subscription-refresh",
            Duration::from_secs(self.config.subscription.check_interval_secs),
            0.1,
            move || {
                let pilot = pilot.clone();
                async move {
                    if let Err(e) = pilot.run_subscription_refresh().await {
                        warn!(error = %e, "subscription tick failed");
                    }
                }
            },
        );

        if self.routing.is_some() {
            let pilot = self.clone();
            self.scheduler.spawn(
                "routing-refresh",
                Duration::from_secs(self.config.subscription.check_interval_secs),
                0.1,
                move || {
                    let pilot = pilot.clone();
                    async move {
                        if let Err(e) = pilot.run_routing_refresh().await {
                            warn!(error = %e, "routing tick failed");
                        }
                    }
                },
            );
        }
    }

    /// Probe every endpoint, then run the selection decision on the settled
    /// batch. Re-triggering while a sweep is in flight is a no-op.
    pub async fn run_ping_sweep(&self) -> Result<()> {
        let Ok(_guard) = self.sweep_gate.try_lock() else {
            info!("ping sweep already in flight, skipping trigger");
            return Ok(());
        };
        let opts = SweepOptions {
            timeout: self.config.ping_timeout(),
            concurrency: self.config.ping.concurrency,
        };
        probe::sweep(self.store.as_ref(), opts).await?;
        self.controller.evaluate().await?;
        Ok(())
    }

    /// Refresh all due subscription groups.
    pub async fn run_subscription_refresh(&self) -> Result<()> {
        self.subscriptions.tick().await
    }

    /// Refresh the routing ruleset, if an upstream is configured.
    pub async fn run_routing_refresh(&self) -> Result<()> {
        match &self.routing {
            Some(routing) => routing.tick().await,
            None => Ok(()),
        }
    }

    /// Cancel background work and tear the tunnel down before returning.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down");
        self.scheduler.shutdown().await;
        self.controller.disconnect().await?;
        info!("stopped");
        Ok(())
    }
}
