//! Selection controller: latency smoothing, hysteresis and the
//! connect/switch/disconnect state machine
//!
//! The controller is the single writer of the active tunnel. A switch is a
//! critical section behind one async mutex; no two switches can overlap and
//! no path out of a switch leaves the machine in `Switching`.

use crate::assemble::{self, RoutePolicy};
use crate::engine::{CaptureInterface, TunnelEngine};
use crate::model::ServerRecord;
use crate::store::StoreHandle;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Tunnel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Switching,
}

/// Knobs of the switch decision
#[derive(Debug, Clone, Copy)]
pub struct SelectionPolicy {
    pub auto_switch: bool,
    /// Required strict improvement of the candidate over the active server.
    pub min_ping_threshold_ms: u32,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy {
            auto_switch: true,
            min_ping_threshold_ms: 20,
        }
    }
}

/// Pick the best candidate: lowest smoothed ping, name as the deterministic
/// tie-break. Unreachable and never-probed records are out.
pub fn pick_candidate(records: &[ServerRecord]) -> Option<&ServerRecord> {
    records
        .iter()
        .filter(|r| r.measured.selectable())
        .min_by(|a, b| {
            a.measured
                .smoothed_ping_ms
                .cmp(&b.measured.smoothed_ping_ms)
                .then_with(|| a.name.cmp(&b.name))
        })
}

/// Hysteresis gate. `active_ping == None` means there is no usable active
/// server and the gate is open; otherwise the candidate must beat the active
/// ping by strictly more than the threshold.
pub fn should_switch(
    policy: &SelectionPolicy,
    active_ping: Option<u32>,
    candidate_ping: u32,
) -> bool {
    if !policy.auto_switch {
        return false;
    }
    match active_ping {
        None => true,
        Some(active) => active.saturating_sub(candidate_ping) > policy.min_ping_threshold_ms,
    }
}

struct ActiveState {
    conn: ConnState,
    active_id: Option<Uuid>,
}

/// Drives which server the tunnel uses
pub struct SelectionController {
    store: StoreHandle,
    engine: Arc<dyn TunnelEngine>,
    capture: CaptureInterface,
    policy: RwLock<SelectionPolicy>,
    route_policy: Arc<RwLock<RoutePolicy>>,
    state: Mutex<ActiveState>,
}

impl SelectionController {
    pub fn new(
        store: StoreHandle,
        engine: Arc<dyn TunnelEngine>,
        capture: CaptureInterface,
        policy: SelectionPolicy,
        route_policy: Arc<RwLock<RoutePolicy>>,
    ) -> Self {
        SelectionController {
            store,
            engine,
            capture,
            policy: RwLock::new(policy),
            route_policy,
            state: Mutex::new(ActiveState {
                conn: ConnState::Disconnected,
                active_id: None,
            }),
        }
    }

    pub async fn state(&self) -> ConnState {
        self.state.lock().await.conn
    }

    pub async fn active_server(&self) -> Option<Uuid> {
        self.state.lock().await.active_id
    }

    pub fn set_policy(&self, policy: SelectionPolicy) {
        *self.policy.write() = policy;
    }

    /// Run the decision procedure once, after a completed probe batch.
    /// Returns the server switched to, if a switch happened.
    pub async fn evaluate(&self) -> Result<Option<Uuid>> {
        let records = self.store.records_by_ping().await?;
        let Some(candidate) = pick_candidate(&records).cloned() else {
            return Ok(None);
        };

        let mut state = self.state.lock().await;

        if state.active_id == Some(candidate.id) {
            return Ok(None);
        }

        // A deleted or unreachable active server opens the gate: failover
        // beats hysteresis.
        let active_ping = match state.active_id {
            Some(id) => records
                .iter()
                .find(|r| r.id == id)
                .filter(|r| r.measured.selectable())
                .map(|r| r.measured.smoothed_ping_ms),
            None => None,
        };

        let policy = *self.policy.read();
        if !should_switch(&policy, active_ping, candidate.measured.smoothed_ping_ms) {
            return Ok(None);
        }

        info!(
            candidate = %candidate.name,
            candidate_ping = candidate.measured.smoothed_ping_ms,
            active_ping = ?active_ping,
            "switching active server"
        );
        self.switch_locked(&mut state, candidate.clone()).await?;
        Ok(Some(candidate.id))
    }

    /// Explicitly connect to one server, switching away from any active one.
    pub async fn connect(&self, id: Uuid) -> Result<()> {
        let record = self
            .store
            .get_record(id)
            .await?
            .ok_or_else(|| Error::store(format!("no such record: {}", id)))?;
        let mut state = self.state.lock().await;
        self.switch_locked(&mut state, record).await
    }

    /// Tear down the active tunnel.
    pub async fn disconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.conn != ConnState::Disconnected {
            self.engine.stop().await?;
        }
        state.conn = ConnState::Disconnected;
        state.active_id = None;
        Ok(())
    }

    /// Guarded transition: tear down, start the target, only then mark
    /// connected. One rollback attempt on failure, Disconnected if that
    /// fails too.
    async fn switch_locked(&self, state: &mut ActiveState, target: ServerRecord) -> Result<()> {
        let previous = state.active_id;
        state.conn = if state.conn == ConnState::Connected {
            ConnState::Switching
        } else {
            ConnState::Connecting
        };

        if state.conn == ConnState::Switching {
            if let Err(e) = self.engine.stop().await {
                warn!(error = %e, "stopping active tunnel failed, continuing switch");
            }
            state.conn = ConnState::Connecting;
        }

        let route_policy = self.route_policy.read().clone();
        let config = match assemble::assemble(&target, &route_policy) {
            Ok(c) => c,
            Err(e) => {
                state.conn = ConnState::Disconnected;
                state.active_id = None;
                return Err(e);
            }
        };

        match self.engine.start(&config, &self.capture).await {
            Ok(()) => {
                state.conn = ConnState::Connected;
                state.active_id = Some(target.id);
                info!(server = %target.name, "tunnel connected");
                Ok(())
            }
            Err(start_err) => {
                warn!(server = %target.name, error = %start_err, "tunnel start failed");
                if let Some(prev_id) = previous {
                    if self.rollback(state, prev_id).await {
                        return Err(Error::tunnel_start(format!(
                            "switch to '{}' failed, rolled back: {}",
                            target.name, start_err
                        )));
                    }
                }
                state.conn = ConnState::Disconnected;
                state.active_id = None;
                Err(Error::tunnel_start(format!(
                    "connection failed: {}",
                    start_err
                )))
            }
        }
    }

    async fn rollback(&self, state: &mut ActiveState, prev_id: Uuid) -> bool {
        let Ok(Some(prev)) = self.store.get_record(prev_id).await else {
            return false;
        };
        let route_policy = self.route_policy.read().clone();
        let Ok(config) = assemble::assemble(&prev, &route_policy) else {
            return false;
        };
        match self.engine.start(&config, &self.capture).await {
            Ok(()) => {
                state.conn = ConnState::Connected;
                state.active_id = Some(prev_id);
                info!(server = %prev.name, "rolled back to previous server");
                true
            }
            Err(e) => {
                warn!(error = %e, "rollback failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::TunnelConfig;
    use crate::engine::NoopEngine;
    use crate::model::{ProtocolSettings, ServerGroup};
    use crate::store::{MemoryStore, Store};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record(gid: Uuid, name: &str, ping: u32, samples: u32) -> ServerRecord {
        let mut r = ServerRecord::new(
            gid,
            name.into(),
            format!("{name}.example.com"),
            443,
            ProtocolSettings::Trojan {
                password: "pw".into(),
            },
        );
        r.measured.smoothed_ping_ms = ping;
        r.measured.sample_count = samples;
        r
    }

    async fn seeded_store(records: Vec<ServerRecord>) -> StoreHandle {
        let store = MemoryStore::new();
        let mut gid = None;
        for r in &records {
            if gid != Some(r.group_id) {
                let mut g = ServerGroup::new(format!("g-{}", r.group_id));
                g.id = r.group_id;
                store.insert_group(g).await.unwrap();
                gid = Some(r.group_id);
            }
        }
        for r in records {
            store.insert_record(r).await.unwrap();
        }
        Arc::new(store)
    }

    fn controller(store: StoreHandle, engine: Arc<dyn TunnelEngine>, threshold: u32) -> SelectionController {
        SelectionController::new(
            store,
            engine,
            CaptureInterface::default(),
            SelectionPolicy {
                auto_switch: true,
                min_ping_threshold_ms: threshold,
            },
            Arc::new(RwLock::new(RoutePolicy::default())),
        )
    }

    #[test]
    fn candidate_is_min_ping_name_tiebreak() {
        let gid = Uuid::new_v4();
        let records = vec![
            record(gid, "zeta", 50, 1),
            record(gid, "alpha", 50, 1),
            record(gid, "slow", 90, 1),
        ];
        assert_eq!(pick_candidate(&records).unwrap().name, "alpha");
    }

    #[test]
    fn unreachable_and_unprobed_excluded() {
        let gid = Uuid::new_v4();
        let mut dead = record(gid, "dead", 5, 9);
        dead.measured.unreachable = true;
        let fresh = record(gid, "fresh", 0, 0);
        let ok = record(gid, "ok", 120, 2);
        let records = vec![dead, fresh, ok.clone()];
        assert_eq!(pick_candidate(&records).unwrap().id, ok.id);
    }

    #[test]
    fn hysteresis_blocks_small_gain() {
        let policy = SelectionPolicy {
            auto_switch: true,
            min_ping_threshold_ms: 10,
        };
        // 100 - 95 = 5, not > 10
        assert!(!should_switch(&policy, Some(100), 95));
    }

    #[test]
    fn hysteresis_allows_large_gain() {
        let policy = SelectionPolicy {
            auto_switch: true,
            min_ping_threshold_ms: 10,
        };
        // 100 - 80 = 20 > 10
        assert!(should_switch(&policy, Some(100), 80));
    }

    #[test]
    fn exact_threshold_does_not_switch() {
        let policy = SelectionPolicy {
            auto_switch: true,
            min_ping_threshold_ms: 10,
        };
        assert!(!should_switch(&policy, Some(100), 90));
    }

    #[test]
    fn auto_switch_off_blocks_everything() {
        let policy = SelectionPolicy {
            auto_switch: false,
            min_ping_threshold_ms: 10,
        };
        assert!(!should_switch(&policy, None, 10));
    }

    #[tokio::test]
    async fn evaluate_connects_when_idle() {
        let gid = Uuid::new_v4();
        let store = seeded_store(vec![record(gid, "a", 40, 2), record(gid, "b", 90, 2)]).await;
        let engine = Arc::new(NoopEngine::new());
        let ctl = controller(store, engine.clone(), 10);

        let switched = ctl.evaluate().await.unwrap();
        assert!(switched.is_some());
        assert_eq!(ctl.state().await, ConnState::Connected);
        assert!(engine.is_running());
    }

    #[tokio::test]
    async fn evaluate_respects_hysteresis() {
        let gid = Uuid::new_v4();
        let active = record(gid, "active", 100, 3);
        let near = record(gid, "near", 95, 3);
        let active_id = active.id;
        let store = seeded_store(vec![active, near]).await;
        let engine = Arc::new(NoopEngine::new());
        let ctl = controller(store, engine, 10);

        ctl.connect(active_id).await.unwrap();
        let switched = ctl.evaluate().await.unwrap();
        assert_eq!(switched, None);
        assert_eq!(ctl.active_server().await, Some(active_id));
    }

    #[tokio::test]
    async fn evaluate_switches_past_threshold() {
        let gid = Uuid::new_v4();
        let active = record(gid, "active", 100, 3);
        let fast = record(gid, "fast", 80, 3);
        let (active_id, fast_id) = (active.id, fast.id);
        let store = seeded_store(vec![active, fast]).await;
        let engine = Arc::new(NoopEngine::new());
        let ctl = controller(store, engine, 10);

        ctl.connect(active_id).await.unwrap();
        let switched = ctl.evaluate().await.unwrap();
        assert_eq!(switched, Some(fast_id));
        assert_eq!(ctl.active_server().await, Some(fast_id));
        assert_eq!(ctl.state().await, ConnState::Connected);
    }

    #[tokio::test]
    async fn unreachable_active_fails_over_regardless_of_ping() {
        let gid = Uuid::new_v4();
        let mut active = record(gid, "active", 30, 3);
        active.measured.unreachable = true;
        let backup = record(gid, "backup", 150, 3);
        let (active_id, backup_id) = (active.id, backup.id);
        let store = seeded_store(vec![active, backup]).await;
        let engine = Arc::new(NoopEngine::new());
        let ctl = controller(store.clone(), engine, 10);

        // connect directly, then the sweep flags the active server dead
        ctl.connect(active_id).await.unwrap();
        let switched = ctl.evaluate().await.unwrap();
        assert_eq!(switched, Some(backup_id));
    }

    /// Engine whose start fails a configurable number of times.
    #[derive(Default)]
    struct FlakyEngine {
        failures_left: AtomicU32,
        starts: AtomicU32,
        stops: AtomicU32,
    }

    impl FlakyEngine {
        fn failing(n: u32) -> Self {
            FlakyEngine {
                failures_left: AtomicU32::new(n),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TunnelEngine for FlakyEngine {
        async fn start(&self, _c: &TunnelConfig, _i: &CaptureInterface) -> crate::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::tunnel_start("engine rejected config"));
            }
            Ok(())
        }

        async fn stop(&self) -> crate::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn version(&self) -> crate::Result<String> {
            Ok("flaky".into())
        }
    }

    #[tokio::test]
    async fn failed_switch_rolls_back_to_previous() {
        let gid = Uuid::new_v4();
        let active = record(gid, "active", 100, 3);
        let fast = record(gid, "fast", 40, 3);
        let active_id = active.id;
        let store = seeded_store(vec![active, fast]).await;
        // first start (connect) succeeds, second (switch) fails, third
        // (rollback) succeeds: flaky on call #2 only
        let engine = Arc::new(FlakyEngine::default());
        let ctl = controller(store, engine.clone(), 10);

        ctl.connect(active_id).await.unwrap();
        engine.failures_left.store(1, Ordering::SeqCst);

        let err = ctl.evaluate().await.unwrap_err();
        assert!(matches!(err, Error::TunnelStart(_)));
        // rolled back, still connected to the previous server
        assert_eq!(ctl.state().await, ConnState::Connected);
        assert_eq!(ctl.active_server().await, Some(active_id));
    }

    #[tokio::test]
    async fn failed_rollback_disconnects() {
        let gid = Uuid::new_v4();
        let active = record(gid, "active", 100, 3);
        let fast = record(gid, "fast", 40, 3);
        let active_id = active.id;
        let store = seeded_store(vec![active, fast]).await;
        let engine = Arc::new(FlakyEngine::default());
        let ctl = controller(store, engine.clone(), 10);

        ctl.connect(active_id).await.unwrap();
        // both the switch start and the rollback start fail
        engine.failures_left.store(2, Ordering::SeqCst);

        let err = ctl.evaluate().await.unwrap_err();
        assert!(matches!(err, Error::TunnelStart(_)));
        assert_eq!(ctl.state().await, ConnState::Disconnected);
        assert_eq!(ctl.active_server().await, None);
    }

    #[tokio::test]
    async fn initial_connect_failure_disconnects_without_rollback() {
        let gid = Uuid::new_v4();
        let only = record(gid, "only", 50, 2);
        let only_id = only.id;
        let store = seeded_store(vec![only]).await;
        let engine = Arc::new(FlakyEngine::failing(1));
        let ctl = controller(store, engine, 10);

        let err = ctl.connect(only_id).await.unwrap_err();
        assert!(matches!(err, Error::TunnelStart(_)));
        assert_eq!(ctl.state().await, ConnState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_stops_engine() {
        let gid = Uuid::new_v4();
        let only = record(gid, "only", 50, 2);
        let only_id = only.id;
        let store = seeded_store(vec![only]).await;
        let engine = Arc::new(NoopEngine::new());
        let ctl = controller(store, engine.clone(), 10);

        ctl.connect(only_id).await.unwrap();
        assert!(engine.is_running());
        ctl.disconnect().await.unwrap();
        assert!(!engine.is_running());
        assert_eq!(ctl.state().await, ConnState::Disconnected);
    }
}
