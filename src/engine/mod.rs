//! Tunnel engine collaborator
//!
//! The engine owns the data plane; this crate only hands it assembled
//! configurations. `NoopEngine` stands in when running headless.

use crate::assemble::TunnelConfig;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Descriptor of the OS capture interface handed to the engine alongside
/// the tunnel config. Setup of the interface itself is external.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureInterface {
    pub name: String,
    pub mtu: u32,
    /// Pre-opened device fd, when the host hands one over.
    pub fd: Option<i32>,
}

impl Default for CaptureInterface {
    fn default() -> Self {
        CaptureInterface {
            name: "tun0".to_string(),
            mtu: 1500,
            fd: None,
        }
    }
}

/// Start/stop surface of the external tunnel engine.
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    async fn start(&self, config: &TunnelConfig, capture: &CaptureInterface) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn version(&self) -> Result<String>;
}

/// Engine stub that accepts every config. Useful for headless runs and for
/// exercising the selection loop without a data plane.
#[derive(Default)]
pub struct NoopEngine {
    running: AtomicBool,
    last_config: Mutex<Option<TunnelConfig>>,
}

impl NoopEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_config(&self) -> Option<TunnelConfig> {
        self.last_config.lock().clone()
    }
}

#[async_trait]
impl TunnelEngine for NoopEngine {
    async fn start(&self, config: &TunnelConfig, capture: &CaptureInterface) -> Result<()> {
        info!(interface = %capture.name, outbounds = config.outbounds.len(), "noop engine start");
        *self.last_config.lock() = Some(config.clone());
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("noop engine stop");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        Ok("noop-0".to_string())
    }
}
