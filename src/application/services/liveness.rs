//! Liveness monitor
//!
//! Periodically sweeps the session registry and evicts sessions that have
//! gone quiet for longer than `max(multiplier × heartbeat interval, floor)`.
//! The same tick runs [`Engine::housekeep`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::application::engine::{Engine, Housekeeping};
use crate::shared::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// How often to sweep
    pub sweep_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

pub struct LivenessMonitor {
    engine: Arc<Engine>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            config: LivenessConfig::default(),
        }
    }

    pub fn with_config(mut self, config: LivenessConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the sweep loop. It stops when `shutdown` fires.
    pub fn start(self, shutdown: ShutdownSignal) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                sweep_interval_secs = self.config.sweep_interval.as_secs(),
                "Liveness monitor started"
            );

            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = Utc::now();
                        let evicted = self.engine.evict_stale(now);
                        if evicted > 0 {
                            info!(evicted, "Liveness sweep evicted sessions");
                        } else {
                            debug!("Liveness sweep found no stale sessions");
                        }

                        let cleaned = self.engine.housekeep(now);
                        if cleaned != Housekeeping::default() {
                            info!(
                                expired_calls = cleaned.expired_calls,
                                pruned_transactions = cleaned.pruned_transactions,
                                forgotten_charge_points = cleaned.forgotten_charge_points,
                                known_charge_points = self.engine.charge_points().len(),
                                "Housekeeping removed stale state"
                            );
                        }
                    }
                    _ = shutdown.notified().wait() => {
                        info!("Liveness monitor shutting down");
                        break;
                    }
                }
            }
        })
    }
}
