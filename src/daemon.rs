//! Heartbeat daemon.
//!
//! `HeartbeatDaemon` runs a tokio event loop that periodically checks whether
//! the governor's upgrade cycle is due and drains the write-behind dump. The
//! knowledge base itself stays synchronous; tokio only drives scheduling and
//! signal handling.

use std::time::Duration;

use crate::error::StrataResult;
use crate::kb::KnowledgeBase;
use crate::record::now_secs;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Intervals for each heartbeat task.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Upgrade-due check interval (default: 1 hour). The upgrade itself is
    /// still gated by the governor's cadence.
    pub upgrade_interval: Duration,
    /// Write-behind flush interval (default: 2s).
    pub flush_interval: Duration,
    /// Stop after this many upgrade checks (0 = run until Ctrl+C).
    pub max_ticks: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            upgrade_interval: Duration::from_secs(3600),
            flush_interval: Duration::from_secs(2),
            max_ticks: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Long-running timer that keeps a knowledge base maintained.
pub struct HeartbeatDaemon {
    kb: KnowledgeBase,
    config: DaemonConfig,
    ticks: usize,
}

impl HeartbeatDaemon {
    pub fn new(kb: KnowledgeBase, config: DaemonConfig) -> Self {
        Self { kb, config, ticks: 0 }
    }

    pub fn kb(&self) -> &KnowledgeBase {
        &self.kb
    }

    /// Give the knowledge base back, e.g. after `run` returns.
    pub fn into_inner(self) -> KnowledgeBase {
        self.kb
    }

    /// Run the main loop until Ctrl+C or `max_ticks`, flushing before exit.
    pub async fn run(&mut self) -> StrataResult<()> {
        use tokio::time::interval;

        let mut upgrade_tick = interval(self.config.upgrade_interval);
        let mut flush_tick = interval(self.config.flush_interval);
        tracing::info!(
            upgrade_interval = ?self.config.upgrade_interval,
            flush_interval = ?self.config.flush_interval,
            "daemon: started"
        );

        loop {
            tokio::select! {
                _ = upgrade_tick.tick() => {
                    self.beat();
                    if self.config.max_ticks > 0 && self.ticks >= self.config.max_ticks {
                        tracing::info!(ticks = self.ticks, "daemon: max ticks reached, shutting down");
                        break;
                    }
                }
                _ = flush_tick.tick() => {
                    self.flush();
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("daemon: received shutdown signal");
                    break;
                }
            }
        }

        self.kb.flush()?;
        tracing::info!("daemon: stopped");
        Ok(())
    }

    fn beat(&mut self) {
        self.ticks += 1;
        match self.kb.heartbeat(now_secs()) {
            Ok(beat) => {
                tracing::debug!(upgraded = beat.upgraded, flushed = beat.flushed, "daemon: heartbeat");
            }
            Err(e) => {
                tracing::warn!(error = %e, "daemon: heartbeat failed");
            }
        }
    }

    fn flush(&mut self) {
        match self.kb.flush() {
            Ok(true) => tracing::debug!("daemon: state dump flushed"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "daemon: flush failed"),
        }
    }
}
