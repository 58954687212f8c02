use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    pub interval: Duration,
    /// Fire once at startup instead of waiting a full interval.
    pub run_immediately: bool,
    pub tick: mpsc::Sender<()>,
}

impl ScheduleSpec {
    pub fn from_config(cfg: &common::config::Schedule, tick: mpsc::Sender<()>) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs),
            run_immediately: cfg.run_immediately,
            tick,
        }
    }
}

/// Send a tick every `interval`. Missed ticks are skipped so a slow run never
/// queues a burst behind it. Stops when the receiver is dropped.
pub fn start(spec: ScheduleSpec) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start_at = if spec.run_immediately {
            Instant::now()
        } else {
            Instant::now() + spec.interval
        };
        let mut interval = tokio::time::interval_at(start_at, spec.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            tracing::debug!(interval_secs = spec.interval.as_secs(), "schedule tick");
            if spec.tick.send(()).await.is_err() {
                break;
            }
        }
    })
}
