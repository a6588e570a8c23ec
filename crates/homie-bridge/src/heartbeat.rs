//! Heartbeat and stats emitter.
//!
//! Every device gets its own timer task. A tick republishes the stats block
//! and runs the staleness check under the device mutex, so it never races
//! message handling. The task holds only a weak reference and ends once the
//! device handle is dropped or aborted on shutdown.

use crate::registry::DeviceHandle;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

/// Heartbeat configuration for device health monitoring
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Stats interval in seconds (default: 120)
    pub heartbeat_interval: u64,
    /// Silence after which a device is lost, in seconds (default: 6 h)
    pub stale_after: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 120,
            stale_after: 6 * 60 * 60,
        }
    }
}

impl HeartbeatConfig {
    pub fn new(interval_secs: u64, stale_after_secs: u64) -> Self {
        Self {
            heartbeat_interval: interval_secs,
            stale_after: stale_after_secs,
        }
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    pub fn stale_duration(&self) -> Duration {
        Duration::from_secs(self.stale_after)
    }
}

/// Wall clock anchored to the tokio clock.
///
/// Timestamps advance with `tokio::time`, so paused-time tests see devices
/// age exactly like the timers do.
#[derive(Debug, Clone, Copy)]
pub struct BridgeClock {
    wall: DateTime<Utc>,
    origin: Instant,
}

impl BridgeClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            origin: Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }
}

impl Default for BridgeClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the heartbeat of one device. The first tick fires immediately.
pub fn spawn_heartbeat(
    handle: &Arc<DeviceHandle>,
    config: &HeartbeatConfig,
    clock: BridgeClock,
) -> JoinHandle<()> {
    let device: Weak<DeviceHandle> = Arc::downgrade(handle);
    let period = config.interval_duration();

    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;

            let Some(handle) = device.upgrade() else {
                break;
            };
            let lost = handle.with(|d| d.heartbeat(clock.now())).await;
            if lost {
                debug!(device_id = %handle.id(), "Heartbeat marked device lost");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceOptions, DeviceState};
    use crate::registry::DeviceRegistry;

    #[test]
    fn test_config_durations() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval_duration(), Duration::from_secs(120));
        assert_eq!(config.stale_duration(), Duration::from_secs(21600));
        assert_eq!(
            HeartbeatConfig::new(0, 10).interval_duration(),
            Duration::from_secs(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = BridgeClock::new();
        let start = clock.now();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!((clock.now() - start).num_seconds(), 90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_publishes_stats_and_marks_lost() {
        let clock = BridgeClock::new();
        let config = HeartbeatConfig::new(60, 150);
        let registry = DeviceRegistry::default();
        let (handle, rx) = registry.get_or_create("dev1", || {
            Device::new(
                "dev1",
                "dev1",
                "homie",
                DeviceOptions {
                    stale_after: config.stale_duration(),
                    ..Default::default()
                },
                clock.now(),
            )
        });
        let mut rx = rx.unwrap();

        handle.attach_task(spawn_heartbeat(&handle, &config, clock));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut first = Vec::new();
        while let Ok(message) = rx.try_recv() {
            first.push(message);
        }
        assert!(first.iter().any(|m| m.topic == "homie/dev1/$stats/uptime"));

        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(handle.with(|d| d.state()).await, DeviceState::Lost);

        let mut rest = Vec::new();
        while let Ok(message) = rx.try_recv() {
            rest.push(message);
        }
        let lost: Vec<_> = rest
            .iter()
            .filter(|m| m.topic == "homie/dev1/$state" && m.payload == "lost")
            .collect();
        assert_eq!(lost.len(), 1);

        registry.shutdown();
    }
}
