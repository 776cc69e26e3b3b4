//! Device-to-cloud telemetry forwarding.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::sleep;

use super::ChannelMutex;
use crate::cloud::CloudClient;
use crate::error::{BridgeError, BridgeResult};
use crate::logutil::escape_line;
use crate::metrics::BridgeMetrics;
use crate::serial::SerialChannel;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySettings {
    /// Delay between polls of the channel.
    pub interval: Duration,
    /// Upper bound on finishing a partially received line.
    pub read_timeout: Duration,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            read_timeout: Duration::from_millis(250),
        }
    }
}

/// Read one unsolicited line if the device has sent anything.
async fn poll_line(chan: &mut SerialChannel, read_timeout: Duration) -> BridgeResult<Option<String>> {
    if !chan.has_pending_input()? {
        return Ok(None);
    }
    Ok(chan.read_line_with_timeout(read_timeout).await?)
}

/// Poll the device every `interval` and forward each non-blank line to the cloud.
///
/// The cloud send happens after the channel has been released, so a slow cloud
/// never holds up the other loops.
pub async fn run_telemetry_loop<C: CloudClient>(
    cloud: Arc<C>,
    mutex: ChannelMutex,
    settings: TelemetrySettings,
    metrics: Arc<BridgeMetrics>,
    mut shutdown: Shutdown,
) {
    info!("Telemetry loop started (interval {:?})", settings.interval);
    let read_timeout = settings.read_timeout;
    loop {
        if shutdown.is_shutdown() {
            break;
        }
        let polled: BridgeResult<Option<String>> = mutex
            .with_channel(&mut shutdown, move |chan| Box::pin(poll_line(chan, read_timeout)))
            .await;
        match polled {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    debug!("Dropping blank telemetry line");
                } else {
                    match cloud.send_message(line).await {
                        Ok(()) => {
                            metrics.inc_telemetry_forwarded();
                            debug!("telemetry -> cloud: {}", escape_line(line));
                        }
                        Err(e) => error!("Failed to forward telemetry: {}", e),
                    }
                }
            }
            Ok(None) => {}
            Err(BridgeError::Shutdown) => break,
            Err(e) => warn!("Telemetry poll failed: {}", e),
        }
        tokio::select! {
            _ = sleep(settings.interval) => {}
            _ = shutdown.recv() => break,
        }
    }
    info!("Telemetry loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ChannelCloud;
    use crate::serial::mock::MockDevice;
    use crate::serial::BackoffPolicy;
    use crate::shutdown;

    fn fast_mutex(device: &MockDevice, metrics: Arc<BridgeMetrics>) -> ChannelMutex {
        ChannelMutex::new(
            SerialChannel::new(
                Box::new(device.opener("mock0")),
                BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(40)),
                metrics,
            )
            .with_settle(Duration::ZERO)
            .with_poll_interval(Duration::from_millis(5)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_lines_and_drops_blank_ones() {
        let device = MockDevice::new();
        let metrics = Arc::new(BridgeMetrics::new());
        let mutex = fast_mutex(&device, metrics.clone());
        let (cloud, mut harness) = ChannelCloud::pair();
        let (trigger, sd) = shutdown::channel();

        let task = tokio::spawn(run_telemetry_loop(
            Arc::new(cloud),
            mutex,
            TelemetrySettings::default(),
            metrics.clone(),
            sd,
        ));

        // Let the first iteration open the port (and purge) before the device talks.
        sleep(Duration::from_millis(10)).await;
        device.emit_line("   ");
        device.emit_line("TEMP 21");
        assert_eq!(harness.next_telemetry().await.as_deref(), Some("TEMP 21"));

        trigger.shutdown();
        task.await.unwrap();
        assert_eq!(metrics.snapshot().telemetry_forwarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_faults_and_loop_recovers() {
        let device = MockDevice::new();
        let metrics = Arc::new(BridgeMetrics::new());
        let mutex = fast_mutex(&device, metrics.clone());
        let (cloud, mut harness) = ChannelCloud::pair();
        let (trigger, sd) = shutdown::channel();

        let task = tokio::spawn(run_telemetry_loop(
            Arc::new(cloud),
            mutex,
            TelemetrySettings::default(),
            metrics.clone(),
            sd,
        ));

        sleep(Duration::from_millis(10)).await;
        device.fail_next_read("input/output error");
        device.emit_line("LOST");
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(metrics.snapshot().faults, 1);

        // The next poll reopens the port and purges whatever was queued before.
        sleep(Duration::from_millis(700)).await;
        assert_eq!(device.open_count(), 2);
        device.emit_line("BACK");
        assert_eq!(harness.next_telemetry().await.as_deref(), Some("BACK"));

        trigger.shutdown();
        task.await.unwrap();
    }
}
