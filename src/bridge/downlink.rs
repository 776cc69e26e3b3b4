//! Cloud-to-device push delivery.
//!
//! Messages are fire-and-forget: the line is written, one reply line is drained
//! so it does not surface as telemetry, and nothing goes back to the cloud.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::sleep;

use super::ChannelMutex;
use crate::cloud::CloudClient;
use crate::error::{BridgeError, BridgeResult};
use crate::logutil::{escape_line, single_line};
use crate::metrics::BridgeMetrics;
use crate::serial::SerialChannel;
use crate::shutdown::Shutdown;

/// Marker prepended to every pushed line so the controller can tell its origin.
pub const DEFAULT_PREFIX: &str = "cloud:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownlinkSettings {
    /// Pause after each delivery attempt.
    pub interval: Duration,
    pub prefix: String,
    /// How long to wait for a reply line to discard.
    pub drain_timeout: Duration,
}

impl Default for DownlinkSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            prefix: DEFAULT_PREFIX.to_string(),
            drain_timeout: Duration::from_millis(250),
        }
    }
}

impl DownlinkSettings {
    /// Serial line for a pushed message body.
    pub fn device_line(&self, body: &str) -> String {
        format!("{}{}", self.prefix, single_line(body))
    }
}

async fn deliver(chan: &mut SerialChannel, line: String, drain_timeout: Duration) -> BridgeResult<Option<String>> {
    chan.write_line(&line)?;
    Ok(chan.read_line_with_timeout(drain_timeout).await?)
}

/// Write every pushed message to the device until the cloud stream closes or
/// shutdown is requested.
pub async fn run_downlink_loop<C: CloudClient>(
    cloud: Arc<C>,
    mutex: ChannelMutex,
    settings: DownlinkSettings,
    metrics: Arc<BridgeMetrics>,
    mut shutdown: Shutdown,
) {
    info!("Downlink loop started (prefix '{}')", settings.prefix);
    loop {
        let message = tokio::select! {
            message = cloud.receive_message() => message,
            _ = shutdown.recv() => break,
        };
        let Some(message) = message else {
            info!("Cloud closed the downlink stream");
            break;
        };

        let line = settings.device_line(&message.body);
        let drain_timeout = settings.drain_timeout;
        let delivered: BridgeResult<Option<String>> = mutex
            .with_channel(&mut shutdown, move |chan| Box::pin(deliver(chan, line, drain_timeout)))
            .await;
        match delivered {
            Ok(reply) => {
                metrics.inc_downlink_written();
                debug!("cloud -> device: {}", escape_line(&message.body));
                if let Some(reply) = reply {
                    debug!("Discarded downlink reply: {}", escape_line(&reply));
                }
            }
            Err(BridgeError::Shutdown) => {
                warn!("Dropping downlink message during shutdown: {}", escape_line(&message.body));
                break;
            }
            Err(e) => warn!("Downlink delivery failed: {}", e),
        }

        tokio::select! {
            _ = sleep(settings.interval) => {}
            _ = shutdown.recv() => break,
        }
    }
    info!("Downlink loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::ChannelCloud;
    use crate::serial::mock::MockDevice;
    use crate::serial::BackoffPolicy;
    use crate::shutdown;

    #[test]
    fn device_line_flattens_body() {
        let settings = DownlinkSettings::default();
        assert_eq!(settings.device_line("open_gripper"), "cloud:open_gripper");
        assert_eq!(settings.device_line("move\r\nleft\n"), "cloud:move left");
    }

    #[tokio::test(start_paused = true)]
    async fn writes_prefixed_lines_and_swallows_replies() {
        let device = MockDevice::new();
        device.respond_with(|line| Some(format!("ACK {line}")));
        let metrics = Arc::new(BridgeMetrics::new());
        let mutex = ChannelMutex::new(
            SerialChannel::new(
                Box::new(device.opener("mock0")),
                BackoffPolicy::default(),
                metrics.clone(),
            )
            .with_settle(Duration::ZERO),
        );
        let (cloud, harness) = ChannelCloud::pair();
        let (trigger, sd) = shutdown::channel();

        let task = tokio::spawn(run_downlink_loop(
            Arc::new(cloud),
            mutex,
            DownlinkSettings::default(),
            metrics.clone(),
            sd,
        ));
        assert!(harness.push_message("open_gripper"));
        assert!(harness.push_message("close_gripper"));
        sleep(Duration::from_secs(2)).await;

        assert_eq!(device.written(), vec!["cloud:open_gripper", "cloud:close_gripper"]);
        assert_eq!(metrics.snapshot().downlink_written, 2);

        trigger.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_is_logged_and_next_message_reconnects() {
        let device = MockDevice::new();
        device.fail_next_write("write timed out");
        let metrics = Arc::new(BridgeMetrics::new());
        let mutex = ChannelMutex::new(
            SerialChannel::new(
                Box::new(device.opener("mock0")),
                BackoffPolicy::default(),
                metrics.clone(),
            )
            .with_settle(Duration::ZERO),
        );
        let (cloud, harness) = ChannelCloud::pair();
        let (trigger, sd) = shutdown::channel();

        let task = tokio::spawn(run_downlink_loop(
            Arc::new(cloud),
            mutex,
            DownlinkSettings::default(),
            metrics.clone(),
            sd,
        ));
        harness.push_message("lost");
        harness.push_message("delivered");
        sleep(Duration::from_secs(2)).await;

        assert_eq!(device.written(), vec!["cloud:delivered"]);
        assert_eq!(device.open_count(), 2);
        assert_eq!(metrics.snapshot().faults, 1);

        trigger.shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn stops_when_cloud_stream_closes() {
        let device = MockDevice::new();
        let mutex = ChannelMutex::new(SerialChannel::new(
            Box::new(device.opener("mock0")),
            BackoffPolicy::default(),
            Arc::new(BridgeMetrics::new()),
        ));
        let (cloud, harness) = ChannelCloud::pair();
        let (_trigger, sd) = shutdown::channel();
        drop(harness);

        run_downlink_loop(
            Arc::new(cloud),
            mutex,
            DownlinkSettings::default(),
            Arc::new(BridgeMetrics::new()),
            sd,
        )
        .await;
        assert_eq!(device.open_count(), 0);
    }
}
