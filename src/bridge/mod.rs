//! # Bridge Module
//!
//! Runs the three loops that share the serial channel:
//!
//! - [`telemetry`] - device lines forwarded to the cloud
//! - [`downlink`] - cloud pushes written to the device, fire-and-forget
//! - [`method`] - cloud method calls answered with the device's reply
//! - [`reported`] - per-position device state learned from method replies
//!
//! Every serial exchange goes through one [`ChannelMutex`], so at most one loop
//! talks to the device at a time and each reply is read by the loop that asked for
//! it. Loops hold the channel only for their own exchange and wait for cloud input
//! and timers without it.
//!
//! ```rust,no_run
//! use xarm_bridge::bridge::Bridge;
//! use xarm_bridge::cloud::ChannelCloud;
//! use xarm_bridge::config::Config;
//! use xarm_bridge::serial::SerialPortOpener;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let opener = SerialPortOpener::new(&config.serial.port, config.serial.baud_rate, config.serial.read_timeout());
//!     let (cloud, _harness) = ChannelCloud::pair();
//!     Bridge::new(&config, Box::new(opener), cloud).run().await
//! }
//! ```

pub mod downlink;
pub mod method;
mod mutex;
pub mod reported;
pub mod telemetry;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::task::JoinSet;

pub use downlink::{run_downlink_loop, DownlinkSettings};
pub use method::{handle_request, run_method_loop, MethodSettings, NO_RESPONSE_SENTINEL};
pub use mutex::{ChannelMutex, Transaction};
pub use reported::{PointState, ReportedState};
pub use telemetry::{run_telemetry_loop, TelemetrySettings};

use crate::cloud::CloudClient;
use crate::config::Config;
use crate::metrics::BridgeMetrics;
use crate::serial::{LinkOpener, SerialChannel};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};

/// How often the running bridge logs its counters at debug level.
pub const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Per-loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BridgeSettings {
    pub telemetry: TelemetrySettings,
    pub downlink: DownlinkSettings,
    pub methods: MethodSettings,
}

impl BridgeSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            telemetry: TelemetrySettings {
                interval: config.telemetry.interval(),
                read_timeout: config.telemetry.read_timeout(),
            },
            downlink: DownlinkSettings {
                interval: config.downlink.interval(),
                prefix: config.downlink.prefix.clone(),
                drain_timeout: config.downlink.drain_timeout(),
            },
            methods: MethodSettings {
                timeout: config.methods.timeout(),
                validate: config.methods.validate,
            },
        }
    }
}

/// A configured bridge that has not started yet.
pub struct Bridge<C: CloudClient> {
    cloud: Arc<C>,
    mutex: ChannelMutex,
    settings: BridgeSettings,
    metrics: Arc<BridgeMetrics>,
}

impl<C: CloudClient> Bridge<C> {
    /// Build the shared serial channel from `config` and wire it to `cloud`.
    /// Nothing is opened until the first loop needs the device.
    pub fn new(config: &Config, opener: Box<dyn LinkOpener>, cloud: C) -> Self {
        let metrics = Arc::new(BridgeMetrics::new());
        let channel = SerialChannel::new(opener, config.reconnect.policy(), metrics.clone())
            .with_settle(config.serial.settle())
            .with_poll_interval(config.methods.poll_interval());
        Self::from_parts(channel, BridgeSettings::from_config(config), cloud, metrics)
    }

    /// Assemble a bridge around an already built channel. `metrics` should be the
    /// instance the channel counts into.
    pub fn from_parts(channel: SerialChannel, settings: BridgeSettings, cloud: C, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            cloud: Arc::new(cloud),
            mutex: ChannelMutex::new(channel),
            settings,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        self.metrics.clone()
    }

    /// Start the three loops.
    pub fn spawn(self) -> BridgeHandle {
        let (trigger, shutdown) = shutdown::channel();
        let mut tasks = JoinSet::new();

        {
            let (cloud, mutex, metrics, sd) = (self.cloud.clone(), self.mutex.clone(), self.metrics.clone(), shutdown.clone());
            let settings = self.settings.telemetry;
            tasks.spawn(async move {
                run_telemetry_loop(cloud, mutex, settings, metrics, sd).await;
                "telemetry"
            });
        }
        {
            let (cloud, mutex, metrics, sd) = (self.cloud.clone(), self.mutex.clone(), self.metrics.clone(), shutdown.clone());
            let settings = self.settings.downlink.clone();
            tasks.spawn(async move {
                run_downlink_loop(cloud, mutex, settings, metrics, sd).await;
                "downlink"
            });
        }
        {
            let settings = self.settings.methods;
            let (cloud, mutex, metrics) = (self.cloud.clone(), self.mutex.clone(), self.metrics.clone());
            tasks.spawn(async move {
                run_method_loop(cloud, mutex, settings, metrics, shutdown).await;
                "method"
            });
        }
        info!("Bridge started");

        BridgeHandle {
            trigger,
            tasks,
            mutex: self.mutex,
            metrics: self.metrics,
        }
    }

    /// Run until Ctrl-C, then stop the loops and wait for them.
    pub async fn run(self) -> Result<()> {
        self.spawn().run_until(wait_for_ctrl_c()).await
    }
}

/// Resolves on Ctrl-C. If the signal handler cannot be installed it never resolves.
pub async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// The running loops.
pub struct BridgeHandle {
    trigger: ShutdownTrigger,
    tasks: JoinSet<&'static str>,
    mutex: ChannelMutex,
    metrics: Arc<BridgeMetrics>,
}

impl BridgeHandle {
    /// A listener for the bridge's shutdown signal, for collaborators that should
    /// stop with it.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.trigger.subscribe()
    }

    pub fn channel(&self) -> &ChannelMutex {
        &self.mutex
    }

    pub fn metrics(&self) -> Arc<BridgeMetrics> {
        self.metrics.clone()
    }

    /// Ask every loop to stop at its next suspension point.
    pub fn shutdown(&self) {
        self.trigger.shutdown();
    }

    /// Wait for all loops to finish. A panicked loop is reported as an error once
    /// the others have stopped.
    pub async fn join(mut self) -> Result<()> {
        let mut failure = None;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(name) => debug!("{} loop joined", name),
                Err(e) if e.is_panic() => {
                    error!("Bridge loop panicked: {}", e);
                    self.trigger.shutdown();
                    failure.get_or_insert_with(|| anyhow!("bridge loop panicked: {}", e));
                }
                Err(e) => warn!("Bridge loop cancelled: {}", e),
            }
        }
        info!("Bridge stopped ({})", self.metrics.snapshot());
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Supervise the loops until `stop` resolves: counters are logged periodically
    /// and a panicking loop brings the whole bridge down. Shuts down and joins on
    /// the way out.
    pub async fn run_until<F: Future<Output = ()>>(mut self, stop: F) -> Result<()> {
        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(METRICS_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("Shutdown requested");
                    break;
                }
                joined = self.tasks.join_next() => match joined {
                    Some(Ok(name)) => info!("{} loop finished", name),
                    Some(Err(e)) if e.is_panic() => {
                        error!("Bridge loop panicked, stopping: {}", e);
                        self.shutdown();
                        self.join().await?;
                        return Err(anyhow!("bridge loop panicked: {}", e));
                    }
                    Some(Err(e)) => warn!("Bridge loop cancelled: {}", e),
                    None => {
                        info!("All bridge loops finished");
                        break;
                    }
                },
                _ = ticker.tick() => debug!("Bridge metrics: {}", self.metrics.snapshot()),
            }
        }
        self.shutdown();
        self.join().await
    }
}
