//! Shared fixtures: a fast bridge config and a bridge wired to a scripted device.

use xarm_bridge::bridge::{Bridge, BridgeHandle};
use xarm_bridge::cloud::{ChannelCloud, CloudHarness};
use xarm_bridge::config::Config;
use xarm_bridge::serial::mock::MockDevice;

pub const MOCK_PORT: &str = "/dev/ttyMOCK0";

/// Defaults with no settle delay so opens are instantaneous.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.serial.port = MOCK_PORT.to_string();
    config.serial.settle_ms = 0;
    config
}

/// Spawn a bridge talking to `device`; the harness plays the cloud.
pub fn start_bridge(device: &MockDevice, config: &Config) -> (BridgeHandle, CloudHarness) {
    let (cloud, harness) = ChannelCloud::pair();
    let handle = Bridge::new(config, Box::new(device.opener(MOCK_PORT)), cloud).spawn();
    (handle, harness)
}

/// Answer every command line with `ACK <line>`.
#[allow(dead_code)] // not every test file scripts replies
pub fn acking_device() -> MockDevice {
    let device = MockDevice::new();
    device.respond_with(|line| Some(format!("ACK {line}")));
    device
}
