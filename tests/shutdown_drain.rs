mod common;

use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncBufReadExt;
use xarm_bridge::bridge::Bridge;
use xarm_bridge::cloud::stdio::pump;
use xarm_bridge::cloud::ChannelCloud;
use xarm_bridge::serial::mock::MockDevice;

use common::{fast_config, MOCK_PORT};

#[tokio::test(start_paused = true)]
async fn every_request_gets_an_answer_when_the_bridge_stops() {
    let device = MockDevice::new();
    device.unplug();
    let (cloud, harness) = ChannelCloud::pair();
    let handle = Bridge::new(&fast_config(), Box::new(device.opener(MOCK_PORT)), cloud).spawn();

    let input = concat!(
        "{\"type\":\"method\",\"name\":\"get_color\",\"id\":\"r1\"}\n",
        "{\"type\":\"method\",\"name\":\"scan_row\",\"id\":\"r2\"}\n",
    );
    let (out_rd, out_wr) = tokio::io::duplex(8192);
    let adapter = tokio::spawn(pump(input.as_bytes(), out_wr, harness, handle.shutdown_signal()));

    handle.run_until(tokio::time::sleep(Duration::from_secs(1))).await.unwrap();
    adapter.await.unwrap().unwrap();

    let mut lines = tokio::io::BufReader::new(out_rd).lines();
    let mut answered = Vec::new();
    while let Some(line) = lines.next_line().await.unwrap() {
        let item: Value = serde_json::from_str(&line).unwrap();
        if item["type"] == "response" {
            assert_eq!(item["status"], 503, "{item}");
            assert_eq!(item["body"]["error"]["code"], "SHUTTING_DOWN");
            answered.push(item["id"].as_str().unwrap().to_string());
        }
    }
    answered.sort();
    assert_eq!(answered, vec!["r1", "r2"]);
}
