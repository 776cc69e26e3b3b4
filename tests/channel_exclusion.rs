mod common;

use std::time::Duration;

use xarm_bridge::serial::mock::MockEvent;

use common::{acking_device, fast_config, start_bridge};

#[tokio::test(start_paused = true)]
async fn every_reply_reaches_the_flow_that_asked() {
    let device = acking_device();
    let (handle, mut harness) = start_bridge(&device, &fast_config());

    for pos in 1..=9 {
        assert!(harness.call("get_block", &pos.to_string(), &format!("req-{pos}")));
        assert!(harness.push_message(&format!("led {pos}")));
    }

    for _ in 1..=9 {
        let resp = harness.next_response().await.unwrap();
        let pos = resp.correlation_id.trim_start_matches("req-");
        assert_eq!(resp.result(), Some(format!("ACK GET BLOCK {pos}").as_str()));
    }
    // Downlinks are paced by their interval; give them time to drain.
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Each write is followed by its own reply being read before anything else is written.
    let events = device.events();
    let mut pending: Option<String> = None;
    for event in &events {
        match event {
            MockEvent::Wrote(line) => {
                assert!(pending.is_none(), "{line} written while {pending:?} unanswered: {events:?}");
                pending = Some(format!("ACK {line}\n"));
            }
            MockEvent::Read(chunk) => {
                if let Some(expected) = pending.take() {
                    assert_eq!(chunk, &expected);
                }
            }
            MockEvent::Opened => {}
        }
    }

    let metrics = handle.metrics();
    handle.shutdown();
    handle.join().await.unwrap();
    let snap = metrics.snapshot();
    assert_eq!(snap.method_ok, 9);
    assert_eq!(snap.downlink_written, 9);
    assert_eq!(snap.telemetry_forwarded, 0);
    assert_eq!(snap.opens, 1);
}
