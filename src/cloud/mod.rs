//! # Cloud collaborator
//!
//! The bridge treats the cloud side as a black box: push a telemetry line, wait for
//! the next pushed message, wait for the next method request, answer a method
//! request and publish the reported device state. Connection management and
//! retries belong to the implementation, not to the bridge.
//!
//! Two implementations ship with the crate:
//!
//! - [`ChannelCloud`] - in-process tokio channels, paired with a [`CloudHarness`]
//!   that plays the cloud side (tests, embedding).
//! - [`stdio`] - JSON lines over stdin/stdout on top of [`ChannelCloud`], used by the
//!   `start` command.

pub mod stdio;

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use crate::error::{BridgeError, BridgeResult};

/// A cloud-to-device push message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownlinkMessage {
    pub body: String,
}

impl DownlinkMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// A synchronous method call that must be answered exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRequest {
    pub name: String,
    pub payload: String,
    pub correlation_id: String,
}

impl MethodRequest {
    pub fn new(name: impl Into<String>, payload: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            correlation_id: correlation_id.into(),
        }
    }
}

/// Answer to a [`MethodRequest`], correlated by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResponse {
    pub correlation_id: String,
    /// HTTP-like status: 200 ok, 400 invalid command, 404 unknown method,
    /// 500 device failure, 503 shutting down.
    pub status: u16,
    pub body: Value,
}

impl MethodResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `result` field of a successful response.
    pub fn result(&self) -> Option<&str> {
        self.body.get("result").and_then(Value::as_str)
    }

    /// `error.message` field of a failed response.
    pub fn error_message(&self) -> Option<&str> {
        self.body.get("error")?.get("message")?.as_str()
    }

    /// `error.code` field of a failed response.
    pub fn error_code(&self) -> Option<&str> {
        self.body.get("error")?.get("code")?.as_str()
    }
}

/// Operations the bridge needs from the cloud side.
///
/// The receive operations return `None` once the cloud side has closed the stream;
/// the loop consuming it then stops.
pub trait CloudClient: Send + Sync + 'static {
    fn send_message(&self, text: &str) -> impl Future<Output = BridgeResult<()>> + Send;

    fn receive_message(&self) -> impl Future<Output = Option<DownlinkMessage>> + Send;

    fn receive_method_request(&self) -> impl Future<Output = Option<MethodRequest>> + Send;

    fn send_method_response(&self, response: MethodResponse) -> impl Future<Output = BridgeResult<()>> + Send;

    /// Publish the reported properties document (see [`crate::bridge::ReportedState`]).
    fn report_state(&self, reported: Value) -> impl Future<Output = BridgeResult<()>> + Send;

    /// Stop accepting method requests and return the ones already queued, so they
    /// can still be answered during shutdown.
    fn drain_method_requests(&self) -> impl Future<Output = Vec<MethodRequest>> + Send;
}

/// In-process cloud client backed by unbounded tokio channels.
pub struct ChannelCloud {
    telemetry_tx: mpsc::UnboundedSender<String>,
    response_tx: mpsc::UnboundedSender<MethodResponse>,
    reported_tx: mpsc::UnboundedSender<Value>,
    downlink_rx: Mutex<mpsc::UnboundedReceiver<DownlinkMessage>>,
    method_rx: Mutex<mpsc::UnboundedReceiver<MethodRequest>>,
}

/// The far end of a [`ChannelCloud`]: push messages and calls in, collect telemetry
/// and responses out.
pub struct CloudHarness {
    pub downlink_tx: mpsc::UnboundedSender<DownlinkMessage>,
    pub method_tx: mpsc::UnboundedSender<MethodRequest>,
    pub telemetry_rx: mpsc::UnboundedReceiver<String>,
    pub response_rx: mpsc::UnboundedReceiver<MethodResponse>,
    pub reported_rx: mpsc::UnboundedReceiver<Value>,
}

impl ChannelCloud {
    pub fn pair() -> (ChannelCloud, CloudHarness) {
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (reported_tx, reported_rx) = mpsc::unbounded_channel();
        let (downlink_tx, downlink_rx) = mpsc::unbounded_channel();
        let (method_tx, method_rx) = mpsc::unbounded_channel();
        (
            ChannelCloud {
                telemetry_tx,
                response_tx,
                reported_tx,
                downlink_rx: Mutex::new(downlink_rx),
                method_rx: Mutex::new(method_rx),
            },
            CloudHarness {
                downlink_tx,
                method_tx,
                telemetry_rx,
                response_rx,
                reported_rx,
            },
        )
    }
}

impl CloudClient for ChannelCloud {
    async fn send_message(&self, text: &str) -> BridgeResult<()> {
        self.telemetry_tx
            .send(text.to_string())
            .map_err(|_| BridgeError::Cloud("telemetry receiver closed".to_string()))
    }

    async fn receive_message(&self) -> Option<DownlinkMessage> {
        self.downlink_rx.lock().await.recv().await
    }

    async fn receive_method_request(&self) -> Option<MethodRequest> {
        self.method_rx.lock().await.recv().await
    }

    async fn send_method_response(&self, response: MethodResponse) -> BridgeResult<()> {
        self.response_tx
            .send(response)
            .map_err(|e| BridgeError::Cloud(format!("response receiver closed, dropped reply to {}", e.0.correlation_id)))
    }

    async fn report_state(&self, reported: Value) -> BridgeResult<()> {
        self.reported_tx
            .send(reported)
            .map_err(|_| BridgeError::Cloud("reported state receiver closed".to_string()))
    }

    async fn drain_method_requests(&self) -> Vec<MethodRequest> {
        let mut rx = self.method_rx.lock().await;
        rx.close();
        let mut queued = Vec::new();
        while let Ok(request) = rx.try_recv() {
            queued.push(request);
        }
        queued
    }
}

impl CloudHarness {
    /// Push a downlink message; false once the bridge side is gone.
    pub fn push_message(&self, body: &str) -> bool {
        self.downlink_tx.send(DownlinkMessage::new(body)).is_ok()
    }

    /// Issue a method call; the answer arrives on [`CloudHarness::next_response`].
    pub fn call(&self, name: &str, payload: &str, correlation_id: &str) -> bool {
        self.method_tx
            .send(MethodRequest::new(name, payload, correlation_id))
            .is_ok()
    }

    pub async fn next_telemetry(&mut self) -> Option<String> {
        self.telemetry_rx.recv().await
    }

    pub async fn next_response(&mut self) -> Option<MethodResponse> {
        self.response_rx.recv().await
    }

    pub async fn next_reported(&mut self) -> Option<Value> {
        self.reported_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn harness_round_trips_each_flow() {
        let (cloud, mut harness) = ChannelCloud::pair();

        assert!(harness.push_message("open_gripper"));
        assert_eq!(cloud.receive_message().await, Some(DownlinkMessage::new("open_gripper")));

        assert!(harness.call("get_color", "", "req-1"));
        let req = cloud.receive_method_request().await.unwrap();
        assert_eq!(req.correlation_id, "req-1");

        cloud.send_message("TEMP 21").await.unwrap();
        assert_eq!(harness.next_telemetry().await.as_deref(), Some("TEMP 21"));

        cloud
            .send_method_response(MethodResponse {
                correlation_id: "req-1".into(),
                status: 200,
                body: json!({"status": 200, "result": "GET COLOR red"}),
            })
            .await
            .unwrap();
        let resp = harness.next_response().await.unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.result(), Some("GET COLOR red"));
    }

    #[tokio::test]
    async fn closed_harness_is_reported() {
        let (cloud, harness) = ChannelCloud::pair();
        drop(harness);
        assert!(cloud.send_message("x").await.is_err());
        assert_eq!(cloud.receive_message().await, None);
        assert_eq!(cloud.receive_method_request().await, None);
    }

    #[tokio::test]
    async fn drain_returns_queued_requests_and_refuses_new_ones() {
        let (cloud, mut harness) = ChannelCloud::pair();
        assert!(harness.call("scan_row", "", "r1"));
        assert!(harness.call("get_color", "", "r2"));

        let queued = cloud.drain_method_requests().await;
        let ids: Vec<&str> = queued.iter().map(|r| r.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2"]);
        assert!(!harness.call("get_color", "", "r3"));
        assert_eq!(cloud.receive_method_request().await, None);

        cloud.report_state(json!({"points": {}})).await.unwrap();
        assert_eq!(harness.next_reported().await, Some(json!({"points": {}})));
    }

    #[test]
    fn error_accessors() {
        let resp = MethodResponse {
            correlation_id: "r".into(),
            status: 500,
            body: json!({"status": 500, "error": {"message": "device unplugged", "code": "DEVICE_ERROR"}}),
        };
        assert!(!resp.is_success());
        assert_eq!(resp.error_message(), Some("device unplugged"));
        assert_eq!(resp.error_code(), Some("DEVICE_ERROR"));
        assert_eq!(resp.result(), None);
    }
}
