//! Synchronous method calls: cloud request, device command, correlated reply.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::time::Instant;

use super::reported::ReportedState;
use super::ChannelMutex;
use crate::cloud::{CloudClient, MethodRequest, MethodResponse};
use crate::command::{CommandError, DeviceCommand};
use crate::error::{BridgeError, BridgeResult};
use crate::logutil::{escape_line, single_line};
use crate::metrics::{BridgeMetrics, MethodOutcome};
use crate::serial::SerialChannel;
use crate::shutdown::Shutdown;

/// Result reported when the device stays silent until the deadline.
pub const NO_RESPONSE_SENTINEL: &str = "no response within timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSettings {
    /// How long to wait for the device's reply once the command is written.
    pub timeout: Duration,
    /// Check requests against the command vocabulary and send the device wire form.
    pub validate: bool,
}

impl Default for MethodSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            validate: true,
        }
    }
}

/// Serial line for a request.
///
/// With validation the request must name a known command; its wire form is sent.
/// Without, the line is `name:payload` (or just `name` for an empty payload).
pub fn command_line(request: &MethodRequest, validate: bool) -> Result<String, CommandError> {
    if validate {
        return DeviceCommand::from_method(&request.name, &request.payload).map(|cmd| cmd.device_line());
    }
    let name = request.name.trim();
    if name.is_empty() {
        return Err(CommandError::Empty);
    }
    let payload = single_line(&request.payload);
    if payload.is_empty() {
        Ok(name.to_string())
    } else {
        Ok(format!("{name}:{payload}"))
    }
}

/// Id the caller gave the command in an envelope payload
/// (`{"commandId": "c1", "parameters": {...}}`), echoed in the response body.
pub fn command_id(payload: &str) -> String {
    match serde_json::from_str::<Value>(payload.trim()) {
        Ok(Value::Object(map)) => match map.get("commandId") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => UNKNOWN_COMMAND_ID.to_string(),
        },
        _ => UNKNOWN_COMMAND_ID.to_string(),
    }
}

const UNKNOWN_COMMAND_ID: &str = "unknown";

/// A request between arrival and its single response.
#[derive(Debug)]
pub struct PendingMethodCall {
    pub request: MethodRequest,
    pub command_id: String,
    pub received_at: DateTime<Utc>,
    started: Instant,
}

impl PendingMethodCall {
    pub fn new(request: MethodRequest) -> Self {
        Self {
            command_id: command_id(&request.payload),
            request,
            received_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// 200 response carrying `result`.
    pub fn succeed(self, result: &str) -> MethodResponse {
        MethodResponse {
            correlation_id: self.request.correlation_id,
            status: 200,
            body: json!({
                "status": 200,
                "commandId": self.command_id,
                "timestamp": Utc::now().to_rfc3339(),
                "result": result,
            }),
        }
    }

    /// Error response with a caller-facing message and machine-readable code.
    pub fn fail(self, status: u16, message: &str, code: &str) -> MethodResponse {
        MethodResponse {
            correlation_id: self.request.correlation_id,
            status,
            body: error_body(status, &self.command_id, message, code),
        }
    }
}

fn error_body(status: u16, command_id: &str, message: &str, code: &str) -> Value {
    json!({
        "status": status,
        "commandId": command_id,
        "timestamp": Utc::now().to_rfc3339(),
        "error": {
            "message": message,
            "code": code,
        },
    })
}

/// Write `line` and wait for the first non-blank reply. The deadline starts once the
/// line is written; `None` if it passes without a reply.
async fn exchange(
    chan: &mut SerialChannel,
    line: String,
    timeout: Duration,
    mut shutdown: Shutdown,
) -> BridgeResult<Option<String>> {
    // A fragment read before the command was written cannot belong to its reply.
    chan.discard_partial_line()?;
    chan.write_line(&line)?;
    let deadline = Instant::now() + timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        let reply = tokio::select! {
            reply = chan.read_line_with_timeout(deadline - now) => reply?,
            _ = shutdown.recv() => return Err(BridgeError::Shutdown),
        };
        match reply {
            Some(reply) if reply.trim().is_empty() => continue,
            Some(reply) => return Ok(Some(reply.trim().to_string())),
            None => return Ok(None),
        }
    }
}

/// Serve one request and build its response. Never fails: every error becomes a
/// response status.
pub async fn handle_request(
    mutex: &ChannelMutex,
    request: MethodRequest,
    settings: MethodSettings,
    shutdown: &mut Shutdown,
) -> (MethodResponse, MethodOutcome) {
    let call = PendingMethodCall::new(request);
    let line = match command_line(&call.request, settings.validate) {
        Ok(line) => line,
        Err(e) => {
            let (status, code) = e.status();
            info!("Rejected method '{}': {}", escape_line(&call.request.name), e);
            return (call.fail(status, &e.to_string(), code), MethodOutcome::Rejected);
        }
    };

    let timeout = settings.timeout;
    let listener = shutdown.clone();
    let result: BridgeResult<Option<String>> = mutex
        .with_channel(shutdown, move |chan| Box::pin(exchange(chan, line, timeout, listener)))
        .await;

    match result {
        Ok(Some(reply)) => {
            debug!(
                "Method {} answered in {:?}: {}",
                call.request.correlation_id,
                call.elapsed(),
                escape_line(&reply)
            );
            (call.succeed(&reply), MethodOutcome::Ok)
        }
        Ok(None) => {
            warn!(
                "Method '{}' ({}) got no reply within {:?}",
                escape_line(&call.request.name),
                call.request.correlation_id,
                settings.timeout
            );
            (call.succeed(NO_RESPONSE_SENTINEL), MethodOutcome::Timeout)
        }
        Err(BridgeError::Shutdown) => (
            call.fail(503, &BridgeError::Shutdown.to_string(), "SHUTTING_DOWN"),
            MethodOutcome::Failed,
        ),
        Err(e) => {
            let code = match &e {
                BridgeError::Transport(_) => "DEVICE_ERROR",
                _ => "UNEXPECTED_ERROR",
            };
            warn!("Method {} failed: {}", call.request.correlation_id, e);
            (call.fail(500, &e.to_string(), code), MethodOutcome::Failed)
        }
    }
}

/// Answer method requests one at a time until the cloud stream closes or shutdown
/// is requested. Each request gets exactly one response before the next is taken;
/// requests still queued at shutdown are answered with 503. Replies that say
/// something about a board position update the reported state, which is pushed
/// to the cloud after the response.
pub async fn run_method_loop<C: CloudClient>(
    cloud: Arc<C>,
    mutex: ChannelMutex,
    settings: MethodSettings,
    metrics: Arc<BridgeMetrics>,
    mut shutdown: Shutdown,
) {
    info!(
        "Method loop started (timeout {:?}, validation {})",
        settings.timeout,
        if settings.validate { "on" } else { "off" }
    );
    let mut reported = ReportedState::new();
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            request = cloud.receive_method_request() => request,
        };
        let Some(request) = request else {
            info!("Cloud closed the method request stream");
            break;
        };
        debug!(
            "Method request {} '{}' payload '{}'",
            request.correlation_id,
            escape_line(&request.name),
            escape_line(&request.payload)
        );

        let command = if settings.validate {
            DeviceCommand::from_method(&request.name, &request.payload).ok()
        } else {
            None
        };
        let correlation_id = request.correlation_id.clone();
        let (response, outcome) = handle_request(&mutex, request, settings, &mut shutdown).await;
        metrics.record_method(outcome);
        let changed = match (&command, outcome, response.result()) {
            (Some(cmd), MethodOutcome::Ok, Some(reply)) => reported.record(cmd, reply),
            _ => false,
        };
        if let Err(e) = cloud.send_method_response(response).await {
            error!("Failed to send response for {}: {}", correlation_id, e);
        }
        if changed {
            if let Err(e) = cloud.report_state(reported.snapshot()).await {
                error!("Failed to report device state: {}", e);
            }
        }
    }

    let queued = cloud.drain_method_requests().await;
    if !queued.is_empty() {
        info!("Answering {} queued method request(s) with 503", queued.len());
    }
    for request in queued {
        let call = PendingMethodCall::new(request);
        let correlation_id = call.request.correlation_id.clone();
        metrics.record_method(MethodOutcome::Failed);
        let response = call.fail(503, &BridgeError::Shutdown.to_string(), "SHUTTING_DOWN");
        if let Err(e) = cloud.send_method_response(response).await {
            error!("Failed to send response for {}: {}", correlation_id, e);
        }
    }
    info!("Method loop stopped");
}
