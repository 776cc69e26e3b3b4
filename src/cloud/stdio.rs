//! JSON-lines cloud adapter.
//!
//! Stands in for a real IoT hub connection: each stdin line is one inbound item,
//! each stdout line one outbound item.
//!
//! ```text
//! in : {"type":"message","body":"open_gripper"}
//! in : {"type":"method","name":"get_block","payload":5,"id":"r1"}
//! out: {"type":"telemetry","line":"TEMP 21"}
//! out: {"type":"response","id":"r1","status":200,"body":{...}}
//! out: {"type":"reported","properties":{"points":{...},"lastUpdated":"..."}}
//! ```

use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::{CloudHarness, DownlinkMessage, MethodRequest, MethodResponse};
use crate::logutil::escape_line;
use crate::shutdown::Shutdown;

/// How long output keeps flowing after shutdown while the loops answer what they hold.
pub const SHUTDOWN_FLUSH: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Message {
        body: String,
    },
    Method {
        name: String,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Telemetry { line: &'a str },
    Response { id: &'a str, status: u16, body: &'a Value },
    Reported { properties: &'a Value },
}

impl Inbound {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

/// Payload text handed to the method loop: strings unwrapped, `null` empty, anything
/// else as compact JSON.
fn payload_text(payload: Value) -> String {
    match payload {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn route(harness: &CloudHarness, item: Inbound) -> bool {
    match item {
        Inbound::Message { body } => harness.downlink_tx.send(DownlinkMessage::new(body)).is_ok(),
        Inbound::Method { name, payload, id } => {
            let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            debug!("stdio method {} id={}", name, id);
            harness
                .method_tx
                .send(MethodRequest::new(name, payload_text(payload), id))
                .is_ok()
        }
    }
}

async fn write_json<W: AsyncWrite + Unpin>(writer: &mut W, item: &Outbound<'_>) -> std::io::Result<()> {
    let mut line = serde_json::to_string(item).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Write one item produced by the bridge.
async fn forward<W: AsyncWrite + Unpin>(writer: &mut W, item: Produced) -> std::io::Result<()> {
    match item {
        Produced::Telemetry(line) => write_json(writer, &Outbound::Telemetry { line: &line }).await,
        Produced::Response(resp) => {
            write_json(
                writer,
                &Outbound::Response {
                    id: &resp.correlation_id,
                    status: resp.status,
                    body: &resp.body,
                },
            )
            .await
        }
        Produced::Reported(properties) => write_json(writer, &Outbound::Reported { properties: &properties }).await,
    }
}

enum Produced {
    Telemetry(String),
    Response(MethodResponse),
    Reported(Value),
}

/// Next item from any outbound channel; `None` once the bridge side has dropped them all.
async fn next_produced(harness: &mut CloudHarness) -> Option<Produced> {
    tokio::select! {
        Some(line) = harness.telemetry_rx.recv() => Some(Produced::Telemetry(line)),
        Some(resp) = harness.response_rx.recv() => Some(Produced::Response(resp)),
        Some(props) = harness.reported_rx.recv() => Some(Produced::Reported(props)),
        else => None,
    }
}

/// Shuttle items between a line reader/writer pair and the harness until shutdown.
///
/// End of input stops the inbound side only; telemetry and responses keep flowing.
/// After shutdown no more input is read, but output is written until the bridge
/// drops its side or [`SHUTDOWN_FLUSH`] passes, so requests answered while the
/// loops stop still reach the cloud.
pub async fn pump<R, W>(reader: R, mut writer: W, mut harness: CloudHarness, mut shutdown: Shutdown) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut input_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match Inbound::parse(&line) {
                        Ok(item) => {
                            if !route(&harness, item) {
                                warn!("Bridge no longer accepting cloud input");
                            }
                        }
                        Err(e) => warn!("Ignoring malformed cloud input '{}': {}", escape_line(&line), e),
                    },
                    None => {
                        info!("Cloud input closed");
                        input_open = false;
                    }
                }
            }
            produced = next_produced(&mut harness) => match produced {
                Some(item) => forward(&mut writer, item).await?,
                None => {
                    info!("Bridge closed its cloud channels");
                    return Ok(());
                }
            },
            _ = shutdown.recv() => break,
        }
    }

    let flush = async {
        while let Some(item) = next_produced(&mut harness).await {
            forward(&mut writer, item).await?;
        }
        Ok::<(), std::io::Error>(())
    };
    match tokio::time::timeout(SHUTDOWN_FLUSH, flush).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Bridge output still open {:?} after shutdown; stopping", SHUTDOWN_FLUSH);
            Ok(())
        }
    }
}

/// Run [`pump`] on the process stdin/stdout.
pub fn spawn_stdio(harness: CloudHarness, shutdown: Shutdown) -> tokio::task::JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        pump(stdin, tokio::io::stdout(), harness, shutdown).await
    })
}
