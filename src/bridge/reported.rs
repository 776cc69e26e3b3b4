//! Reported device state: what the bridge last learned about each board position.
//!
//! Method replies that say something about a position update its entry:
//!
//! - `PUT BLOCK n: true` marks `n` occupied
//! - `GET BLOCK n: true` marks `n` empty
//! - `BLOCK EXISTS n : true|false` records what the sensor saw
//!
//! After a change the method loop pushes [`ReportedState::snapshot`] to the cloud.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::command::DeviceCommand;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointState {
    /// `None` until a reply told us either way.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupied: Option<bool>,
    pub last_command: String,
    pub last_reply: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ReportedState {
    points: BTreeMap<u8, PointState>,
    last_updated: Option<DateTime<Utc>>,
}

/// Trailing `true`/`false` of a controller reply such as `GET BLOCK 5: true`.
fn reply_flag(reply: &str) -> Option<bool> {
    let (_, flag) = reply.rsplit_once(':')?;
    match flag.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

impl ReportedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a device reply to `command` into the state. Returns whether anything
    /// changed; commands without a position never do.
    pub fn record(&mut self, command: &DeviceCommand, reply: &str) -> bool {
        let Some(position) = command.position() else {
            return false;
        };
        let flag = reply_flag(reply);
        let now = Utc::now();
        let entry = self.points.entry(position.get()).or_insert_with(|| PointState {
            occupied: None,
            last_command: String::new(),
            last_reply: String::new(),
            last_updated: now,
        });
        match (command, flag) {
            (DeviceCommand::PutBlock(_), Some(true)) => entry.occupied = Some(true),
            (DeviceCommand::GetBlock(_), Some(true)) => entry.occupied = Some(false),
            (DeviceCommand::BlockExists(_), Some(exists)) => entry.occupied = Some(exists),
            _ => {}
        }
        entry.last_command = command.to_string();
        entry.last_reply = reply.to_string();
        entry.last_updated = now;
        self.last_updated = Some(now);
        true
    }

    pub fn point(&self, position: u8) -> Option<&PointState> {
        self.points.get(&position)
    }

    /// Reported properties document: `{"points": {"5": {...}}, "lastUpdated": ...}`.
    pub fn snapshot(&self) -> Value {
        let points: BTreeMap<String, &PointState> = self.points.iter().map(|(k, v)| (k.to_string(), v)).collect();
        json!({
            "points": points,
            "lastUpdated": self.last_updated.map(|t| t.to_rfc3339()),
        })
    }
}
