//! Command vocabulary understood by the xARM controller.
//!
//! Commands arrive in their canonical snake_case form (`get_block 5`) either as one
//! line of text or as a method name plus payload. Validation happens before anything
//! reaches the serial link; the controller itself only sees the upper-case wire form
//! produced by [`DeviceCommand::device_line`].

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

/// Lowest and highest block position on the work surface.
pub const MIN_POSITION: u8 = 1;
pub const MAX_POSITION: u8 = 9;

/// Command validation errors with messages suitable for a method caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Command is empty")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Malformed command: {command} requires a position parameter")]
    MissingArgument { command: &'static str },

    #[error("Malformed command: {command} takes no parameters")]
    UnexpectedArgument { command: &'static str },

    #[error("Invalid position parameter: {value}")]
    InvalidPosition { value: String },

    #[error("Position {position} out of range ({min}-{max})", min = MIN_POSITION, max = MAX_POSITION)]
    OutOfRange { position: i64 },
}

impl CommandError {
    /// Status and error code reported back to a method caller.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            CommandError::Unknown(_) => (404, "METHOD_NOT_FOUND"),
            _ => (400, "INVALID_COMMAND"),
        }
    }
}

/// A block position on the 3x3 surface, always within `1..=9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Position(u8);

impl Position {
    pub fn new(position: i64) -> Result<Self, CommandError> {
        if (MIN_POSITION as i64..=MAX_POSITION as i64).contains(&position) {
            Ok(Position(position as u8))
        } else {
            Err(CommandError::OutOfRange { position })
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl FromStr for Position {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s.trim().parse().map_err(|_| CommandError::InvalidPosition {
            value: s.trim().to_string(),
        })?;
        Position::new(value)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Pick up the block at a position.
    GetBlock(Position),
    /// Put the held block down at a position.
    PutBlock(Position),
    /// Read the colour sensor.
    GetColor,
    /// Ask whether the gripper currently holds a block.
    HoldingBlock,
    /// Probe whether a block sits at a position.
    BlockExists(Position),
    /// Scan the row for the first occupied position.
    ScanRow,
}

/// Every command name, in the order they are documented.
pub const COMMAND_NAMES: [&str; 6] = [
    "get_block",
    "put_block",
    "get_color",
    "holding_block",
    "block_exists",
    "scan_row",
];

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::GetBlock(_) => "get_block",
            DeviceCommand::PutBlock(_) => "put_block",
            DeviceCommand::GetColor => "get_color",
            DeviceCommand::HoldingBlock => "holding_block",
            DeviceCommand::BlockExists(_) => "block_exists",
            DeviceCommand::ScanRow => "scan_row",
        }
    }

    pub fn position(&self) -> Option<Position> {
        match self {
            DeviceCommand::GetBlock(p) | DeviceCommand::PutBlock(p) | DeviceCommand::BlockExists(p) => {
                Some(*p)
            }
            _ => None,
        }
    }

    /// Line written to the controller (without the trailing newline).
    pub fn device_line(&self) -> String {
        match self {
            DeviceCommand::GetBlock(p) => format!("GET BLOCK {p}"),
            DeviceCommand::PutBlock(p) => format!("PUT BLOCK {p}"),
            DeviceCommand::GetColor => "GET COLOR".to_string(),
            DeviceCommand::HoldingBlock => "HOLDING BLOCK".to_string(),
            DeviceCommand::BlockExists(p) => format!("BLOCK EXISTS {p}"),
            DeviceCommand::ScanRow => "SCAN ROW".to_string(),
        }
    }

    /// Build a command from a method call: `name` is the command name and `payload`
    /// carries the optional position, either as plain text or as JSON
    /// (`5`, `"5"`, `{"point": 5}`, `{"position": 5}`, or either key inside a
    /// `{"commandId": ..., "parameters": {...}}` envelope).
    pub fn from_method(name: &str, payload: &str) -> Result<Self, CommandError> {
        let argument = payload_argument(payload);
        let text = match argument {
            Some(arg) => format!("{} {}", name.trim(), arg),
            None => name.trim().to_string(),
        };
        validate_command(&text)
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position() {
            Some(p) => write!(f, "{} {}", self.name(), p),
            None => f.write_str(self.name()),
        }
    }
}

impl FromStr for DeviceCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_command(s)
    }
}

/// Validate one command line against the vocabulary.
pub fn validate_command(text: &str) -> Result<DeviceCommand, CommandError> {
    let parts: Vec<&str> = text.split_whitespace().collect();
    let Some((&base, args)) = parts.split_first() else {
        return Err(CommandError::Empty);
    };

    let positional = |command: &'static str| -> Result<Position, CommandError> {
        match args {
            [arg] => arg.parse(),
            _ => Err(CommandError::MissingArgument { command }),
        }
    };
    let bare = |command: &'static str, cmd: DeviceCommand| -> Result<DeviceCommand, CommandError> {
        if args.is_empty() {
            Ok(cmd)
        } else {
            Err(CommandError::UnexpectedArgument { command })
        }
    };

    match base {
        "get_block" => positional("get_block").map(DeviceCommand::GetBlock),
        "put_block" => positional("put_block").map(DeviceCommand::PutBlock),
        "block_exists" => positional("block_exists").map(DeviceCommand::BlockExists),
        "get_color" => bare("get_color", DeviceCommand::GetColor),
        "holding_block" => bare("holding_block", DeviceCommand::HoldingBlock),
        "scan_row" => bare("scan_row", DeviceCommand::ScanRow),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

fn payload_argument(payload: &str) -> Option<String> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Null) => None,
        Ok(Value::Number(n)) => Some(n.to_string()),
        Ok(Value::String(s)) if s.trim().is_empty() => None,
        Ok(Value::String(s)) => Some(s.trim().to_string()),
        Ok(Value::Object(map)) => {
            let position = |m: &serde_json::Map<String, Value>| m.get("point").or_else(|| m.get("position")).cloned();
            // Envelope form: {"commandId": "...", "parameters": {"point": 5}}
            let nested = match map.get("parameters") {
                Some(Value::Object(params)) => position(params),
                _ => None,
            };
            position(&map).or(nested).map(|v| match v {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
        }
        // Anything else (arrays, bare words) goes through as text and is judged by the validator.
        _ => Some(trimmed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_commands_accept_in_range_values() {
        assert_eq!(
            validate_command("get_block 5"),
            Ok(DeviceCommand::GetBlock(Position::new(5).unwrap()))
        );
        assert!(validate_command("put_block 1").is_ok());
        assert!(validate_command("block_exists 9").is_ok());
    }

    #[test]
    fn out_of_range_position_is_rejected() {
        let err = validate_command("get_block 10").unwrap_err();
        assert_eq!(err, CommandError::OutOfRange { position: 10 });
        assert!(err.to_string().contains("out of range"));
        assert!(validate_command("put_block 0").is_err());
    }

    #[test]
    fn missing_position_is_malformed() {
        let err = validate_command("get_block").unwrap_err();
        assert_eq!(err, CommandError::MissingArgument { command: "get_block" });
        assert!(err.to_string().starts_with("Malformed"));
        assert!(matches!(
            validate_command("get_block 1 2"),
            Err(CommandError::MissingArgument { .. })
        ));
    }

    #[test]
    fn non_numeric_position_is_invalid() {
        assert_eq!(
            validate_command("block_exists three"),
            Err(CommandError::InvalidPosition { value: "three".into() })
        );
    }

    #[test]
    fn bare_commands_reject_arguments() {
        assert_eq!(validate_command("get_color"), Ok(DeviceCommand::GetColor));
        assert_eq!(
            validate_command("scan_row 3"),
            Err(CommandError::UnexpectedArgument { command: "scan_row" })
        );
    }

    #[test]
    fn unknown_and_empty_commands() {
        assert_eq!(validate_command("   "), Err(CommandError::Empty));
        let err = validate_command("open_gripper").unwrap_err();
        assert_eq!(err.status(), (404, "METHOD_NOT_FOUND"));
    }

    #[test]
    fn device_wire_form_matches_controller_parser() {
        let cmd: DeviceCommand = "block_exists 4".parse().unwrap();
        assert_eq!(cmd.device_line(), "BLOCK EXISTS 4");
        assert_eq!(cmd.to_string(), "block_exists 4");
        assert_eq!(DeviceCommand::HoldingBlock.device_line(), "HOLDING BLOCK");
        assert_eq!(DeviceCommand::ScanRow.device_line(), "SCAN ROW");
    }

    #[test]
    fn method_payload_shapes() {
        let expected = DeviceCommand::GetBlock(Position::new(3).unwrap());
        assert_eq!(DeviceCommand::from_method("get_block", "3"), Ok(expected));
        assert_eq!(DeviceCommand::from_method("get_block", "\"3\""), Ok(expected));
        assert_eq!(DeviceCommand::from_method("get_block", r#"{"point": 3}"#), Ok(expected));
        assert_eq!(DeviceCommand::from_method("get_block", r#"{"position": "3"}"#), Ok(expected));
        assert_eq!(DeviceCommand::from_method("get_color", ""), Ok(DeviceCommand::GetColor));
        assert_eq!(DeviceCommand::from_method("get_color", "null"), Ok(DeviceCommand::GetColor));
        assert!(matches!(
            DeviceCommand::from_method("get_block", "{}"),
            Err(CommandError::MissingArgument { .. })
        ));
    }

    #[test]
    fn envelope_parameters_carry_the_position() {
        let expected = DeviceCommand::PutBlock(Position::new(5).unwrap());
        assert_eq!(
            DeviceCommand::from_method("put_block", r#"{"commandId":"c1","parameters":{"point":5}}"#),
            Ok(expected)
        );
        assert_eq!(
            DeviceCommand::from_method("put_block", r#"{"commandId":"c1","parameters":{"position":"5"}}"#),
            Ok(expected)
        );
        assert_eq!(
            DeviceCommand::from_method("scan_row", r#"{"commandId":"c2","parameters":{}}"#),
            Ok(DeviceCommand::ScanRow)
        );
        assert_eq!(
            DeviceCommand::from_method("get_block", r#"{"commandId":"c3","parameters":{"point":12}}"#),
            Err(CommandError::OutOfRange { position: 12 })
        );
    }
}
