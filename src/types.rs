use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::EngineStatus;

/// Connection state of a [`QrcClient`](crate::QrcClient) session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session has been started
    Disconnected,
    /// Socket is open, waiting for the core's first EngineStatus notification
    AwaitingEngineStatus,
    /// Fully connected: EngineStatus received and the cache is in sync
    Connected,
    /// Socket dropped involuntarily, a reconnection attempt is pending
    Reconnecting,
    /// Terminal: explicit disconnect or reconnection attempts exhausted
    Stopped,
}

/// Snapshot of the connection status, emitted on every transition
#[derive(Debug, Clone, Default)]
pub struct ConnectionStatus {
    /// True once an EngineStatus has been received and the cache is in sync
    pub connected: bool,
    /// True when no further reconnection will occur (explicit disconnect or
    /// attempts exhausted); dependents should offer a manual re-entry flow
    pub no_reconnect: bool,
    /// Last engine status received on the current session, if any
    pub engine_status: Option<EngineStatus>,
    /// True when this connection observed a design code it had not seen before
    pub new_design: bool,
}

/// Whether a control can be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Value can only be read
    Read,
    /// Value can be read and written
    ReadWrite,
}

impl Direction {
    pub(crate) fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("Read/Write") => Direction::ReadWrite,
            _ => Direction::Read,
        }
    }

    /// True for read/write controls
    pub fn can_write(self) -> bool {
        self == Direction::ReadWrite
    }
}

/// A component property as reported by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Property {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub pretty_name: String,
}

/// Point-in-time copy of a control's fields
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSnapshot {
    /// Name of the owning component
    pub component: String,
    pub name: String,
    pub control_type: String,
    pub direction: Direction,
    pub value: serde_json::Value,
    pub string: String,
    /// Value normalized to the 0..1 range
    pub position: f64,
    pub value_min: f64,
    pub value_max: f64,
    pub string_min: String,
    pub string_max: String,
}

impl ControlSnapshot {
    /// Numeric value, if the wire value is a number
    pub fn value_as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }

    /// Boolean value, coercing the wire's truthy/falsy representations
    pub fn value_as_bool(&self) -> Option<bool> {
        match &self.value {
            serde_json::Value::Bool(b) => Some(*b),
            serde_json::Value::Number(n) => Some(n.as_f64().unwrap_or(0.0) != 0.0),
            _ => None,
        }
    }

    /// Value formatted for display. Float values are rounded to one decimal
    /// place; the cached value itself is never rounded.
    pub fn display_value(&self) -> String {
        match &self.value {
            serde_json::Value::Number(n) if n.is_f64() => {
                format!("{:.1}", n.as_f64().unwrap_or(0.0))
            }
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        }
    }
}

/// One batch of control changes delivered for a change group
#[derive(Debug, Clone)]
pub struct GroupUpdate {
    /// Change group id the batch was polled from
    pub group: String,
    /// Snapshots of the controls that actually changed
    pub changes: Vec<ControlSnapshot>,
}

/// Tunables for a [`QrcClient`](crate::QrcClient)
///
/// The defaults match the core's expectations; tests shorten the timing
/// fields to keep runs fast.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Maximum reconnection attempts before giving up; 0 means unlimited
    pub max_reconnect_attempts: u32,
    /// Per-request response deadline
    pub request_timeout: Duration,
    /// Delay before the first reconnection attempt
    pub reconnect_base_delay: Duration,
    /// Multiplier applied to the delay on each further attempt
    pub reconnect_growth: f64,
    /// NoOp keepalive cadence while the socket is open
    pub heartbeat_interval: Duration,
    /// Rate, in seconds, passed to ChangeGroup.AutoPoll
    pub auto_poll_rate: f64,
    /// Quiet window after a write before the confirmatory change-group poll
    pub write_debounce: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            request_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(3000),
            reconnect_growth: 1.5,
            heartbeat_interval: Duration::from_secs(30),
            auto_poll_rate: 1.0,
            write_debounce: Duration::from_millis(50),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: serde_json::Value) -> ControlSnapshot {
        ControlSnapshot {
            component: "Mixer".to_string(),
            name: "gain".to_string(),
            control_type: "Float".to_string(),
            direction: Direction::ReadWrite,
            value,
            string: String::new(),
            position: 0.0,
            value_min: -100.0,
            value_max: 20.0,
            string_min: String::new(),
            string_max: String::new(),
        }
    }

    #[test]
    fn display_value_rounds_floats_to_one_decimal() {
        assert_eq!(snapshot(json!(-12.3456)).display_value(), "-12.3");
        assert_eq!(snapshot(json!(5.05)).display_value(), "5.0");
    }

    #[test]
    fn display_value_leaves_non_floats_alone() {
        assert_eq!(snapshot(json!(5)).display_value(), "5");
        assert_eq!(snapshot(json!(true)).display_value(), "true");
        assert_eq!(snapshot(json!("on")).display_value(), "on");
    }

    #[test]
    fn bool_coercion_from_numbers() {
        assert_eq!(snapshot(json!(1)).value_as_bool(), Some(true));
        assert_eq!(snapshot(json!(0.0)).value_as_bool(), Some(false));
        assert_eq!(snapshot(json!(false)).value_as_bool(), Some(false));
        assert_eq!(snapshot(json!("x")).value_as_bool(), None);
    }

    #[test]
    fn direction_parsing() {
        assert!(Direction::parse(Some("Read/Write")).can_write());
        assert!(!Direction::parse(Some("Read")).can_write());
        assert!(!Direction::parse(None).can_write());
    }
}
