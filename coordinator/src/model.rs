use crate::errors::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Liveness of a device, derived from its last heartbeat or reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
}

impl DeviceStatus {
    /// `last_seen_at` exactly `timeout` ago still counts as online.
    pub fn derive(last_seen_at: Option<DateTime<Utc>>, now: DateTime<Utc>, timeout: Duration) -> Self {
        match last_seen_at {
            None => DeviceStatus::Unknown,
            Some(seen) if now - seen <= timeout => DeviceStatus::Online,
            Some(_) => DeviceStatus::Offline,
        }
    }
}

/// Registered IoT device
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub device_id: String,
    pub organization_id: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(
        device_id: impl Into<String>,
        organization_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            organization_id: organization_id.into(),
            api_key: api_key.into(),
            last_seen_at: None,
            deleted_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandState {
    Pending,
    Delivered,
    Acknowledged,
    Expired,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Delivered => "delivered",
            CommandState::Acknowledged => "acknowledged",
            CommandState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Acknowledged | CommandState::Expired)
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CommandState::Pending),
            "delivered" => Ok(CommandState::Delivered),
            "acknowledged" => Ok(CommandState::Acknowledged),
            "expired" => Ok(CommandState::Expired),
            other => Err(Error::Unavailable(format!("corrupt command state '{}'", other))),
        }
    }
}

/// One instruction queued for a device.
///
/// State only moves forward: `pending -> delivered -> acknowledged`, or
/// `pending | delivered -> expired`. The transition methods below are the
/// only way the state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub device_id: String,
    pub payload: String,
    pub state: CommandState,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub result: Option<String>,
}

impl Command {
    pub fn new(device_id: impl Into<String>, payload: impl Into<String>, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            payload: payload.into(),
            state: CommandState::Pending,
            created_at: now,
            delivered_at: None,
            acknowledged_at: None,
            expired_at: None,
            expires_at: now + ttl,
            result: None,
        }
    }

    /// Still open but past its deadline.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.state.is_terminal() && now >= self.expires_at
    }

    pub fn deliver(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != CommandState::Pending {
            return Err(self.transition_error("deliver"));
        }
        self.state = CommandState::Delivered;
        self.delivered_at = Some(now);
        Ok(())
    }

    pub fn acknowledge(&mut self, result: Option<String>, now: DateTime<Utc>) -> Result<()> {
        if self.state != CommandState::Delivered {
            return Err(self.transition_error("acknowledge"));
        }
        self.state = CommandState::Acknowledged;
        self.acknowledged_at = Some(now);
        self.result = result;
        Ok(())
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.transition_error("expire"));
        }
        self.state = CommandState::Expired;
        self.expired_at = Some(now);
        Ok(())
    }

    fn transition_error(&self, action: &str) -> Error {
        Error::InvalidState(format!(
            "cannot {} command {} in state {}",
            action, self.id, self.state
        ))
    }
}

/// One accepted sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

/// Reading as posted by a device; the device id comes from the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingInput {
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl ReadingInput {
    pub fn into_reading(self, device_id: &str) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            sensor_type: self.sensor_type,
            value: self.value,
            unit: self.unit,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ReadingsRequest {
    pub device_id: String,
    pub batch: Vec<ReadingInput>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadingsResponse {
    pub accepted: usize,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub device_id: String,
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub status: DeviceStatus,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub device_id: String,
    pub max_batch: Option<usize>,
}

/// What a device sees of a command it has just received.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeliveredCommand {
    pub id: Uuid,
    pub payload: String,
    pub expires_at: DateTime<Utc>,
}

impl From<Command> for DeliveredCommand {
    fn from(command: Command) -> Self {
        Self {
            id: command.id,
            payload: command.payload,
            expires_at: command.expires_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub commands: Vec<DeliveredCommand>,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub device_id: String,
    pub result: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub id: Uuid,
    pub state: CommandState,
}

#[derive(Debug, Deserialize)]
pub struct QueueCommandRequest {
    pub payload: String,
    pub ttl_secs: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueCommandResponse {
    pub command_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: DeviceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandListResponse {
    pub commands: Vec<Command>,
}
