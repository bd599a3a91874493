use crate::clock::Clock;
use crate::commands::{CommandQueue, QueueLimits};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::heartbeat::HeartbeatTracker;
use crate::ingest::ReadingIngestBuffer;
use crate::model::{Command, Device, DeviceStatus, ReadingInput, StatusResponse};
use crate::publish::Publisher;
use crate::store::Store;
use crate::validate::ReadingRules;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A caller authenticated by its device credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub organization_id: String,
}

/// A server-side actor acting on behalf of one organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub organization_id: String,
}

impl Operator {
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
        }
    }
}

/// Entry point for devices and operators.
///
/// Every call resolves the target device and its organization before touching
/// commands, readings or liveness. Devices may only act on themselves;
/// operators only on devices of their own organization.
pub struct Coordinator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    heartbeat: Arc<HeartbeatTracker>,
    commands: CommandQueue,
    ingest: ReadingIngestBuffer,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        let heartbeat = Arc::new(HeartbeatTracker::new(
            store.clone(),
            publisher.clone(),
            config.heartbeat_timeout(),
        ));
        let commands = CommandQueue::new(
            store.clone(),
            QueueLimits {
                max_ttl: config.max_command_ttl(),
                max_payload_bytes: config.max_payload_bytes,
                max_poll_batch: config.max_poll_batch,
            },
        );
        let ingest = ReadingIngestBuffer::new(
            store.clone(),
            heartbeat.clone(),
            publisher,
            ReadingRules {
                max_skew_past: config.max_skew_past(),
                max_skew_future: config.max_skew_future(),
                max_batch: config.max_readings_per_batch,
            },
        );

        Self {
            store,
            clock,
            heartbeat,
            commands,
            ingest,
        }
    }

    /// Provisioning hook for the device registry, which lives outside this service.
    pub async fn register_device(&self, device: Device) -> Result<()> {
        self.store.insert_device(&device).await?;
        info!(
            device_id = %device.device_id,
            organization_id = %device.organization_id,
            "Device registered"
        );
        Ok(())
    }

    pub async fn authenticate_device(&self, api_key: &str) -> Result<DeviceIdentity> {
        let device = self
            .store
            .find_device_by_key(api_key)
            .await?
            .filter(Device::is_active)
            .ok_or_else(|| Error::Forbidden("unknown device credential".to_string()))?;

        Ok(DeviceIdentity {
            device_id: device.device_id,
            organization_id: device.organization_id,
        })
    }

    // Device-facing

    pub async fn poll_commands(
        &self,
        caller: &DeviceIdentity,
        device_id: &str,
        max_batch: usize,
    ) -> Result<Vec<Command>> {
        self.device_scope(caller, device_id).await?;
        self.commands.poll_next(device_id, max_batch, self.clock.now()).await
    }

    pub async fn acknowledge_command(
        &self,
        caller: &DeviceIdentity,
        device_id: &str,
        command_id: Uuid,
        result: Option<String>,
    ) -> Result<Command> {
        self.device_scope(caller, device_id).await?;
        self.commands
            .acknowledge(device_id, command_id, result, self.clock.now())
            .await
    }

    pub async fn post_readings(
        &self,
        caller: &DeviceIdentity,
        device_id: &str,
        batch: Vec<ReadingInput>,
    ) -> Result<usize> {
        let device = self.device_scope(caller, device_id).await?;
        self.ingest.ingest(&device, batch, self.clock.now()).await
    }

    /// `observed_at` defaults to the arrival time.
    pub async fn post_heartbeat(
        &self,
        caller: &DeviceIdentity,
        device_id: &str,
        observed_at: Option<DateTime<Utc>>,
    ) -> Result<DeviceStatus> {
        self.device_scope(caller, device_id).await?;
        let now = self.clock.now();
        self.heartbeat
            .record_heartbeat(device_id, observed_at.unwrap_or(now), now)
            .await
    }

    // Server-facing

    pub async fn queue_command(
        &self,
        caller: &Operator,
        device_id: &str,
        payload: String,
        ttl: Duration,
    ) -> Result<Uuid> {
        self.operator_scope(caller, device_id).await?;
        self.commands
            .enqueue(device_id, payload, ttl, self.clock.now())
            .await
    }

    pub async fn get_device_status(&self, caller: &Operator, device_id: &str) -> Result<StatusResponse> {
        self.operator_scope(caller, device_id).await?;
        self.heartbeat.current_status(device_id, self.clock.now()).await
    }

    pub async fn get_pending_commands(&self, caller: &Operator, device_id: &str) -> Result<Vec<Command>> {
        self.operator_scope(caller, device_id).await?;
        self.commands.pending(device_id, self.clock.now()).await
    }

    /// Any command of the device, whatever its state.
    pub async fn get_command(&self, caller: &Operator, device_id: &str, command_id: Uuid) -> Result<Command> {
        self.operator_scope(caller, device_id).await?;
        let command = self.commands.get(command_id).await?;
        if command.device_id != device_id {
            return Err(Error::NotFound(format!("command {}", command_id)));
        }
        Ok(command)
    }

    // Background

    /// Expires overdue commands and announces lapsed devices.
    ///
    /// Both steps always run; a failed step is logged and counts as zero.
    /// Only when both fail is the first error returned.
    pub async fn sweep(&self) -> Result<(usize, usize)> {
        let now = self.clock.now();
        let expired = self.commands.sweep_expired(now).await;
        let offline = self.heartbeat.sweep_offline(now).await;

        match (expired, offline) {
            (Err(e), Err(offline_err)) => {
                error!("Liveness sweep failed: {}", offline_err);
                Err(e)
            }
            (expired, offline) => {
                let expired = expired.unwrap_or_else(|e| {
                    error!("Command expiry sweep failed: {}", e);
                    0
                });
                let offline = offline.unwrap_or_else(|e| {
                    error!("Liveness sweep failed: {}", e);
                    0
                });
                Ok((expired, offline))
            }
        }
    }

    async fn device_scope(&self, caller: &DeviceIdentity, device_id: &str) -> Result<Device> {
        if caller.device_id != device_id {
            warn!(
                caller = %caller.device_id,
                device_id = %device_id,
                "Device attempted to act on another device"
            );
            return Err(Error::Forbidden(format!(
                "device {} may not act on device {}",
                caller.device_id, device_id
            )));
        }

        let device = self.active_device(device_id).await?;
        if device.organization_id != caller.organization_id {
            return Err(Error::Forbidden(format!("device {} changed organization", device_id)));
        }
        Ok(device)
    }

    async fn operator_scope(&self, caller: &Operator, device_id: &str) -> Result<Device> {
        let device = self.active_device(device_id).await?;
        if device.organization_id != caller.organization_id {
            warn!(
                organization_id = %caller.organization_id,
                device_id = %device_id,
                "Cross-organization access denied"
            );
            return Err(Error::Forbidden(format!(
                "device {} does not belong to organization {}",
                device_id, caller.organization_id
            )));
        }
        Ok(device)
    }

    async fn active_device(&self, device_id: &str) -> Result<Device> {
        self.store
            .get_device(device_id)
            .await?
            .filter(Device::is_active)
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))
    }
}
