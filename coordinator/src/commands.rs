use crate::errors::{Error, Result};
use crate::locks::DeviceLocks;
use crate::metrics::{
    COMMANDS_ACKNOWLEDGED_TOTAL, COMMANDS_DELIVERED_TOTAL, COMMANDS_ENQUEUED_TOTAL,
    COMMANDS_EXPIRED_TOTAL,
};
use crate::model::{Command, CommandState, Device};
use crate::store::{Store, Transition};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_ttl: Duration,
    pub max_payload_bytes: usize,
    pub max_poll_batch: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            max_ttl: Duration::days(7),
            max_payload_bytes: 64 * 1024,
            max_poll_batch: 100,
        }
    }
}

/// Per-device FIFO of commands with at-most-once delivery.
pub struct CommandQueue {
    store: Arc<dyn Store>,
    locks: DeviceLocks,
    limits: QueueLimits,
}

impl CommandQueue {
    pub fn new(store: Arc<dyn Store>, limits: QueueLimits) -> Self {
        Self {
            store,
            locks: DeviceLocks::default(),
            limits,
        }
    }

    pub async fn enqueue(
        &self,
        device_id: &str,
        payload: String,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        if ttl <= Duration::zero() {
            return Err(Error::InvalidArgument(format!(
                "ttl must be positive, got {}s",
                ttl.num_seconds()
            )));
        }
        if ttl > self.limits.max_ttl {
            return Err(Error::InvalidArgument(format!(
                "ttl {}s exceeds maximum {}s",
                ttl.num_seconds(),
                self.limits.max_ttl.num_seconds()
            )));
        }
        self.check_size("payload", &payload)?;

        self.store
            .get_device(device_id)
            .await?
            .filter(Device::is_active)
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;

        let command = Command::new(device_id, payload, now, ttl);
        {
            let _guard = self.locks.acquire(device_id).await;
            self.store.insert_command(&command).await?;
        }

        COMMANDS_ENQUEUED_TOTAL.inc();
        info!(
            command_id = %command.id,
            device_id = %device_id,
            expires_at = %command.expires_at,
            "Command enqueued"
        );
        Ok(command.id)
    }

    /// Hands out up to `max_batch` pending commands, oldest first, marking them
    /// delivered. Never waits for new commands and never returns a command twice.
    pub async fn poll_next(
        &self,
        device_id: &str,
        max_batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Command>> {
        if max_batch == 0 {
            return Err(Error::InvalidArgument("max_batch must be at least 1".to_string()));
        }
        let max_batch = max_batch.min(self.limits.max_poll_batch);

        let (delivered, expired) = {
            let _guard = self.locks.acquire(device_id).await;
            let open = self.store.open_commands(device_id).await?;

            let mut changed = Vec::new();
            let mut delivered = Vec::new();
            let mut expired = 0;
            for mut command in open {
                let from = command.state;
                if command.is_due(now) {
                    command.expire(now)?;
                    expired += 1;
                    changed.push(Transition::new(from, command));
                } else if from == CommandState::Pending && delivered.len() < max_batch {
                    command.deliver(now)?;
                    delivered.push(command.clone());
                    changed.push(Transition::new(from, command));
                }
            }

            self.store.save_transitions(&changed).await?;
            (delivered, expired)
        };

        if expired > 0 {
            COMMANDS_EXPIRED_TOTAL.inc_by(expired as f64);
            debug!(device_id = %device_id, expired, "Expired commands skipped by poll");
        }
        if !delivered.is_empty() {
            COMMANDS_DELIVERED_TOTAL.inc_by(delivered.len() as f64);
            info!(device_id = %device_id, count = delivered.len(), "Commands delivered");
        }
        Ok(delivered)
    }

    pub async fn acknowledge(
        &self,
        device_id: &str,
        command_id: Uuid,
        result: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Command> {
        if let Some(result) = &result {
            self.check_size("result", result)?;
        }

        let _guard = self.locks.acquire(device_id).await;
        let mut command = self
            .store
            .get_command(command_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("command {}", command_id)))?;

        if command.device_id != device_id {
            warn!(
                command_id = %command_id,
                device_id = %device_id,
                "Acknowledge for a command owned by another device"
            );
            return Err(Error::InvalidState(format!(
                "command {} was not delivered to device {}",
                command_id, device_id
            )));
        }

        let from = command.state;
        if command.is_due(now) {
            command.expire(now)?;
            self.store
                .save_transitions(&[Transition::new(from, command)])
                .await?;
            COMMANDS_EXPIRED_TOTAL.inc();
            return Err(Error::InvalidState(format!("command {} has expired", command_id)));
        }

        command.acknowledge(result, now)?;
        self.store
            .save_transitions(&[Transition::new(from, command.clone())])
            .await?;

        COMMANDS_ACKNOWLEDGED_TOTAL.inc();
        info!(command_id = %command_id, device_id = %device_id, "Command acknowledged");
        Ok(command)
    }

    /// Moves every open command past its deadline to `expired`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let devices = self.store.devices_with_due_commands(now).await?;
        let mut total = 0;

        for device_id in devices {
            let _guard = self.locks.acquire(&device_id).await;
            let mut due = Vec::new();
            for mut command in self.store.open_commands(&device_id).await? {
                if command.is_due(now) {
                    let from = command.state;
                    command.expire(now)?;
                    due.push(Transition::new(from, command));
                }
            }
            self.store.save_transitions(&due).await?;
            total += due.len();
        }

        self.locks.prune();
        if total > 0 {
            COMMANDS_EXPIRED_TOTAL.inc_by(total as f64);
            info!(count = total, "Expired stale commands");
        }
        Ok(total)
    }

    /// Pending, unexpired commands in delivery order. Does not change any state.
    pub async fn pending(&self, device_id: &str, now: DateTime<Utc>) -> Result<Vec<Command>> {
        Ok(self
            .store
            .open_commands(device_id)
            .await?
            .into_iter()
            .filter(|c| c.state == CommandState::Pending && !c.is_due(now))
            .collect())
    }

    pub async fn get(&self, command_id: Uuid) -> Result<Command> {
        self.store
            .get_command(command_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("command {}", command_id)))
    }

    fn check_size(&self, what: &str, value: &str) -> Result<()> {
        if value.len() > self.limits.max_payload_bytes {
            return Err(Error::InvalidArgument(format!(
                "{} of {} bytes exceeds limit of {} bytes",
                what,
                value.len(),
                self.limits.max_payload_bytes
            )));
        }
        Ok(())
    }
}
