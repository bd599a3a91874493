use crate::errors::{Error, Result};
use crate::model::{Command, CommandState, Device, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Result of raising a device's `last_seen_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Touch {
    pub previous: Option<DateTime<Utc>>,
    pub current: DateTime<Utc>,
}

/// A command after a state change, with the state it was read in.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: CommandState,
    pub command: Command,
}

impl Transition {
    pub fn new(from: CommandState, command: Command) -> Self {
        Self { from, command }
    }
}

/// Persistence for devices, commands and readings.
///
/// Writes that take a slice are all-or-nothing.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_device(&self, device: &Device) -> Result<()>;

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>>;

    async fn find_device_by_key(&self, api_key: &str) -> Result<Option<Device>>;

    /// Sets `last_seen_at = max(last_seen_at, seen_at)`. `None` if the device does not exist.
    async fn touch_device(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<Option<Touch>>;

    async fn insert_command(&self, command: &Command) -> Result<()>;

    async fn get_command(&self, id: Uuid) -> Result<Option<Command>>;

    /// Pending and delivered commands of one device, oldest first.
    async fn open_commands(&self, device_id: &str) -> Result<Vec<Command>>;

    /// Persists state transitions. Every stored command must still be in its
    /// `from` state, otherwise nothing is written and `InvalidState` is returned.
    async fn save_transitions(&self, transitions: &[Transition]) -> Result<()>;

    async fn devices_with_due_commands(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    async fn insert_readings(&self, readings: &[Reading]) -> Result<()>;

    async fn count_readings(&self, device_id: &str) -> Result<usize>;
}

#[derive(Default)]
struct MemoryState {
    devices: HashMap<String, Device>,
    commands: HashMap<Uuid, Command>,
    // insertion order per device
    queues: HashMap<String, Vec<Uuid>>,
    readings: Vec<Reading>,
}

/// In-process store used for tests and `STORE=memory`.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_device(&self, device: &Device) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        if state.devices.contains_key(&device.device_id) {
            return Err(Error::InvalidArgument(format!(
                "device {} already registered",
                device.device_id
            )));
        }
        state.devices.insert(device.device_id.clone(), device.clone());
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.state.read().await.devices.get(device_id).cloned())
    }

    async fn find_device_by_key(&self, api_key: &str) -> Result<Option<Device>> {
        let state = self.state.read().await;
        Ok(state.devices.values().find(|d| d.api_key == api_key).cloned())
    }

    async fn touch_device(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<Option<Touch>> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let Some(device) = state.devices.get_mut(device_id) else {
            return Ok(None);
        };
        let previous = device.last_seen_at;
        let current = previous.map_or(seen_at, |p| p.max(seen_at));
        device.last_seen_at = Some(current);
        Ok(Some(Touch { previous, current }))
    }

    async fn insert_command(&self, command: &Command) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        state
            .queues
            .entry(command.device_id.clone())
            .or_default()
            .push(command.id);
        state.commands.insert(command.id, command.clone());
        Ok(())
    }

    async fn get_command(&self, id: Uuid) -> Result<Option<Command>> {
        Ok(self.state.read().await.commands.get(&id).cloned())
    }

    async fn open_commands(&self, device_id: &str) -> Result<Vec<Command>> {
        let state = self.state.read().await;
        let Some(queue) = state.queues.get(device_id) else {
            return Ok(Vec::new());
        };
        Ok(queue
            .iter()
            .filter_map(|id| state.commands.get(id))
            .filter(|c| !c.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn save_transitions(&self, transitions: &[Transition]) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        for t in transitions {
            match state.commands.get(&t.command.id) {
                Some(stored) if stored.state == t.from => {}
                _ => {
                    return Err(Error::InvalidState(format!(
                        "command {} is no longer {}",
                        t.command.id, t.from
                    )))
                }
            }
        }
        for t in transitions {
            state.commands.insert(t.command.id, t.command.clone());
        }
        Ok(())
    }

    async fn devices_with_due_commands(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut devices: Vec<String> = state
            .commands
            .values()
            .filter(|c| c.is_due(now))
            .map(|c| c.device_id.clone())
            .collect();
        devices.sort();
        devices.dedup();
        Ok(devices)
    }

    async fn insert_readings(&self, readings: &[Reading]) -> Result<()> {
        self.check_available()?;
        self.state.write().await.readings.extend_from_slice(readings);
        Ok(())
    }

    async fn count_readings(&self, device_id: &str) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state.readings.iter().filter(|r| r.device_id == device_id).count())
    }
}
