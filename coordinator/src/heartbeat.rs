use crate::errors::{Error, Result};
use crate::locks::DeviceLocks;
use crate::model::{Device, DeviceStatus, StatusResponse};
use crate::publish::{publish_best_effort, LiveEvent, Publisher};
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Derives online/offline state from `last_seen_at` and announces changes.
///
/// Heartbeats and the offline sweep for one device run under that device's
/// lock, so the announced status always follows the stored `last_seen_at`.
pub struct HeartbeatTracker {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    timeout: Duration,
    locks: DeviceLocks,
    // last status announced on the live feed, per device
    announced: Mutex<HashMap<String, DeviceStatus>>,
}

impl HeartbeatTracker {
    pub fn new(store: Arc<dyn Store>, publisher: Arc<dyn Publisher>, timeout: Duration) -> Self {
        Self {
            store,
            publisher,
            timeout,
            locks: DeviceLocks::default(),
            announced: Mutex::new(HashMap::new()),
        }
    }

    /// Raises `last_seen_at` to `observed_at` (never past `now`, never backward)
    /// and returns the resulting status.
    pub async fn record_heartbeat(
        &self,
        device_id: &str,
        observed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeviceStatus> {
        let device = self.active_device(device_id).await?;

        let (after, transitions) = {
            let _guard = self.locks.acquire(device_id).await;
            let touch = self
                .store
                .touch_device(device_id, observed_at.min(now))
                .await?
                .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))?;

            let before = DeviceStatus::derive(touch.previous, now, self.timeout);
            let after = DeviceStatus::derive(Some(touch.current), now, self.timeout);
            debug!(device_id = %device_id, last_seen_at = %touch.current, "Heartbeat recorded");
            (after, self.note_transitions(device_id, before, after))
        };

        for (from, to) in transitions {
            info!(device_id = %device_id, ?from, ?to, "Device status changed");
            let event = LiveEvent::status_change(&device.organization_id, device_id, from, to, now);
            publish_best_effort(self.publisher.as_ref(), &event).await;
        }

        Ok(after)
    }

    pub async fn current_status(&self, device_id: &str, now: DateTime<Utc>) -> Result<StatusResponse> {
        let device = self.active_device(device_id).await?;
        Ok(StatusResponse {
            status: DeviceStatus::derive(device.last_seen_at, now, self.timeout),
            last_seen_at: device.last_seen_at,
        })
    }

    /// Announces online devices whose heartbeat has lapsed. Returns how many went offline.
    pub async fn sweep_offline(&self, now: DateTime<Utc>) -> Result<usize> {
        let online: Vec<String> = self
            .lock_announced()
            .iter()
            .filter(|(_, status)| **status == DeviceStatus::Online)
            .map(|(id, _)| id.clone())
            .collect();

        let mut went_offline = 0;
        for device_id in online {
            let organization_id = {
                let _guard = self.locks.acquire(&device_id).await;
                let Some(device) = self.store.get_device(&device_id).await? else {
                    continue;
                };
                let status = DeviceStatus::derive(device.last_seen_at, now, self.timeout);
                if status != DeviceStatus::Offline {
                    continue;
                }

                let mut announced = self.lock_announced();
                if announced.get(&device_id) != Some(&DeviceStatus::Online) {
                    continue;
                }
                announced.insert(device_id.clone(), DeviceStatus::Offline);
                device.organization_id
            };

            went_offline += 1;
            info!(device_id = %device_id, "Device went offline");
            let event = LiveEvent::status_change(
                &organization_id,
                &device_id,
                DeviceStatus::Online,
                DeviceStatus::Offline,
                now,
            );
            publish_best_effort(self.publisher.as_ref(), &event).await;
        }

        self.locks.prune();
        Ok(went_offline)
    }

    async fn active_device(&self, device_id: &str) -> Result<Device> {
        self.store
            .get_device(device_id)
            .await?
            .filter(Device::is_active)
            .ok_or_else(|| Error::NotFound(format!("device {}", device_id)))
    }

    /// Records `after` as the announced status and returns the transitions to publish.
    /// An online device whose heartbeat lapsed before the sweep noticed gets its
    /// offline transition announced here first.
    fn note_transitions(
        &self,
        device_id: &str,
        before: DeviceStatus,
        after: DeviceStatus,
    ) -> Vec<(DeviceStatus, DeviceStatus)> {
        let mut announced = self.lock_announced();
        let mut last = announced.get(device_id).copied().unwrap_or(before);
        let mut transitions = Vec::new();

        if last == DeviceStatus::Online && before == DeviceStatus::Offline {
            transitions.push((DeviceStatus::Online, DeviceStatus::Offline));
            last = DeviceStatus::Offline;
        }
        if last != after {
            transitions.push((last, after));
        }

        announced.insert(device_id.to_string(), after);
        transitions
    }

    fn lock_announced(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeviceStatus>> {
        self.announced.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, Reading};
    use crate::publish::{BroadcastPublisher, LiveEventKind};
    use crate::store::{MemoryStore, Touch, Transition};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{broadcast, Notify};
    use uuid::Uuid;

    /// Memory store that can hold one `get_device` or `touch_device` call
    /// after it did its work, until the test lets it go.
    #[derive(Default)]
    struct PausingStore {
        inner: MemoryStore,
        pause_get: AtomicBool,
        pause_touch: AtomicBool,
        paused: Notify,
        resume: Notify,
    }

    impl PausingStore {
        async fn hold_if(&self, flag: &AtomicBool) {
            if flag.swap(false, Ordering::SeqCst) {
                self.paused.notify_one();
                self.resume.notified().await;
            }
        }
    }

    #[async_trait]
    impl Store for PausingStore {
        async fn insert_device(&self, device: &Device) -> Result<()> {
            self.inner.insert_device(device).await
        }

        async fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
            let device = self.inner.get_device(device_id).await;
            self.hold_if(&self.pause_get).await;
            device
        }

        async fn find_device_by_key(&self, api_key: &str) -> Result<Option<Device>> {
            self.inner.find_device_by_key(api_key).await
        }

        async fn touch_device(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<Option<Touch>> {
            let touch = self.inner.touch_device(device_id, seen_at).await;
            self.hold_if(&self.pause_touch).await;
            touch
        }

        async fn insert_command(&self, command: &Command) -> Result<()> {
            self.inner.insert_command(command).await
        }

        async fn get_command(&self, id: Uuid) -> Result<Option<Command>> {
            self.inner.get_command(id).await
        }

        async fn open_commands(&self, device_id: &str) -> Result<Vec<Command>> {
            self.inner.open_commands(device_id).await
        }

        async fn save_transitions(&self, transitions: &[Transition]) -> Result<()> {
            self.inner.save_transitions(transitions).await
        }

        async fn devices_with_due_commands(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
            self.inner.devices_with_due_commands(now).await
        }

        async fn insert_readings(&self, readings: &[Reading]) -> Result<()> {
            self.inner.insert_readings(readings).await
        }

        async fn count_readings(&self, device_id: &str) -> Result<usize> {
            self.inner.count_readings(device_id).await
        }
    }

    async fn pausing_setup() -> (
        Arc<HeartbeatTracker>,
        Arc<PausingStore>,
        broadcast::Receiver<LiveEvent>,
    ) {
        let store = Arc::new(PausingStore::default());
        store.insert_device(&Device::new("dev-1", "org-1", "key-1")).await.unwrap();
        let publisher = BroadcastPublisher::new(64);
        let rx = publisher.subscribe();
        let tracker = Arc::new(HeartbeatTracker::new(
            store.clone(),
            Arc::new(publisher),
            Duration::seconds(60),
        ));
        (tracker, store, rx)
    }

    fn transitions(events: &[LiveEvent]) -> Vec<(String, String)> {
        events
            .iter()
            .map(|e| {
                (
                    e.payload["from"].as_str().unwrap().to_string(),
                    e.payload["to"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    async fn setup() -> (HeartbeatTracker, broadcast::Receiver<LiveEvent>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_device(&Device::new("dev-1", "org-1", "key-1")).await.unwrap();
        let publisher = BroadcastPublisher::new(64);
        let rx = publisher.subscribe();
        let tracker = HeartbeatTracker::new(store, Arc::new(publisher), Duration::seconds(60));
        (tracker, rx)
    }

    fn drain(rx: &mut broadcast::Receiver<LiveEvent>) -> Vec<LiveEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_out_of_order_heartbeat_keeps_latest() {
        let (tracker, _rx) = setup().await;
        let now = Utc::now();
        let t1 = now - Duration::seconds(5);
        let t2 = now - Duration::seconds(20);

        tracker.record_heartbeat("dev-1", t1, now).await.unwrap();
        tracker.record_heartbeat("dev-1", t2, now).await.unwrap();

        let status = tracker.current_status("dev-1", now).await.unwrap();
        assert_eq!(status.last_seen_at, Some(t1));
    }

    #[tokio::test]
    async fn test_future_heartbeat_clamped_to_now() {
        let (tracker, _rx) = setup().await;
        let now = Utc::now();

        tracker
            .record_heartbeat("dev-1", now + Duration::hours(1), now)
            .await
            .unwrap();

        let status = tracker.current_status("dev-1", now).await.unwrap();
        assert_eq!(status.last_seen_at, Some(now));
    }

    #[tokio::test]
    async fn test_status_window() {
        let (tracker, _rx) = setup().await;
        let now = Utc::now();

        assert_eq!(
            tracker.current_status("dev-1", now).await.unwrap().status,
            DeviceStatus::Unknown
        );

        tracker
            .record_heartbeat("dev-1", now - Duration::seconds(30), now)
            .await
            .unwrap();
        assert_eq!(
            tracker.current_status("dev-1", now).await.unwrap().status,
            DeviceStatus::Online
        );
        assert_eq!(
            tracker
                .current_status("dev-1", now + Duration::seconds(60))
                .await
                .unwrap()
                .status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_repeated_heartbeats_announce_once() {
        let (tracker, mut rx) = setup().await;
        let now = Utc::now();

        for i in 0..5 {
            let at = now + Duration::seconds(i * 10);
            tracker.record_heartbeat("dev-1", at, at).await.unwrap();
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, LiveEventKind::StatusChange);
        assert_eq!(events[0].payload["to"], "online");
    }

    #[tokio::test]
    async fn test_sweep_announces_offline_once() {
        let (tracker, mut rx) = setup().await;
        let now = Utc::now();
        tracker.record_heartbeat("dev-1", now, now).await.unwrap();
        drain(&mut rx);

        assert_eq!(tracker.sweep_offline(now + Duration::seconds(30)).await.unwrap(), 0);
        assert_eq!(tracker.sweep_offline(now + Duration::seconds(90)).await.unwrap(), 1);
        assert_eq!(tracker.sweep_offline(now + Duration::seconds(120)).await.unwrap(), 0);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["from"], "online");
        assert_eq!(events[0].payload["to"], "offline");

        // coming back is announced again
        let later = now + Duration::seconds(150);
        tracker.record_heartbeat("dev-1", later, later).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["to"], "online");
    }

    #[tokio::test]
    async fn test_lapse_without_sweep_announces_both_transitions() {
        let (tracker, mut rx) = setup().await;
        let now = Utc::now();
        tracker.record_heartbeat("dev-1", now, now).await.unwrap();
        drain(&mut rx);

        let later = now + Duration::seconds(300);
        tracker.record_heartbeat("dev-1", later, later).await.unwrap();

        let events = drain(&mut rx);
        let targets: Vec<&str> = events.iter().map(|e| e.payload["to"].as_str().unwrap()).collect();
        assert_eq!(targets, vec!["offline", "online"]);
    }

    #[tokio::test]
    async fn test_sweep_does_not_act_on_stale_read() {
        let (tracker, store, mut rx) = pausing_setup().await;
        let t0 = Utc::now();
        tracker.record_heartbeat("dev-1", t0, t0).await.unwrap();
        drain(&mut rx);

        let back = t0 + Duration::seconds(90);
        store.pause_get.store(true, Ordering::SeqCst);
        let sweep = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.sweep_offline(back).await })
        };
        store.paused.notified().await;

        // the device reports in while the sweep holds its snapshot
        let heartbeat = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.record_heartbeat("dev-1", back, back).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.resume.notify_one();

        assert_eq!(sweep.await.unwrap().unwrap(), 1);
        assert_eq!(heartbeat.await.unwrap().unwrap(), DeviceStatus::Online);

        let events = drain(&mut rx);
        assert_eq!(
            transitions(&events),
            vec![
                ("online".to_string(), "offline".to_string()),
                ("offline".to_string(), "online".to_string()),
            ]
        );
        assert_eq!(
            tracker.current_status("dev-1", back).await.unwrap().status,
            DeviceStatus::Online
        );
        assert_eq!(tracker.sweep_offline(back + Duration::seconds(10)).await.unwrap(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_first_heartbeats_announce_online_once() {
        let (tracker, store, mut rx) = pausing_setup().await;
        let t0 = Utc::now();

        store.pause_touch.store(true, Ordering::SeqCst);
        let first = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.record_heartbeat("dev-1", t0, t0).await })
        };
        store.paused.notified().await;

        let t1 = t0 + Duration::seconds(1);
        let second = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.record_heartbeat("dev-1", t1, t1).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store.resume.notify_one();

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            transitions(&events),
            vec![("unknown".to_string(), "online".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (tracker, _rx) = setup().await;
        let now = Utc::now();
        let err = tracker.record_heartbeat("ghost", now, now).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(matches!(
            tracker.current_status("ghost", now).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
