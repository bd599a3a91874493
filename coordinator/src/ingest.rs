use crate::errors::Result;
use crate::heartbeat::HeartbeatTracker;
use crate::metrics::{BATCHES_REJECTED_TOTAL, READINGS_ACCEPTED_TOTAL};
use crate::model::{Device, Reading, ReadingInput};
use crate::publish::{publish_best_effort, LiveEvent, Publisher};
use crate::store::Store;
use crate::validate::{validate_batch, ReadingRules};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Validates reading batches, persists them atomically and fans them out live.
pub struct ReadingIngestBuffer {
    store: Arc<dyn Store>,
    heartbeat: Arc<HeartbeatTracker>,
    publisher: Arc<dyn Publisher>,
    rules: ReadingRules,
}

impl ReadingIngestBuffer {
    pub fn new(
        store: Arc<dyn Store>,
        heartbeat: Arc<HeartbeatTracker>,
        publisher: Arc<dyn Publisher>,
        rules: ReadingRules,
    ) -> Self {
        Self {
            store,
            heartbeat,
            publisher,
            rules,
        }
    }

    /// Returns the number of readings accepted. Either the whole batch is
    /// stored or none of it is.
    pub async fn ingest(&self, device: &Device, batch: Vec<ReadingInput>, now: DateTime<Utc>) -> Result<usize> {
        if let Err(e) = validate_batch(&batch, &self.rules, now) {
            BATCHES_REJECTED_TOTAL.inc();
            warn!(device_id = %device.device_id, "Rejected reading batch: {}", e);
            return Err(e);
        }

        let readings: Vec<Reading> = batch
            .into_iter()
            .map(|r| r.into_reading(&device.device_id))
            .collect();
        self.store.insert_readings(&readings).await?;

        let accepted = readings.len();
        READINGS_ACCEPTED_TOTAL.inc_by(accepted as f64);
        debug!(device_id = %device.device_id, accepted, "Reading batch stored");

        // the batch is committed; a failed liveness update must not make the device resend it
        if let Err(e) = self.heartbeat.record_heartbeat(&device.device_id, now, now).await {
            warn!(device_id = %device.device_id, "Failed to update liveness after ingest: {}", e);
        }

        for reading in &readings {
            let event = LiveEvent::reading(&device.organization_id, reading);
            publish_best_effort(self.publisher.as_ref(), &event).await;
        }

        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::publish::{BroadcastPublisher, LiveEventKind};
    use crate::store::MemoryStore;
    use chrono::Duration;

    struct Fixture {
        ingest: ReadingIngestBuffer,
        store: Arc<MemoryStore>,
        heartbeat: Arc<HeartbeatTracker>,
        publisher: Arc<BroadcastPublisher>,
        device: Device,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let device = Device::new("dev-1", "org-1", "key-1");
        store.insert_device(&device).await.unwrap();
        let publisher = Arc::new(BroadcastPublisher::new(64));
        let heartbeat = Arc::new(HeartbeatTracker::new(
            store.clone(),
            publisher.clone(),
            Duration::seconds(60),
        ));
        let ingest = ReadingIngestBuffer::new(
            store.clone(),
            heartbeat.clone(),
            publisher.clone(),
            ReadingRules::default(),
        );
        Fixture {
            ingest,
            store,
            heartbeat,
            publisher,
            device,
        }
    }

    fn reading(sensor_type: &str, value: f64, timestamp: DateTime<Utc>) -> ReadingInput {
        ReadingInput {
            sensor_type: sensor_type.to_string(),
            value,
            unit: "u".to_string(),
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let f = setup().await;
        let now = Utc::now();
        let batch = vec![
            reading("temperature", 21.0, now),
            reading("humidity", 40.0, now),
            reading("temperature", f64::NAN, now),
        ];

        let err = f.ingest.ingest(&f.device, batch, now).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(f.store.count_readings("dev-1").await.unwrap(), 0);

        // rejected batches are not liveness
        let status = f.heartbeat.current_status("dev-1", now).await.unwrap();
        assert_eq!(status.last_seen_at, None);
    }

    #[tokio::test]
    async fn test_accepted_batch_updates_liveness_and_publishes_in_order() {
        let f = setup().await;
        let mut rx = f.publisher.subscribe();
        let now = Utc::now();
        let batch = vec![
            reading("temperature", 21.0, now - Duration::seconds(2)),
            reading("humidity", 40.0, now - Duration::seconds(1)),
            reading("battery", 90.0, now),
        ];

        let accepted = f.ingest.ingest(&f.device, batch, now).await.unwrap();
        assert_eq!(accepted, 3);
        assert_eq!(f.store.count_readings("dev-1").await.unwrap(), 3);

        let status = f.heartbeat.current_status("dev-1", now).await.unwrap();
        assert_eq!(status.last_seen_at, Some(now));

        let mut sensors = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.kind == LiveEventKind::Reading {
                sensors.push(event.payload["sensor_type"].as_str().unwrap().to_string());
            }
        }
        assert_eq!(sensors, vec!["temperature", "humidity", "battery"]);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let f = setup().await;
        let now = Utc::now();
        f.store.set_unavailable(true);

        let err = f
            .ingest
            .ingest(&f.device, vec![reading("temperature", 21.0, now)], now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_ingest() {
        // no subscriber, so every publish fails
        let f = setup().await;
        let now = Utc::now();
        let accepted = f
            .ingest
            .ingest(&f.device, vec![reading("temperature", 21.0, now)], now)
            .await
            .unwrap();
        assert_eq!(accepted, 1);
    }
}
