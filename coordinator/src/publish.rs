use crate::errors::{Error, Result};
use crate::metrics::PUBLISH_FAILURES_TOTAL;
use crate::model::{DeviceStatus, Reading};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveEventKind {
    Reading,
    StatusChange,
}

/// Event pushed to dashboards over the live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveEvent {
    #[serde(rename = "type")]
    pub kind: LiveEventKind,
    pub device_id: String,
    pub organization_id: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl LiveEvent {
    pub fn reading(organization_id: &str, reading: &Reading) -> Self {
        Self {
            kind: LiveEventKind::Reading,
            device_id: reading.device_id.clone(),
            organization_id: organization_id.to_string(),
            payload: serde_json::json!({
                "sensor_type": reading.sensor_type,
                "value": reading.value,
                "unit": reading.unit,
            }),
            timestamp: reading.timestamp,
        }
    }

    pub fn status_change(
        organization_id: &str,
        device_id: &str,
        from: DeviceStatus,
        to: DeviceStatus,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: LiveEventKind::StatusChange,
            device_id: device_id.to_string(),
            organization_id: organization_id.to_string(),
            payload: serde_json::json!({ "from": from, "to": to }),
            timestamp: at,
        }
    }
}

/// External pub/sub channel for live events.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: &LiveEvent) -> Result<()>;
}

/// Publishes and swallows the failure. Callers must not hold a device lock here.
pub async fn publish_best_effort(publisher: &dyn Publisher, event: &LiveEvent) {
    if let Err(e) = publisher.publish(event).await {
        PUBLISH_FAILURES_TOTAL.inc();
        warn!(
            device_id = %event.device_id,
            kind = ?event.kind,
            "Failed to publish live event: {}",
            e
        );
    }
}

/// Live feed over MQTT, QoS 0.
pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
}

impl MqttPublisher {
    /// Connects and spawns the event loop driving the connection.
    pub fn connect(
        broker: &str,
        port: u16,
        client_id: String,
        topic_prefix: impl Into<String>,
    ) -> (Self, JoinHandle<()>) {
        info!("Connecting live feed to MQTT broker at {}:{}", broker, port);

        let mut mqtt_options = MqttOptions::new(client_id, broker, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Live feed connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {}", e);
                        // rumqttc reconnects on the next poll
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        (
            Self {
                client,
                topic_prefix: topic_prefix.into(),
            },
            handle,
        )
    }

    fn topic_for(&self, event: &LiveEvent) -> String {
        topic_for(&self.topic_prefix, event)
    }
}

fn topic_for(prefix: &str, event: &LiveEvent) -> String {
    format!("{}/{}/{}", prefix, event.organization_id, event.device_id)
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, event: &LiveEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let topic = self.topic_for(event);
        debug!("Publishing {} bytes to {}", payload.len(), topic);

        // a full request queue means the broker is not keeping up; drop rather than wait
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(Error::Mqtt)
    }
}

/// In-process live feed; events are lost when nobody subscribes.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<LiveEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, event: &LiveEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| Error::Unavailable("no live feed subscribers".to_string()))
    }
}
