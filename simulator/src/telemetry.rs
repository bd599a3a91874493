use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    fn new(sensor_type: &str, value: f64, unit: &str) -> Self {
        Self {
            sensor_type: sensor_type.to_string(),
            value,
            unit: unit.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// One batch of temperature, humidity and battery samples, with occasional outliers.
pub fn generate_batch(rng: &mut impl Rng) -> Vec<Reading> {
    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(-80.0..150.0) // 5% outliers, some rejected
    } else {
        rng.gen_range(15.0..35.0)
    };

    let humidity = if rng.gen_bool(0.05) {
        rng.gen_range(0.0..100.0)
    } else {
        rng.gen_range(30.0..80.0)
    };

    let battery = if rng.gen_bool(0.02) {
        rng.gen_range(0.0..20.0) // 2% low battery
    } else {
        rng.gen_range(20.0..100.0)
    };

    vec![
        Reading::new("temperature", temperature, "C"),
        Reading::new("humidity", humidity, "%"),
        Reading::new("battery", battery, "%"),
    ]
}

#[derive(Debug, Serialize)]
pub struct ReadingsRequest<'a> {
    pub device_id: &'a str,
    pub batch: Vec<Reading>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatRequest<'a> {
    pub device_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct AckRequest<'a> {
    pub device_id: &'a str,
    pub result: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PolledCommand {
    pub id: String,
    pub payload: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PollResponse {
    pub commands: Vec<PolledCommand>,
}
