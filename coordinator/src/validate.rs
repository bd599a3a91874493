use crate::errors::{Error, Result};
use crate::model::ReadingInput;
use chrono::{DateTime, Duration, Utc};

/// Physical bounds per known sensor type.
const SENSOR_RANGES: &[(&str, f64, f64)] = &[
    ("temperature", -50.0, 100.0),
    ("humidity", 0.0, 100.0),
    ("battery", 0.0, 100.0),
    ("pressure", 300.0, 1100.0),
    ("voltage", 0.0, 1000.0),
    ("current", -1000.0, 1000.0),
    ("co2", 0.0, 50000.0),
    ("light", 0.0, 200000.0),
];

#[derive(Debug, Clone, Copy)]
pub struct ReadingRules {
    pub max_skew_past: Duration,
    pub max_skew_future: Duration,
    pub max_batch: usize,
}

impl Default for ReadingRules {
    fn default() -> Self {
        Self {
            max_skew_past: Duration::days(7),
            max_skew_future: Duration::seconds(30),
            max_batch: 1000,
        }
    }
}

pub fn sensor_range(sensor_type: &str) -> Option<(f64, f64)> {
    SENSOR_RANGES
        .iter()
        .find(|(name, _, _)| *name == sensor_type)
        .map(|(_, min, max)| (*min, *max))
}

/// Validates a single reading
pub fn validate(reading: &ReadingInput, rules: &ReadingRules, now: DateTime<Utc>) -> Result<()> {
    let Some((min, max)) = sensor_range(&reading.sensor_type) else {
        return Err(Error::InvalidArgument(format!(
            "Unknown sensor type '{}'",
            reading.sensor_type
        )));
    };

    if !reading.value.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "Value {} is not a finite number",
            reading.value
        )));
    }

    if reading.value < min || reading.value > max {
        return Err(Error::InvalidArgument(format!(
            "{} value {} out of range [{}, {}]",
            reading.sensor_type, reading.value, min, max
        )));
    }

    if reading.unit.trim().is_empty() {
        return Err(Error::InvalidArgument("Unit cannot be empty".to_string()));
    }

    if reading.timestamp > now + rules.max_skew_future {
        return Err(Error::InvalidArgument(format!(
            "Timestamp {} is too far in the future",
            reading.timestamp
        )));
    }

    if reading.timestamp < now - rules.max_skew_past {
        return Err(Error::InvalidArgument(format!(
            "Timestamp {} is too old",
            reading.timestamp
        )));
    }

    Ok(())
}

/// Validates a whole batch; the error names the first offending entry.
pub fn validate_batch(batch: &[ReadingInput], rules: &ReadingRules, now: DateTime<Utc>) -> Result<()> {
    if batch.is_empty() {
        return Err(Error::InvalidArgument("Batch is empty".to_string()));
    }
    if batch.len() > rules.max_batch {
        return Err(Error::InvalidArgument(format!(
            "Batch of {} readings exceeds limit of {}",
            batch.len(),
            rules.max_batch
        )));
    }

    for (index, reading) in batch.iter().enumerate() {
        validate(reading, rules, now).map_err(|e| match e {
            Error::InvalidArgument(msg) => Error::InvalidArgument(format!("reading[{}]: {}", index, msg)),
            other => other,
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(sensor_type: &str, value: f64, timestamp: DateTime<Utc>) -> ReadingInput {
        ReadingInput {
            sensor_type: sensor_type.to_string(),
            value,
            unit: "u".to_string(),
            timestamp,
        }
    }

    #[test]
    fn test_valid_reading() {
        let now = Utc::now();
        assert!(validate(&reading("temperature", 25.0, now), &ReadingRules::default(), now).is_ok());
    }

    #[test]
    fn test_unknown_sensor() {
        let now = Utc::now();
        assert!(validate(&reading("flux-capacitor", 1.0, now), &ReadingRules::default(), now).is_err());
    }

    #[test]
    fn test_non_finite_value() {
        let now = Utc::now();
        let rules = ReadingRules::default();
        assert!(validate(&reading("temperature", f64::NAN, now), &rules, now).is_err());
        assert!(validate(&reading("temperature", f64::INFINITY, now), &rules, now).is_err());
    }

    #[test]
    fn test_invalid_temperature() {
        let now = Utc::now();
        assert!(validate(&reading("temperature", 150.0, now), &ReadingRules::default(), now).is_err());
    }

    #[test]
    fn test_empty_unit() {
        let now = Utc::now();
        let mut r = reading("humidity", 50.0, now);
        r.unit = " ".to_string();
        assert!(validate(&r, &ReadingRules::default(), now).is_err());
    }

    #[test]
    fn test_timestamp_window() {
        let now = Utc::now();
        let rules = ReadingRules::default();
        let edge_future = now + rules.max_skew_future;
        let edge_past = now - rules.max_skew_past;

        assert!(validate(&reading("battery", 50.0, edge_future), &rules, now).is_ok());
        assert!(validate(&reading("battery", 50.0, edge_past), &rules, now).is_ok());
        assert!(validate(
            &reading("battery", 50.0, edge_future + Duration::seconds(1)),
            &rules,
            now
        )
        .is_err());
        assert!(validate(
            &reading("battery", 50.0, edge_past - Duration::seconds(1)),
            &rules,
            now
        )
        .is_err());
    }

    #[test]
    fn test_batch_reports_first_offender() {
        let now = Utc::now();
        let batch = vec![
            reading("temperature", 20.0, now),
            reading("humidity", 500.0, now),
            reading("pressure", 0.0, now),
        ];
        match validate_batch(&batch, &ReadingRules::default(), now) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.starts_with("reading[1]"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_batch_size_limits() {
        let now = Utc::now();
        let rules = ReadingRules {
            max_batch: 2,
            ..ReadingRules::default()
        };
        assert!(validate_batch(&[], &rules, now).is_err());
        let batch = vec![reading("temperature", 20.0, now); 3];
        assert!(validate_batch(&batch, &rules, now).is_err());
    }
}
