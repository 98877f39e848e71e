//! Periodic telemetry payload published by the binary

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub value: String,
    /// RFC 3339, UTC
    pub timestamp: String,
}

impl TelemetrySample {
    pub fn new(value: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Sample number `sequence` of this run
    pub fn numbered(sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self::new(format!("sample-{sequence}"), timestamp)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_payload_shape() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 5).unwrap();
        let payload = TelemetrySample::numbered(7, at).to_payload().unwrap();

        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["value"], "sample-7");
        assert_eq!(json["timestamp"], "2024-03-01T12:00:05.000Z");
        assert_eq!(json.as_object().map(|o| o.len()), Some(2));
    }
}
