use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel value meaning "signal loss / invalid sample". It is persisted
/// and batched like any other value, but never delivered to live stream
/// subscribers and never enters a filter window.
pub const SIGNAL_LOSS: f64 = -1.0;

/// Signal kinds carried on the CTG bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    FetalHeartRate,
    UterineContractions,
}

impl SignalKind {
    /// Wire name used in topics, payloads, and the gRPC surface.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetalHeartRate => "fetal_heart_rate",
            Self::UterineContractions => "uterine_contractions",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetal_heart_rate" => Some(Self::FetalHeartRate),
            "uterine_contractions" => Some(Self::UterineContractions),
            _ => None,
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded telemetry sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub device_id: String,
    pub kind: SignalKind,
    pub value: f64,
    pub time_sec: f64,
}

/// JSON payload published by CTG devices. `device_id` and `data_type` may be
/// absent; the topic path then supplies them.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryPayload {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub data_type: String,
    pub value: f64,
    #[serde(default)]
    pub units: String,
    pub time_sec: f64,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("topic `{0}` does not match medical/ctg/<data_type>/<device_id>")]
    BadTopic(String),
    #[error("unknown data type `{0}`")]
    UnknownKind(String),
    #[error("invalid payload: {0}")]
    BadPayload(#[from] serde_json::Error),
}

/// Decode one pub/sub message into a [`Sample`].
///
/// The last two topic segments are `<data_type>/<device_id>`; payload fields
/// win when present, the topic fills the gaps.
pub fn decode_message(topic: &str, payload: &[u8]) -> Result<Sample, DecodeError> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != "medical" || parts[1] != "ctg" {
        return Err(DecodeError::BadTopic(topic.to_string()));
    }

    let raw: TelemetryPayload = serde_json::from_slice(payload)?;

    let kind_str = if raw.data_type.is_empty() {
        parts[2]
    } else {
        raw.data_type.as_str()
    };
    let kind =
        SignalKind::parse(kind_str).ok_or_else(|| DecodeError::UnknownKind(kind_str.to_string()))?;

    let device_id = if raw.device_id.is_empty() {
        parts[3].to_string()
    } else {
        raw.device_id
    };
    if device_id.is_empty() {
        return Err(DecodeError::BadTopic(topic.to_string()));
    }

    Ok(Sample {
        device_id,
        kind,
        value: raw.value,
        time_sec: raw.time_sec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_payload() {
        let payload = br#"{"device_id":"CTG-001","data_type":"fetal_heart_rate","value":142.5,"units":"bpm","time_sec":12.25}"#;
        let sample = decode_message("medical/ctg/fetal_heart_rate/CTG-001", payload).unwrap();
        assert_eq!(sample.device_id, "CTG-001");
        assert_eq!(sample.kind, SignalKind::FetalHeartRate);
        assert_eq!(sample.value, 142.5);
        assert_eq!(sample.time_sec, 12.25);
    }

    #[test]
    fn test_decode_fills_from_topic() {
        // Payload without device_id / data_type: topic path supplies both.
        let payload = br#"{"value":34.0,"time_sec":1.0}"#;
        let sample = decode_message("medical/ctg/uterine_contractions/CTG-007", payload).unwrap();
        assert_eq!(sample.device_id, "CTG-007");
        assert_eq!(sample.kind, SignalKind::UterineContractions);
    }

    #[test]
    fn test_decode_payload_wins_over_topic() {
        let payload = br#"{"device_id":"CTG-A","data_type":"fetal_heart_rate","value":140.0,"time_sec":0.0}"#;
        let sample = decode_message("medical/ctg/uterine_contractions/CTG-B", payload).unwrap();
        assert_eq!(sample.device_id, "CTG-A");
        assert_eq!(sample.kind, SignalKind::FetalHeartRate);
    }

    #[test]
    fn test_decode_bad_topic() {
        let payload = br#"{"value":1.0,"time_sec":0.0}"#;
        assert!(matches!(
            decode_message("medical/ctg/fetal_heart_rate", payload),
            Err(DecodeError::BadTopic(_))
        ));
        assert!(matches!(
            decode_message("other/ctg/fetal_heart_rate/CTG-001", payload),
            Err(DecodeError::BadTopic(_))
        ));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let payload = br#"{"value":1.0,"time_sec":0.0}"#;
        assert!(matches!(
            decode_message("medical/ctg/blood_pressure/CTG-001", payload),
            Err(DecodeError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_decode_malformed_json() {
        assert!(matches!(
            decode_message("medical/ctg/fetal_heart_rate/CTG-001", b"{not json"),
            Err(DecodeError::BadPayload(_))
        ));
    }
}
