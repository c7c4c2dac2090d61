//! State-change record handed to the event sink

use crate::domain::types::{DistanceSample, Posture, SeatToken};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Immutable seat-session boundary record
///
/// Built by the posture state machine when the seat status changes. Sinks
/// receive it by reference and serialize it; nothing points back into the
/// machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChangeEvent {
    /// Event ID (UUIDv7), lets downstream consumers de-duplicate
    pub id: String,
    /// Wall-clock time of the transition
    pub timestamp: DateTime<Utc>,
    pub seat_status: SeatToken,
    pub posture: Posture,
    /// Calibration distance in cm (2 decimals), 0 when no calibration is held
    pub distance: f64,
    /// Site identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
}

impl StateChangeEvent {
    pub fn new(
        seat_status: SeatToken,
        posture: Posture,
        calibration: Option<DistanceSample>,
    ) -> Self {
        Self {
            id: new_uuid_v7(),
            timestamp: Utc::now(),
            seat_status,
            posture,
            distance: calibration.map(DistanceSample::rounded).unwrap_or(0.0),
            site: None,
        }
    }

    pub fn with_site(mut self, site: &str) -> Self {
        self.site = Some(site.to_string());
        self
    }

    /// Serialize to a JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_v7_generation() {
        let uuid1 = new_uuid_v7();
        let uuid2 = new_uuid_v7();
        assert_ne!(uuid1, uuid2);
        assert_eq!(uuid1.len(), 36);
    }

    #[test]
    fn test_seated_event_json() {
        let calibration = DistanceSample::from_cm(30.456).unwrap();
        let event = StateChangeEvent::new(SeatToken::Seated, Posture::Good, Some(calibration))
            .with_site("desk-1");

        let parsed: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(parsed["seat_status"], "SEATED");
        assert_eq!(parsed["posture"], "GOOD");
        assert_eq!(parsed["distance"], 30.46);
        assert_eq!(parsed["site"], "desk-1");
        assert_eq!(parsed["id"], event.id);
        assert!(parsed["timestamp"].is_string());
    }

    #[test]
    fn test_empty_event_reports_zero_distance() {
        let event = StateChangeEvent::new(SeatToken::Empty, Posture::Empty, None);
        let parsed: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(parsed["distance"], 0.0);
        assert_eq!(parsed["posture"], "EMPTY");
        assert!(parsed.get("site").is_none());
    }
}
