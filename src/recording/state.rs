use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RecordingState {
    Idle,
    #[serde(rename_all = "camelCase")]
    Recording {
        peer_id: String,
        output_path: PathBuf,
    },
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

impl RecordingState {
    pub fn is_recording(&self) -> bool {
        matches!(self, Self::Recording { .. })
    }

    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Self::Recording { peer_id, .. } => Some(peer_id),
            Self::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> RecordingState {
        RecordingState::Recording {
            peer_id: "peer-1".to_string(),
            output_path: PathBuf::from("recordings/ada_1.webm"),
        }
    }

    #[test]
    fn test_default_state() {
        let state = RecordingState::default();
        assert_eq!(state, RecordingState::Idle);
        assert!(!state.is_recording());
        assert_eq!(state.peer_id(), None);
    }

    #[test]
    fn test_state_equality() {
        assert_eq!(recording(), recording());
        assert_ne!(recording(), RecordingState::Idle);
        assert_eq!(recording().peer_id(), Some("peer-1"));
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_value(recording()).unwrap();
        assert_eq!(json["status"], "recording");
        assert_eq!(json["peerId"], "peer-1");
        assert_eq!(json["outputPath"], "recordings/ada_1.webm");

        let idle = serde_json::to_string(&RecordingState::Idle).unwrap();
        assert_eq!(idle, r#"{"status":"idle"}"#);
    }

    #[test]
    fn test_state_deserialization() {
        let state: RecordingState = serde_json::from_str(r#"{"status":"idle"}"#).unwrap();
        assert_eq!(state, RecordingState::Idle);

        let state: RecordingState = serde_json::from_str(
            r#"{"status":"recording","peerId":"peer-1","outputPath":"recordings/ada_1.webm"}"#,
        )
        .unwrap();
        assert_eq!(state, recording());
    }
}
