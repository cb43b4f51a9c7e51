use serde::{Deserialize, Serialize};

use crate::audio::playback::events::{EngineSnapshot, EngineStateDelta, LevelSnapshot};
use crate::audio::types::{AudioConfig, EqBand, RecordingFormat, TrackStructure};

/// A control-plane request with its optional correlation id.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub request: ControlRequest,
}

/// Requests flowing control plane -> engine session.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlRequest {
    // --- Lifecycle ---
    Init { audio_config: AudioConfig },
    ApplyAudioConfig { config: AudioConfig },
    Cleanup,

    // --- Transport ---
    LoadTrack { deck: usize, track_id: String },
    Play { deck: usize },
    /// Rewinds to the top of the track before starting playback.
    StartDeck { deck: usize },
    Stop { deck: usize },
    Seek { deck: usize, position_seconds: f64 },
    SetCrossfader { position: f32 },
    SetMasterTempo { bpm: f32 },
    SetDeckCue { deck: usize, enabled: bool },
    SetEqCut { deck: usize, band: EqBand, enabled: bool },
    SetDeckGain { deck: usize, gain: f32 },
    SetMicEnabled { enabled: bool },
    SetBeatLoop { deck: usize, beats: f32 },
    ClearLoop { deck: usize },
    StartCrossfade {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<f32>,
        duration_seconds: f64,
    },

    // --- Recording ---
    StartRecording {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        format: RecordingFormat,
    },
    StopRecording,

    // --- State ---
    GetState,
}

/// A reply carrying back the request's correlation id.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplyEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub reply: ControlReply,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlReply {
    Ok,
    State { state: EngineSnapshot },
    RecordingStarted { path: String },
    Failure { code: String, message: String },
}

impl ControlReply {
    pub fn failure(code: &str, message: impl Into<String>) -> Self {
        ControlReply::Failure {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Events fanned out to control-plane subscribers.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlEvent {
    /// Differential snapshot; receivers merge into their cached state.
    StateChanged { delta: EngineStateDelta },
    /// High-frequency peak meters, one per mixed callback.
    LevelState { levels: LevelSnapshot },
    TrackEnded { deck: usize },
    TrackStructure {
        track_id: String,
        structure: TrackStructure,
    },
    /// Mono mixdown fan-out in ~1 s chunks; stale chunks are discarded by
    /// track id on the receiving side.
    WaveformChunk {
        track_id: String,
        chunk_index: usize,
        total_chunks: usize,
        samples: Vec<f32>,
    },
    WaveformComplete { track_id: String },
    Error { context: String, message: String },
    RecordingError { message: String },
    DeviceChanged { output_devices: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_with_correlation_ids() {
        let envelope = RequestEnvelope {
            id: Some(42),
            request: ControlRequest::Seek {
                deck: 1,
                position_seconds: 63.5,
            },
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"seek\""));
        assert!(json.contains("\"id\":42"));

        let parsed: RequestEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, Some(42));
        assert!(matches!(
            parsed.request,
            ControlRequest::Seek { deck: 1, .. }
        ));
    }

    #[test]
    fn missing_id_is_accepted() {
        let parsed: RequestEnvelope =
            serde_json::from_str(r#"{"type":"getState"}"#).unwrap();
        assert_eq!(parsed.id, None);
        assert!(matches!(parsed.request, ControlRequest::GetState));
    }

    #[test]
    fn wire_names_are_camel_case() {
        let request = ControlRequest::SetMasterTempo { bpm: 128.0 };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"setMasterTempo\""));

        let event = ControlEvent::WaveformComplete {
            track_id: "abc".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"waveformComplete\""));
        assert!(json.contains("\"trackId\""));
    }
}
