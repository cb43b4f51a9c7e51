use serde::{Deserialize, Serialize};

// --- Track Metadata ---
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub path: String,
    pub duration_seconds: Option<f64>,
    pub bpm: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<TrackStructure>,
}

/// One contiguous region of a track, measured in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackSection {
    pub start: f64,
    pub end: f64,
    pub beats: i32,
}

impl TrackSection {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Intro/main/outro partition plus hot cues, covering 0..duration exactly.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackStructure {
    pub bpm: f64,
    pub beats: Vec<f64>,
    pub intro: TrackSection,
    pub main: TrackSection,
    pub outro: TrackSection,
    pub hot_cues: Vec<f64>,
}

// --- EQ ---
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EqBand {
    Low,
    Mid,
    High,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EqCutState {
    pub low: bool,
    pub mid: bool,
    pub high: bool,
}

// --- Recording ---
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecordingFormat {
    Wav,
    OggVorbis,
}

impl RecordingFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RecordingFormat::Wav => "wav",
            RecordingFormat::OggVorbis => "ogg",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecordingPhase {
    Idle,
    Preparing,
    Recording,
    Stopping,
    Error,
}

// --- Device & Routing ---
/// Main and cue output pairs as device channel indices; `None` = unrouted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRouting {
    pub main: [Option<u16>; 2],
    pub cue: [Option<u16>; 2],
}

impl Default for ChannelRouting {
    fn default() -> Self {
        ChannelRouting {
            main: [Some(0), Some(1)],
            cue: [None, None],
        }
    }
}

impl ChannelRouting {
    /// Highest routed device channel index, if any channel is routed.
    pub fn max_used_index(&self) -> Option<u16> {
        self.main
            .iter()
            .chain(self.cue.iter())
            .flatten()
            .copied()
            .max()
    }
}

/// Output configuration supplied by the control plane.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    /// Device name; stable across restarts, unlike enumeration order.
    pub device_id: Option<String>,
    #[serde(default)]
    pub routing: ChannelRouting,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_max_used_index_spans_main_and_cue() {
        let mut routing = ChannelRouting::default();
        assert_eq!(routing.max_used_index(), Some(1));
        routing.cue = [Some(2), Some(3)];
        assert_eq!(routing.max_used_index(), Some(3));
        routing.main = [None, None];
        routing.cue = [None, None];
        assert_eq!(routing.max_used_index(), None);
    }

    #[test]
    fn eq_band_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&EqBand::Mid).unwrap(), "\"mid\"");
        let band: EqBand = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(band, EqBand::High);
    }
}
