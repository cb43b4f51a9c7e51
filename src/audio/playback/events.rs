use serde::{Deserialize, Serialize};

use crate::audio::types::{EqCutState, RecordingFormat, RecordingPhase};

use super::state::{DECK_COUNT, EngineState};

/// Track fields carried inside state snapshots. Bulk payloads (PCM, waveform)
/// never ride along; the waveform travels through its own chunked events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub id: String,
    pub title: String,
    pub duration_seconds: Option<f64>,
    pub bpm: Option<f32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeckSnapshot {
    pub track: Option<TrackSummary>,
    pub playing: bool,
    pub position_seconds: Option<f64>,
    pub gain: f32,
    pub cue_enabled: bool,
    pub eq_cuts: EqCutState,
    pub loop_active: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordingState {
    pub phase: RecordingPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<RecordingFormat>,
    pub bytes_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Complete engine state at one mixed-chunk boundary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    pub deck_a: DeckSnapshot,
    pub deck_b: DeckSnapshot,
    pub crossfader_position: f32,
    pub is_crossfading: bool,
    pub master_tempo: f32,
    pub device_name: Option<String>,
    pub mic_available: bool,
    pub mic_enabled: bool,
    pub recording: RecordingState,
}

/// Per-deck differential fields; `None` means unchanged.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeckDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<Option<TrackSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_seconds: Option<f64>,
    /// Present (true) only when the position change came from a seek command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_seek: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gain: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cue_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eq_cuts: Option<EqCutState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_active: Option<bool>,
}

impl DeckDelta {
    fn is_empty(&self) -> bool {
        *self == DeckDelta::default()
    }
}

/// Differential snapshot: a field is present only when it changed since the
/// previous snapshot. Receivers merge into their cached full state.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineStateDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deck_a: Option<DeckDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deck_b: Option<DeckDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crossfader_position: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_crossfading: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_tempo: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mic_available: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mic_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingState>,
}

impl EngineStateDelta {
    pub fn is_empty(&self) -> bool {
        *self == EngineStateDelta::default()
    }
}

/// Per-callback level meter readings.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LevelSnapshot {
    pub deck_a_peak: f32,
    pub deck_b_peak: f32,
    pub deck_a_peak_hold: f32,
    pub deck_b_peak_hold: f32,
    pub mic_level: f32,
}

/// Events flowing engine -> control session.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(EngineStateDelta),
    Levels(LevelSnapshot),
    TrackEnded { deck: usize },
    Error { context: String, message: String },
    RecordingError { message: String },
    DeviceChanged { output_devices: usize },
}

/// Builds the full snapshot for the current state.
pub fn snapshot_of(state: &EngineState) -> EngineSnapshot {
    let deck = |i: usize| {
        let d = &state.decks[i];
        DeckSnapshot {
            track: d.track.as_ref().map(|t| TrackSummary {
                id: t.info.id.clone(),
                title: t.info.title.clone(),
                duration_seconds: t.info.duration_seconds,
                bpm: t.info.bpm,
            }),
            playing: d.playing,
            position_seconds: d.track.as_ref().map(|_| d.position_seconds()),
            gain: d.gain,
            cue_enabled: d.cue_enabled,
            eq_cuts: d.eq.cut_state(),
            loop_active: d.loop_region.is_some(),
        }
    };

    EngineSnapshot {
        deck_a: deck(0),
        deck_b: deck(1),
        crossfader_position: state.crossfade.position,
        is_crossfading: state.crossfade.active,
        master_tempo: state.master_tempo,
        device_name: state.device_name.clone(),
        mic_available: state.mic.available,
        mic_enabled: state.mic.enabled,
        recording: RecordingState {
            phase: state.recording.phase,
            path: state.recording.path.clone(),
            format: state.recording.format,
            bytes_written: state
                .recorder
                .as_ref()
                .map(|r| r.bytes_written())
                .or_else(|| state.recording.watch.as_ref().map(|w| w.bytes_written()))
                .unwrap_or(0),
            last_error: state.recording.last_error.clone(),
        },
    }
}

fn diff_deck(prev: &DeckSnapshot, current: &DeckSnapshot, is_seek: bool) -> DeckDelta {
    let mut delta = DeckDelta::default();
    if prev.track != current.track {
        delta.track = Some(current.track.clone());
    }
    if prev.playing != current.playing {
        delta.playing = Some(current.playing);
    }
    // Positions ride every snapshot while the deck plays; otherwise only on
    // change (e.g. a seek while paused).
    if current.playing || prev.position_seconds != current.position_seconds {
        delta.position_seconds = current.position_seconds;
    }
    if is_seek {
        delta.is_seek = Some(true);
    }
    if prev.gain != current.gain {
        delta.gain = Some(current.gain);
    }
    if prev.cue_enabled != current.cue_enabled {
        delta.cue_enabled = Some(current.cue_enabled);
    }
    if prev.eq_cuts != current.eq_cuts {
        delta.eq_cuts = Some(current.eq_cuts);
    }
    if prev.loop_active != current.loop_active {
        delta.loop_active = Some(current.loop_active);
    }
    delta
}

/// Diffs two snapshots. Returns `None` when nothing needs to go out.
pub fn diff_snapshots(
    prev: Option<&EngineSnapshot>,
    current: &EngineSnapshot,
    seek_flags: [bool; DECK_COUNT],
) -> Option<EngineStateDelta> {
    let prev = match prev {
        Some(prev) => prev,
        None => {
            // First snapshot: everything is news.
            return Some(EngineStateDelta {
                deck_a: Some(full_deck_delta(&current.deck_a, seek_flags[0])),
                deck_b: Some(full_deck_delta(&current.deck_b, seek_flags[1])),
                crossfader_position: Some(current.crossfader_position),
                is_crossfading: Some(current.is_crossfading),
                master_tempo: Some(current.master_tempo),
                device_name: Some(current.device_name.clone()),
                mic_available: Some(current.mic_available),
                mic_enabled: Some(current.mic_enabled),
                recording: Some(current.recording.clone()),
            });
        }
    };

    let mut delta = EngineStateDelta::default();

    let deck_a = diff_deck(&prev.deck_a, &current.deck_a, seek_flags[0]);
    if !deck_a.is_empty() {
        delta.deck_a = Some(deck_a);
    }
    let deck_b = diff_deck(&prev.deck_b, &current.deck_b, seek_flags[1]);
    if !deck_b.is_empty() {
        delta.deck_b = Some(deck_b);
    }
    if prev.crossfader_position != current.crossfader_position {
        delta.crossfader_position = Some(current.crossfader_position);
    }
    if prev.is_crossfading != current.is_crossfading {
        delta.is_crossfading = Some(current.is_crossfading);
    }
    if prev.master_tempo != current.master_tempo {
        delta.master_tempo = Some(current.master_tempo);
    }
    if prev.device_name != current.device_name {
        delta.device_name = Some(current.device_name.clone());
    }
    if prev.mic_available != current.mic_available {
        delta.mic_available = Some(current.mic_available);
    }
    if prev.mic_enabled != current.mic_enabled {
        delta.mic_enabled = Some(current.mic_enabled);
    }
    if prev.recording != current.recording {
        delta.recording = Some(current.recording.clone());
    }

    if delta.is_empty() { None } else { Some(delta) }
}

fn full_deck_delta(deck: &DeckSnapshot, is_seek: bool) -> DeckDelta {
    DeckDelta {
        track: Some(deck.track.clone()),
        playing: Some(deck.playing),
        position_seconds: deck.position_seconds,
        is_seek: if is_seek { Some(true) } else { None },
        gain: Some(deck.gain),
        cue_enabled: Some(deck.cue_enabled),
        eq_cuts: Some(deck.eq_cuts),
        loop_active: Some(deck.loop_active),
    }
}

/// Receiver-side merge: folds a delta into a cached full snapshot.
pub fn merge_delta(snapshot: &mut EngineSnapshot, delta: &EngineStateDelta) {
    fn merge_deck(deck: &mut DeckSnapshot, delta: &DeckDelta) {
        if let Some(track) = &delta.track {
            deck.track = track.clone();
        }
        if let Some(playing) = delta.playing {
            deck.playing = playing;
        }
        if delta.position_seconds.is_some() {
            deck.position_seconds = delta.position_seconds;
        }
        if let Some(gain) = delta.gain {
            deck.gain = gain;
        }
        if let Some(cue) = delta.cue_enabled {
            deck.cue_enabled = cue;
        }
        if let Some(eq) = delta.eq_cuts {
            deck.eq_cuts = eq;
        }
        if let Some(loop_active) = delta.loop_active {
            deck.loop_active = loop_active;
        }
    }

    if let Some(deck_a) = &delta.deck_a {
        merge_deck(&mut snapshot.deck_a, deck_a);
    }
    if let Some(deck_b) = &delta.deck_b {
        merge_deck(&mut snapshot.deck_b, deck_b);
    }
    if let Some(position) = delta.crossfader_position {
        snapshot.crossfader_position = position;
    }
    if let Some(fading) = delta.is_crossfading {
        snapshot.is_crossfading = fading;
    }
    if let Some(tempo) = delta.master_tempo {
        snapshot.master_tempo = tempo;
    }
    if let Some(device) = &delta.device_name {
        snapshot.device_name = device.clone();
    }
    if let Some(available) = delta.mic_available {
        snapshot.mic_available = available;
    }
    if let Some(enabled) = delta.mic_enabled {
        snapshot.mic_enabled = enabled;
    }
    if let Some(recording) = &delta.recording {
        snapshot.recording = recording.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_snapshot() -> EngineSnapshot {
        let deck = DeckSnapshot {
            track: None,
            playing: false,
            position_seconds: None,
            gain: 1.0,
            cue_enabled: false,
            eq_cuts: EqCutState::default(),
            loop_active: false,
        };
        EngineSnapshot {
            deck_a: deck.clone(),
            deck_b: deck,
            crossfader_position: 0.0,
            is_crossfading: false,
            master_tempo: 120.0,
            device_name: None,
            mic_available: false,
            mic_enabled: false,
            recording: RecordingState {
                phase: RecordingPhase::Idle,
                path: None,
                format: None,
                bytes_written: 0,
                last_error: None,
            },
        }
    }

    #[test]
    fn unchanged_state_yields_no_delta() {
        let snapshot = base_snapshot();
        assert!(diff_snapshots(Some(&snapshot), &snapshot, [false; 2]).is_none());
    }

    #[test]
    fn only_changed_fields_are_present() {
        let prev = base_snapshot();
        let mut current = prev.clone();
        current.master_tempo = 128.0;
        current.deck_a.gain = 1.5;

        let delta = diff_snapshots(Some(&prev), &current, [false; 2]).expect("delta");
        assert_eq!(delta.master_tempo, Some(128.0));
        assert_eq!(delta.deck_a.as_ref().unwrap().gain, Some(1.5));
        assert!(delta.deck_b.is_none());
        assert!(delta.crossfader_position.is_none());
    }

    #[test]
    fn playing_deck_always_reports_position() {
        let mut prev = base_snapshot();
        prev.deck_a.playing = true;
        prev.deck_a.position_seconds = Some(1.0);
        let mut current = prev.clone();
        current.deck_a.position_seconds = Some(1.0); // unchanged value

        let delta = diff_snapshots(Some(&prev), &current, [false; 2]).expect("delta");
        assert_eq!(delta.deck_a.unwrap().position_seconds, Some(1.0));
    }

    #[test]
    fn seek_flag_rides_exactly_one_delta() {
        let prev = base_snapshot();
        let mut current = prev.clone();
        current.deck_a.position_seconds = Some(60.0);

        let delta = diff_snapshots(Some(&prev), &current, [true, false]).expect("delta");
        assert_eq!(delta.deck_a.unwrap().is_seek, Some(true));

        let delta = diff_snapshots(Some(&current), &current, [false, false]);
        assert!(delta.is_none());
    }

    #[test]
    fn merge_reconstructs_latest_values() {
        let mut cached = base_snapshot();
        let prev = cached.clone();

        let mut current = prev.clone();
        current.crossfader_position = 0.7;
        current.deck_b.playing = true;
        current.deck_b.position_seconds = Some(3.2);

        let delta = diff_snapshots(Some(&prev), &current, [false; 2]).expect("delta");
        merge_delta(&mut cached, &delta);
        assert_eq!(cached, current);
    }
}
