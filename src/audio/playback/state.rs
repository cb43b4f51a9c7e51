use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::audio::config::{
    DECK_GAIN_MAX, ENGINE_CHANNELS, ENGINE_SAMPLE_RATE, FRAMES_PER_CHUNK, MASTER_TEMPO_MAX,
    MASTER_TEMPO_MIN,
};
use crate::audio::effects::EqKillProcessor;
use crate::audio::stretch::TimeStretcher;
use crate::audio::types::{ChannelRouting, RecordingFormat, RecordingPhase, TrackInfo};

use super::events::{EngineEvent, EngineSnapshot};
use super::recorder::RecorderHandle;

pub const DECK_COUNT: usize = 2;

/// A fully decoded track owned by one deck.
pub struct LoadedTrack {
    pub info: TrackInfo,
    /// Interleaved stereo f32 at the engine rate; single-owner, moved in.
    pub pcm: Vec<f32>,
}

impl LoadedTrack {
    pub fn total_frames(&self) -> usize {
        self.pcm.len() / ENGINE_CHANNELS
    }
}

/// Beat-aligned loop region in source frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopRegion {
    pub start_frame: usize,
    pub end_frame: usize,
    pub length_beats: f32,
}

/// One playback channel: its track, transport position and processing state.
pub struct DeckState {
    pub track: Option<LoadedTrack>,
    /// Read head in source frames.
    pub position: usize,
    pub playing: bool,
    /// Linear gain, 0..=2.
    pub gain: f32,
    pub cue_enabled: bool,
    pub loop_region: Option<LoopRegion>,
    pub stretcher: TimeStretcher,
    pub eq: EqKillProcessor,
}

impl DeckState {
    pub fn new() -> Self {
        Self {
            track: None,
            position: 0,
            playing: false,
            gain: 1.0,
            cue_enabled: false,
            loop_region: None,
            stretcher: TimeStretcher::new(ENGINE_SAMPLE_RATE),
            eq: EqKillProcessor::new(FRAMES_PER_CHUNK),
        }
    }

    /// Replaces the loaded track, cancelling all in-flight playback state.
    pub fn load(&mut self, track: LoadedTrack) {
        self.track = Some(track);
        self.position = 0;
        self.playing = false;
        self.loop_region = None;
        self.stretcher.reset();
        self.eq.reset();
    }

    pub fn total_frames(&self) -> usize {
        self.track.as_ref().map(|t| t.total_frames()).unwrap_or(0)
    }

    pub fn position_seconds(&self) -> f64 {
        self.position as f64 / ENGINE_SAMPLE_RATE as f64
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.track
            .as_ref()
            .map(|t| t.total_frames() as f64 / ENGINE_SAMPLE_RATE as f64)
    }

    pub fn bpm(&self) -> Option<f32> {
        self.track.as_ref().and_then(|t| t.info.bpm)
    }

    /// Starts playback; a deck without a track stays stopped.
    pub fn play(&mut self) -> bool {
        if self.track.is_some() {
            self.playing = true;
        }
        self.playing
    }

    pub fn stop(&mut self) {
        self.playing = false;
    }

    /// Seeks to a normalized position in [0, 1] and flushes the stretcher so
    /// stale pre-seek audio never reaches the mixer.
    pub fn seek_fraction(&mut self, fraction: f64) {
        let total = self.total_frames();
        if total == 0 {
            return;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        self.position = ((total as f64 * fraction) as usize).min(total);
        self.stretcher.reset();
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, DECK_GAIN_MAX);
    }

    /// Arms a loop of `beats` beats starting at the current position.
    ///
    /// Endpoints snap to the track's beat grid when one is known; otherwise
    /// the length comes straight from the master tempo. A loop that would
    /// run past the end of the track is clipped to the track end.
    pub fn set_loop(&mut self, beats: f32, master_bpm: f32) {
        let total = self.total_frames();
        if total == 0 || beats <= 0.0 {
            return;
        }
        let sr = ENGINE_SAMPLE_RATE as f64;

        let grid: Option<&[f64]> = self
            .track
            .as_ref()
            .and_then(|t| t.info.structure.as_ref())
            .map(|s| s.beats.as_slice())
            .filter(|beats| !beats.is_empty());

        let (start_frame, end_frame) = match grid {
            Some(grid) => {
                let position_secs = self.position as f64 / sr;
                let nearest = grid
                    .iter()
                    .enumerate()
                    .min_by(|a, b| {
                        let da = (a.1 - position_secs).abs();
                        let db = (b.1 - position_secs).abs();
                        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                let start = (grid[nearest] * sr) as usize;
                let end_index = nearest + beats.round() as usize;
                let end = match grid.get(end_index) {
                    Some(t) => (*t * sr) as usize,
                    None => {
                        let track_bpm = self.bpm().unwrap_or(master_bpm);
                        start + (beats as f64 * 60.0 / track_bpm as f64 * sr) as usize
                    }
                };
                (start, end)
            }
            None => {
                let start = self.position;
                let length = (beats as f64 * 60.0 / master_bpm as f64 * sr) as usize;
                (start, start + length)
            }
        };

        let end_frame = end_frame.min(total);
        if end_frame <= start_frame {
            return;
        }
        self.loop_region = Some(LoopRegion {
            start_frame,
            end_frame,
            length_beats: beats,
        });
    }

    pub fn clear_loop(&mut self) {
        self.loop_region = None;
    }
}

/// Crossfader with an optional frame-clocked automated transition.
pub struct CrossfadeState {
    /// 0.0 = deck A only, 1.0 = deck B only.
    pub position: f32,
    pub active: bool,
    pub start_position: f32,
    pub target_position: f32,
    pub total_frames: usize,
    pub remaining_frames: usize,
}

impl Default for CrossfadeState {
    fn default() -> Self {
        Self {
            position: 0.0,
            active: false,
            start_position: 0.0,
            target_position: 0.0,
            total_frames: 0,
            remaining_frames: 0,
        }
    }
}

impl CrossfadeState {
    /// Manual moves are authoritative and cancel any running automation.
    pub fn set_manual(&mut self, position: f32) {
        self.position = position.clamp(0.0, 1.0);
        self.cancel();
    }

    pub fn cancel(&mut self) {
        self.active = false;
        self.remaining_frames = 0;
        self.total_frames = 0;
    }

    pub fn start(&mut self, target: f32, duration_seconds: f64, sample_rate: u32) {
        let target = target.clamp(0.0, 1.0);
        let total = (duration_seconds * sample_rate as f64) as usize;
        if total == 0 {
            self.position = target;
            self.cancel();
            return;
        }
        self.active = true;
        self.start_position = self.position;
        self.target_position = target;
        self.total_frames = total;
        self.remaining_frames = total;
    }

    /// Advances the automation by one mixed chunk.
    pub fn advance(&mut self, frames: usize) {
        if !self.active {
            return;
        }
        self.remaining_frames = self.remaining_frames.saturating_sub(frames);
        if self.remaining_frames == 0 {
            self.position = self.target_position;
            self.active = false;
        } else {
            let progress = 1.0 - self.remaining_frames as f32 / self.total_frames as f32;
            self.position =
                self.start_position + (self.target_position - self.start_position) * progress;
        }
    }
}

/// Per-deck peak meters with an instant-attack, linear-release hold.
#[derive(Default)]
pub struct LevelMeterState {
    pub peaks: [f32; DECK_COUNT],
    pub peak_holds: [f32; DECK_COUNT],
    pub mic_level: f32,
}

impl LevelMeterState {
    pub fn update(&mut self, peaks: [f32; DECK_COUNT], frames: usize, decay_per_sec: f32) {
        let decay = decay_per_sec * frames as f32 / ENGINE_SAMPLE_RATE as f32;
        for deck in 0..DECK_COUNT {
            self.peaks[deck] = peaks[deck];
            if peaks[deck] >= self.peak_holds[deck] {
                self.peak_holds[deck] = peaks[deck];
            } else {
                self.peak_holds[deck] = (self.peak_holds[deck] - decay).max(peaks[deck]);
            }
        }
    }
}

/// Microphone capture state; frames arrive through an SPSC ring.
#[derive(Default)]
pub struct MicState {
    pub available: bool,
    pub enabled: bool,
    pub input: Option<rtrb::Consumer<f32>>,
}

/// Recording status as reflected into state snapshots.
pub struct RecordingStatus {
    pub phase: RecordingPhase,
    pub path: Option<String>,
    pub format: Option<RecordingFormat>,
    pub started_at: Option<Instant>,
    pub last_error: Option<String>,
    /// Kept after stop so the final byte count and writer completion are
    /// still observable once the producer side is gone.
    pub watch: Option<std::sync::Arc<super::recorder::RecorderShared>>,
}

impl Default for RecordingStatus {
    fn default() -> Self {
        Self {
            phase: RecordingPhase::Idle,
            path: None,
            format: None,
            started_at: None,
            last_error: None,
            watch: None,
        }
    }
}

/// Differential-snapshot bookkeeping.
pub struct SnapshotTracker {
    pub last: Option<EngineSnapshot>,
    pub last_emit: Option<Instant>,
    /// Set when a deck position change came from a seek command; cleared on
    /// the snapshot that reports it.
    pub seek_flags: [bool; DECK_COUNT],
}

impl Default for SnapshotTracker {
    fn default() -> Self {
        Self {
            last: None,
            last_emit: None,
            seek_flags: [false; DECK_COUNT],
        }
    }
}

/// Reusable mixer buffers; allocated once, owned by the engine state so the
/// audio callback never allocates on the steady path.
pub struct MixerScratch {
    pub deck_slices: [Vec<f32>; DECK_COUNT],
    pub mix: Vec<f32>,
    pub output: Vec<f32>,
}

impl MixerScratch {
    fn new(max_output_channels: usize) -> Self {
        Self {
            deck_slices: [
                vec![0.0; FRAMES_PER_CHUNK * ENGINE_CHANNELS],
                vec![0.0; FRAMES_PER_CHUNK * ENGINE_CHANNELS],
            ],
            mix: vec![0.0; FRAMES_PER_CHUNK * ENGINE_CHANNELS],
            output: vec![0.0; FRAMES_PER_CHUNK * max_output_channels],
        }
    }

    pub fn ensure_output_channels(&mut self, channels: usize) {
        let needed = FRAMES_PER_CHUNK * channels;
        if self.output.len() != needed {
            self.output.resize(needed, 0.0);
        }
    }
}

/// The whole live audio state, held behind one short-lived lock.
pub struct EngineState {
    pub decks: [DeckState; DECK_COUNT],
    pub crossfade: CrossfadeState,
    pub levels: LevelMeterState,
    pub routing: ChannelRouting,
    pub output_channels: u16,
    pub device_name: Option<String>,
    pub master_tempo: f32,
    pub mic: MicState,
    pub recording: RecordingStatus,
    pub recorder: Option<RecorderHandle>,
    /// Frames mixed since boot; the engine's logical clock.
    pub frame_clock: u64,
    pub scratch: MixerScratch,
    pub snapshots: SnapshotTracker,
    pub events: UnboundedSender<EngineEvent>,
}

impl EngineState {
    pub fn new(events: UnboundedSender<EngineEvent>) -> Self {
        Self {
            decks: [DeckState::new(), DeckState::new()],
            crossfade: CrossfadeState::default(),
            levels: LevelMeterState::default(),
            routing: ChannelRouting::default(),
            output_channels: ENGINE_CHANNELS as u16,
            device_name: None,
            master_tempo: 120.0,
            mic: MicState::default(),
            recording: RecordingStatus::default(),
            recorder: None,
            frame_clock: 0,
            scratch: MixerScratch::new(ENGINE_CHANNELS),
            snapshots: SnapshotTracker::default(),
            events,
        }
    }

    pub fn set_master_tempo(&mut self, bpm: f32) {
        self.master_tempo = bpm.clamp(MASTER_TEMPO_MIN, MASTER_TEMPO_MAX);
    }

    pub fn emit(&self, event: EngineEvent) {
        // The receiver outlives the engine; a send failure just means the
        // control session is gone during shutdown.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::{TrackSection, TrackStructure};

    pub(crate) fn test_track(id: &str, seconds: usize, bpm: Option<f32>) -> LoadedTrack {
        let frames = ENGINE_SAMPLE_RATE as usize * seconds;
        LoadedTrack {
            info: TrackInfo {
                id: id.to_string(),
                title: id.to_string(),
                path: format!("/music/{id}.mp3"),
                duration_seconds: Some(seconds as f64),
                bpm,
                structure: None,
            },
            pcm: vec![0.1; frames * ENGINE_CHANNELS],
        }
    }

    #[test]
    fn play_requires_a_track() {
        let mut deck = DeckState::new();
        assert!(!deck.play());
        deck.load(test_track("t1", 2, None));
        assert!(deck.play());
        assert!(deck.playing);
    }

    #[test]
    fn seek_clamps_to_track_bounds() {
        let mut deck = DeckState::new();
        deck.load(test_track("t1", 2, None));
        deck.seek_fraction(2.0);
        assert_eq!(deck.position, deck.total_frames());
        deck.seek_fraction(-1.0);
        assert_eq!(deck.position, 0);
        deck.seek_fraction(0.5);
        assert_eq!(deck.position, deck.total_frames() / 2);
    }

    #[test]
    fn gain_is_clamped_to_engine_bounds() {
        let mut deck = DeckState::new();
        deck.set_gain(5.0);
        assert_eq!(deck.gain, DECK_GAIN_MAX);
        deck.set_gain(-1.0);
        assert_eq!(deck.gain, 0.0);
    }

    #[test]
    fn loop_without_grid_uses_master_tempo() {
        let mut deck = DeckState::new();
        deck.load(test_track("t1", 10, None));
        deck.position = ENGINE_SAMPLE_RATE as usize; // 1 s in
        deck.set_loop(4.0, 120.0);
        let region = deck.loop_region.expect("loop");
        assert_eq!(region.start_frame, ENGINE_SAMPLE_RATE as usize);
        // 4 beats at 120 bpm = 2 s.
        assert_eq!(
            region.end_frame - region.start_frame,
            ENGINE_SAMPLE_RATE as usize * 2
        );
    }

    #[test]
    fn loop_snaps_to_beat_grid() {
        let mut deck = DeckState::new();
        let mut track = test_track("t1", 10, Some(120.0));
        track.info.structure = Some(TrackStructure {
            bpm: 120.0,
            beats: (0..20).map(|i| i as f64 * 0.5).collect(),
            intro: TrackSection {
                start: 0.0,
                end: 2.0,
                beats: 4,
            },
            main: TrackSection {
                start: 2.0,
                end: 8.0,
                beats: 12,
            },
            outro: TrackSection {
                start: 8.0,
                end: 10.0,
                beats: 4,
            },
            hot_cues: vec![0.0, 2.0, 8.0],
        });
        deck.load(track);

        // 1.1 s is nearest the beat at 1.0 s.
        deck.position = (1.1 * ENGINE_SAMPLE_RATE as f64) as usize;
        deck.set_loop(4.0, 128.0);
        let region = deck.loop_region.expect("loop");
        assert_eq!(region.start_frame, ENGINE_SAMPLE_RATE as usize);
        assert_eq!(region.end_frame, ENGINE_SAMPLE_RATE as usize * 3);
    }

    #[test]
    fn loop_past_track_end_is_clipped() {
        let mut deck = DeckState::new();
        deck.load(test_track("t1", 2, None));
        deck.position = deck.total_frames() - 100;
        deck.set_loop(16.0, 60.0);
        let region = deck.loop_region.expect("loop");
        assert_eq!(region.end_frame, deck.total_frames());
    }

    #[test]
    fn manual_crossfader_move_cancels_automation() {
        let mut fade = CrossfadeState::default();
        fade.start(1.0, 4.0, ENGINE_SAMPLE_RATE);
        assert!(fade.active);
        fade.set_manual(0.3);
        assert!(!fade.active);
        assert_eq!(fade.position, 0.3);
    }

    #[test]
    fn automation_reaches_target_and_clears() {
        let mut fade = CrossfadeState::default();
        fade.start(1.0, 1.0, ENGINE_SAMPLE_RATE);
        let half = ENGINE_SAMPLE_RATE as usize / 2;
        fade.advance(half);
        assert!((fade.position - 0.5).abs() < 0.02);
        fade.advance(half);
        assert_eq!(fade.position, 1.0);
        assert!(!fade.active);
    }

    #[test]
    fn peak_hold_rises_instantly_and_decays_linearly() {
        let mut levels = LevelMeterState::default();
        levels.update([0.8, 0.0], ENGINE_SAMPLE_RATE as usize, 1.0);
        assert_eq!(levels.peak_holds[0], 0.8);

        // One second of silence decays the hold by 1.0 (floored at the peak).
        levels.update([0.3, 0.0], ENGINE_SAMPLE_RATE as usize, 1.0);
        assert_eq!(levels.peak_holds[0], 0.3);

        levels.update([0.0, 0.0], ENGINE_SAMPLE_RATE as usize / 10, 1.0);
        assert!((levels.peak_holds[0] - 0.2).abs() < 1e-6);
    }
}
