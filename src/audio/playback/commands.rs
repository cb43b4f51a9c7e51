use std::time::Instant;

use crate::audio::types::{EqBand, RecordingFormat, RecordingPhase};

use super::recorder::RecorderHandle;
use super::state::{DECK_COUNT, EngineState, LoadedTrack};

/// Mutations applied to the engine state between mixed chunks.
///
/// Commands arrive over an MPSC queue and are drained in arrival order at the
/// start of each device callback; everything heavy (decode, analysis, file
/// creation) has already happened on the control side, so applying a command
/// is allocation-free except for the moves it was handed.
pub enum EngineCommand {
    LoadTrack {
        deck: usize,
        track: Box<LoadedTrack>,
    },
    Play {
        deck: usize,
    },
    Stop {
        deck: usize,
    },
    Seek {
        deck: usize,
        fraction: f64,
    },
    SetCrossfader {
        position: f32,
    },
    StartCrossfade {
        target: Option<f32>,
        duration_seconds: f64,
    },
    SetMasterTempo {
        bpm: f32,
    },
    SetDeckGain {
        deck: usize,
        gain: f32,
    },
    SetDeckCue {
        deck: usize,
        enabled: bool,
    },
    SetEqCut {
        deck: usize,
        band: EqBand,
        enabled: bool,
    },
    SetBeatLoop {
        deck: usize,
        beats: f32,
    },
    ClearLoop {
        deck: usize,
    },
    SetMicInput {
        input: Option<rtrb::Consumer<f32>>,
    },
    StartRecording {
        handle: RecorderHandle,
        path: String,
        format: RecordingFormat,
    },
    StopRecording,
}

impl EngineCommand {
    /// Variant name for logging; commands carry bulk payloads that should
    /// never be formatted.
    pub fn name(&self) -> &'static str {
        match self {
            EngineCommand::LoadTrack { .. } => "loadTrack",
            EngineCommand::Play { .. } => "play",
            EngineCommand::Stop { .. } => "stop",
            EngineCommand::Seek { .. } => "seek",
            EngineCommand::SetCrossfader { .. } => "setCrossfader",
            EngineCommand::StartCrossfade { .. } => "startCrossfade",
            EngineCommand::SetMasterTempo { .. } => "setMasterTempo",
            EngineCommand::SetDeckGain { .. } => "setDeckGain",
            EngineCommand::SetDeckCue { .. } => "setDeckCue",
            EngineCommand::SetEqCut { .. } => "setEqCut",
            EngineCommand::SetBeatLoop { .. } => "setBeatLoop",
            EngineCommand::ClearLoop { .. } => "clearLoop",
            EngineCommand::SetMicInput { .. } => "setMicInput",
            EngineCommand::StartRecording { .. } => "startRecording",
            EngineCommand::StopRecording => "stopRecording",
        }
    }
}

fn deck_index(deck: usize) -> Option<usize> {
    (deck < DECK_COUNT).then_some(deck)
}

/// Applies one command to the live state.
pub fn apply(state: &mut EngineState, command: EngineCommand) {
    log::debug!("Engine: applying {}", command.name());
    match command {
        EngineCommand::LoadTrack { deck, track } => {
            let Some(deck) = deck_index(deck) else { return };
            state.decks[deck].load(*track);
        }
        EngineCommand::Play { deck } => {
            let Some(deck) = deck_index(deck) else { return };
            state.decks[deck].play();
        }
        EngineCommand::Stop { deck } => {
            let Some(deck) = deck_index(deck) else { return };
            state.decks[deck].stop();
        }
        EngineCommand::Seek { deck, fraction } => {
            let Some(deck) = deck_index(deck) else { return };
            state.decks[deck].seek_fraction(fraction);
            state.snapshots.seek_flags[deck] = true;
            // A seek is a manual intervention on the mix; a running automated
            // crossfade no longer reflects the operator's intent.
            state.crossfade.cancel();
        }
        EngineCommand::SetCrossfader { position } => {
            state.crossfade.set_manual(position);
        }
        EngineCommand::StartCrossfade {
            target,
            duration_seconds,
        } => {
            // Default target: fade away from whichever deck is live.
            let target = target.unwrap_or(if state.crossfade.position < 0.5 {
                1.0
            } else {
                0.0
            });
            state
                .crossfade
                .start(target, duration_seconds, crate::audio::config::ENGINE_SAMPLE_RATE);
        }
        EngineCommand::SetMasterTempo { bpm } => {
            // Snaps; the stretch FIFOs are not flushed and the step is
            // audible on the next chunk.
            state.set_master_tempo(bpm);
        }
        EngineCommand::SetDeckGain { deck, gain } => {
            let Some(deck) = deck_index(deck) else { return };
            state.decks[deck].set_gain(gain);
        }
        EngineCommand::SetDeckCue { deck, enabled } => {
            let Some(deck) = deck_index(deck) else { return };
            state.decks[deck].cue_enabled = enabled;
        }
        EngineCommand::SetEqCut {
            deck,
            band,
            enabled,
        } => {
            let Some(deck) = deck_index(deck) else { return };
            state.decks[deck].eq.set_cut(band, enabled);
        }
        EngineCommand::SetBeatLoop { deck, beats } => {
            let Some(deck) = deck_index(deck) else { return };
            let master = state.master_tempo;
            state.decks[deck].set_loop(beats, master);
        }
        EngineCommand::ClearLoop { deck } => {
            let Some(deck) = deck_index(deck) else { return };
            state.decks[deck].clear_loop();
        }
        EngineCommand::SetMicInput { input } => {
            state.mic.enabled = input.is_some();
            state.mic.available = state.mic.available || input.is_some();
            state.mic.input = input;
            if !state.mic.enabled {
                state.levels.mic_level = 0.0;
            }
        }
        EngineCommand::StartRecording {
            handle,
            path,
            format,
        } => {
            if state.recorder.is_some() {
                log::warn!("Engine: startRecording ignored; already recording");
                return;
            }
            state.recorder = Some(handle);
            state.recording.phase = RecordingPhase::Recording;
            state.recording.path = Some(path);
            state.recording.format = Some(format);
            state.recording.started_at = Some(Instant::now());
            state.recording.last_error = None;
            state.recording.watch = None;
        }
        EngineCommand::StopRecording => {
            if let Some(handle) = state.recorder.take() {
                state.recording.phase = RecordingPhase::Stopping;
                // Dropping the producer lets the writer drain and finalize;
                // the mixer watches `finished` and settles the state. The
                // writer blocks on disk, never on us, so it is detached.
                let (shared, join) = handle.finish();
                state.recording.watch = Some(shared);
                drop(join);
            } else {
                state.recording.phase = RecordingPhase::Idle;
            }
        }
    }
}
