use std::f32::consts::PI;
use std::time::Instant;

use crate::audio::config::{
    ENGINE_CHANNELS, FRAMES_PER_CHUNK, PEAK_HOLD_DECAY_PER_SEC, STATE_SNAPSHOT_INTERVAL_MS,
    STRETCH_RATE_MAX, STRETCH_RATE_MIN,
};
use crate::audio::types::{ChannelRouting, RecordingPhase};

use super::events::{EngineEvent, LevelSnapshot, diff_snapshots, snapshot_of};
use super::state::{DECK_COUNT, EngineState};

/// Equal-power crossfader gains for a position in [0, 1].
pub fn crossfader_gains(position: f32) -> (f32, f32) {
    let x = position.clamp(0.0, 1.0);
    ((x * PI / 2.0).cos(), (x * PI / 2.0).sin())
}

/// Stretch rate driving a deck toward the master tempo.
pub fn playback_rate(track_bpm: Option<f32>, master_tempo: f32) -> f32 {
    match track_bpm {
        Some(bpm) if bpm > 0.0 => {
            (master_tempo / bpm).clamp(STRETCH_RATE_MIN, STRETCH_RATE_MAX)
        }
        _ => 1.0,
    }
}

/// Mixes one fixed-size chunk into `state.scratch.output`.
///
/// Runs on the device callback thread with the state lock held; every buffer
/// it touches is pre-allocated. Command application has already happened for
/// this callback, so the chunk sees a consistent state.
pub fn mix_chunk(state: &mut EngineState) {
    let frames = FRAMES_PER_CHUNK;
    let samples = frames * ENGINE_CHANNELS;
    let master_tempo = state.master_tempo;
    let events = state.events.clone();

    // 1-3. Per deck: stretch (or silence), EQ kill, gain; track peaks.
    let mut peaks = [0.0f32; DECK_COUNT];
    for d in 0..DECK_COUNT {
        let deck = &mut state.decks[d];
        let slice = &mut state.scratch.deck_slices[d];

        if let (true, Some(track)) = (deck.playing, deck.track.as_ref()) {
            let rate = playback_rate(track.info.bpm, master_tempo);
            let consumed = deck
                .stretcher
                .process(&track.pcm, deck.position, rate, frames, slice);
            let total = track.total_frames();
            deck.position = (deck.position + consumed).min(total);

            match deck.loop_region {
                Some(region) => {
                    // Wrap at the chunk boundary once the read head passes
                    // the loop end.
                    if deck.position >= region.end_frame {
                        deck.position = region.start_frame;
                    }
                }
                None => {
                    if deck.position >= total {
                        deck.playing = false;
                        deck.position = 0;
                        deck.stretcher.reset();
                        let _ = events.send(EngineEvent::TrackEnded { deck: d });
                        log::info!("Mixer: deck {} reached end of track", d + 1);
                    }
                }
            }
        } else {
            slice[..samples].fill(0.0);
        }

        deck.eq.process(slice, frames);

        let gain = deck.gain;
        let mut peak = 0.0f32;
        for sample in slice[..samples].iter_mut() {
            *sample *= gain;
            peak = peak.max(sample.abs());
        }
        peaks[d] = peak;
    }

    // 4. Crossfader, including any frame-clocked automation.
    state.crossfade.advance(frames);
    let (gain_a, gain_b) = crossfader_gains(state.crossfade.position);

    // 5. Master mix plus mic, clipped to full scale.
    let mut mic_peak = 0.0f32;
    {
        let mix = &mut state.scratch.mix;
        let [deck_a, deck_b] = &state.scratch.deck_slices;
        for i in 0..samples {
            mix[i] = deck_a[i] * gain_a + deck_b[i] * gain_b;
        }
        if let Some(input) = state.mic.input.as_mut() {
            for frame in 0..frames {
                let sample = input.pop().unwrap_or(0.0);
                mic_peak = mic_peak.max(sample.abs());
                mix[frame * 2] += sample;
                mix[frame * 2 + 1] += sample;
            }
        }
        for sample in mix[..samples].iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }

    // 6. Meters.
    state
        .levels
        .update(peaks, frames, PEAK_HOLD_DECAY_PER_SEC);
    state.levels.mic_level = mic_peak;

    // 7. Recorder tap on the pre-routing master.
    tap_recorder(state, samples, &events);

    // 8. Route onto the device channel layout.
    let out_channels = state.output_channels as usize;
    state.scratch.ensure_output_channels(out_channels);
    let cue_enabled = [state.decks[0].cue_enabled, state.decks[1].cue_enabled];
    route_output(
        &state.scratch.mix,
        &state.scratch.deck_slices,
        &state.routing,
        cue_enabled,
        out_channels,
        frames,
        &mut state.scratch.output,
    );

    state.frame_clock += frames as u64;

    // 9. Level snapshot every chunk, differential state at most every 16 ms.
    let _ = events.send(EngineEvent::Levels(LevelSnapshot {
        deck_a_peak: state.levels.peaks[0],
        deck_b_peak: state.levels.peaks[1],
        deck_a_peak_hold: state.levels.peak_holds[0],
        deck_b_peak_hold: state.levels.peak_holds[1],
        mic_level: state.levels.mic_level,
    }));
    emit_state_delta(state, &events);
}

fn tap_recorder(
    state: &mut EngineState,
    samples: usize,
    events: &tokio::sync::mpsc::UnboundedSender<EngineEvent>,
) {
    if let Some(recorder) = state.recorder.as_mut() {
        let mix = &state.scratch.mix;
        let dropped = recorder.push(&mix[..samples]);
        if dropped > 0 && state.recording.phase == RecordingPhase::Recording {
            let message = crate::audio::errors::RecorderError::Backpressure {
                dropped: recorder.total_dropped(),
            }
            .to_string();
            log::error!("Mixer: {}", message);
            state.recording.phase = RecordingPhase::Error;
            state.recording.last_error = Some(message.clone());
            let _ = events.send(EngineEvent::RecordingError { message });
        }
        if let Some(message) = recorder.take_error() {
            state.recording.phase = RecordingPhase::Error;
            state.recording.last_error = Some(message.clone());
            let _ = events.send(EngineEvent::RecordingError { message });
        }
    } else if state.recording.phase == RecordingPhase::Stopping {
        if let Some(watch) = state.recording.watch.as_ref() {
            if watch.finished() {
                if let Some(message) = watch.take_error() {
                    state.recording.phase = RecordingPhase::Error;
                    state.recording.last_error = Some(message.clone());
                    let _ = events.send(EngineEvent::RecordingError { message });
                } else {
                    state.recording.phase = RecordingPhase::Idle;
                    log::info!(
                        "Mixer: recording stopped ({} bytes)",
                        watch.bytes_written()
                    );
                }
            }
        } else {
            state.recording.phase = RecordingPhase::Idle;
        }
    }
}

/// Lays the stereo master (and cue sum) onto an N-channel device frame.
///
/// Unrouted channels stay zero; a lone main index gets a mono downmix; the
/// cue bus carries the mean of the cue-enabled decks, pre-crossfader.
#[allow(clippy::too_many_arguments)]
pub fn route_output(
    mix: &[f32],
    deck_slices: &[Vec<f32>; DECK_COUNT],
    routing: &ChannelRouting,
    cue_enabled: [bool; DECK_COUNT],
    out_channels: usize,
    frames: usize,
    output: &mut [f32],
) {
    // Fast path: plain stereo with default routing and no cue monitoring.
    let default_stereo = out_channels == ENGINE_CHANNELS
        && routing.main == [Some(0), Some(1)]
        && routing.cue == [None, None];
    if default_stereo && !cue_enabled.iter().any(|&c| c) {
        output[..frames * 2].copy_from_slice(&mix[..frames * 2]);
        return;
    }

    output[..frames * out_channels].fill(0.0);
    let [main_l, main_r] = routing.main;
    let [cue_l, cue_r] = routing.cue;
    let cue_sources = cue_enabled.iter().filter(|&&c| c).count();
    let cue_norm = if cue_sources > 0 {
        1.0 / cue_sources as f32
    } else {
        0.0
    };

    for frame in 0..frames {
        let mix_base = frame * ENGINE_CHANNELS;
        let out_base = frame * out_channels;

        let left = mix[mix_base];
        let right = mix[mix_base + 1];
        let mono = (left + right) * 0.5;

        match (main_l, main_r) {
            (Some(l), Some(r)) => {
                output[out_base + l as usize] = left;
                output[out_base + r as usize] = right;
            }
            (Some(l), None) => output[out_base + l as usize] = mono,
            (None, Some(r)) => output[out_base + r as usize] = mono,
            (None, None) => {}
        }

        if cue_sources > 0 && (cue_l.is_some() || cue_r.is_some()) {
            let mut left = 0.0f32;
            let mut right = 0.0f32;
            for (deck, slice) in deck_slices.iter().enumerate() {
                if cue_enabled[deck] {
                    left += slice[mix_base];
                    right += slice[mix_base + 1];
                }
            }
            left = (left * cue_norm).clamp(-1.0, 1.0);
            right = (right * cue_norm).clamp(-1.0, 1.0);
            let mono = (left + right) * 0.5;

            match (cue_l, cue_r) {
                (Some(l), Some(r)) => {
                    output[out_base + l as usize] = left;
                    output[out_base + r as usize] = right;
                }
                (Some(l), None) => output[out_base + l as usize] = mono,
                (None, Some(r)) => output[out_base + r as usize] = mono,
                (None, None) => {}
            }
        }
    }
}

fn emit_state_delta(
    state: &mut EngineState,
    events: &tokio::sync::mpsc::UnboundedSender<EngineEvent>,
) {
    let now = Instant::now();
    let due = state
        .snapshots
        .last_emit
        .map(|last| now.duration_since(last).as_millis() as u64 >= STATE_SNAPSHOT_INTERVAL_MS)
        .unwrap_or(true);
    if !due {
        return;
    }

    let current = snapshot_of(state);
    let seek_flags = state.snapshots.seek_flags;
    if let Some(delta) = diff_snapshots(state.snapshots.last.as_ref(), &current, seek_flags) {
        let _ = events.send(EngineEvent::StateChanged(delta));
        state.snapshots.last = Some(current);
        state.snapshots.seek_flags = [false; DECK_COUNT];
    }
    state.snapshots.last_emit = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::config::ENGINE_SAMPLE_RATE;
    use crate::audio::playback::commands::{self, EngineCommand};
    use crate::audio::playback::state::{LoadedTrack, LoopRegion};
    use crate::audio::types::TrackInfo;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_state() -> (EngineState, UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (EngineState::new(tx), rx)
    }

    fn constant_track(id: &str, seconds: usize, level: f32, bpm: Option<f32>) -> LoadedTrack {
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
            pcm: vec![level; frames * ENGINE_CHANNELS],
        }
    }

    fn drain(rx: &mut UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn crossfader_curve_is_equal_power() {
        for i in 0..=100 {
            let x = i as f32 / 100.0;
            let (a, b) = crossfader_gains(x);
            assert!((a * a + b * b - 1.0).abs() < 1e-6, "x={x}");
        }
        assert_eq!(crossfader_gains(0.0).0, 1.0);
        assert!((crossfader_gains(1.0).1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn playback_rate_clamps_to_stretch_bounds() {
        assert_eq!(playback_rate(Some(128.0), 128.0), 1.0);
        assert!((playback_rate(Some(120.0), 130.0) - 130.0 / 120.0).abs() < 1e-6);
        assert_eq!(playback_rate(Some(200.0), 60.0), STRETCH_RATE_MIN);
        assert_eq!(playback_rate(Some(60.0), 200.0), STRETCH_RATE_MAX);
        assert_eq!(playback_rate(None, 130.0), 1.0);
    }

    #[test]
    fn playing_deck_reaches_the_master_output() {
        let (mut state, _rx) = test_state();
        state.decks[0].load(constant_track("a", 4, 0.5, None));
        state.decks[0].play();

        mix_chunk(&mut state);
        let rms: f32 = state.scratch.output.iter().map(|s| s * s).sum::<f32>()
            / state.scratch.output.len() as f32;
        assert!(rms > 0.0, "master output should be non-silent");
        assert!(state.decks[0].position > 0, "position should advance");
        assert!(state.scratch.output.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn position_is_monotonic_while_playing() {
        let (mut state, _rx) = test_state();
        state.decks[0].load(constant_track("a", 4, 0.5, None));
        state.decks[0].play();

        let mut last = 0usize;
        for _ in 0..10 {
            mix_chunk(&mut state);
            assert!(state.decks[0].position >= last);
            last = state.decks[0].position;
        }
    }

    #[test]
    fn end_of_track_stops_deck_and_emits_event() {
        let (mut state, mut rx) = test_state();
        // A track shorter than one chunk ends immediately.
        let mut track = constant_track("short", 1, 0.5, None);
        track.pcm.truncate(512 * ENGINE_CHANNELS);
        track.info.duration_seconds = Some(512.0 / ENGINE_SAMPLE_RATE as f64);
        state.decks[0].load(track);
        state.decks[0].play();

        mix_chunk(&mut state);
        assert!(!state.decks[0].playing);
        assert_eq!(state.decks[0].position, 0);
        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, EngineEvent::TrackEnded { deck: 0 })),
            "expected a track-ended event"
        );
    }

    #[test]
    fn loop_wraps_at_chunk_boundary() {
        let (mut state, _rx) = test_state();
        state.decks[0].load(constant_track("a", 4, 0.5, None));
        state.decks[0].play();
        let region = LoopRegion {
            start_frame: 0,
            end_frame: 1024,
            length_beats: 1.0,
        };
        state.decks[0].loop_region = Some(region);

        for _ in 0..8 {
            mix_chunk(&mut state);
            assert!(
                state.decks[0].position <= region.end_frame
                    || state.decks[0].position == region.start_frame,
                "position {} escaped the loop",
                state.decks[0].position
            );
        }
        assert!(state.decks[0].playing, "looping deck must keep playing");
    }

    #[test]
    fn crossfade_automation_lands_on_target() {
        let (mut state, _rx) = test_state();
        let chunk_secs = FRAMES_PER_CHUNK as f64 / ENGINE_SAMPLE_RATE as f64;
        let duration = chunk_secs * 10.0;
        commands::apply(
            &mut state,
            EngineCommand::StartCrossfade {
                target: Some(1.0),
                duration_seconds: duration,
            },
        );

        for _ in 0..5 {
            mix_chunk(&mut state);
        }
        assert!(
            (state.crossfade.position - 0.5).abs() < 0.02,
            "midway position {}",
            state.crossfade.position
        );
        for _ in 0..5 {
            mix_chunk(&mut state);
        }
        assert_eq!(state.crossfade.position, 1.0);
        assert!(!state.crossfade.active);
    }

    #[test]
    fn cue_bus_carries_only_cue_enabled_decks() {
        let deck_a = vec![0.4f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS];
        let deck_b = vec![0.8f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS];
        let mix = vec![0.4f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS];
        let routing = ChannelRouting {
            main: [Some(0), Some(1)],
            cue: [Some(2), Some(3)],
        };
        let mut output = vec![0.0f32; FRAMES_PER_CHUNK * 4];

        route_output(
            &mix,
            &[deck_a, deck_b],
            &routing,
            [false, true],
            4,
            FRAMES_PER_CHUNK,
            &mut output,
        );

        // Cue carries deck B only (single source, 1/1 normalization).
        assert_eq!(output[2], 0.8);
        assert_eq!(output[3], 0.8);
        assert_eq!(output[0], 0.4);
    }

    #[test]
    fn single_main_index_gets_mono_downmix() {
        let slices = [
            vec![0.0f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS],
            vec![0.0f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS],
        ];
        let mut mix = vec![0.0f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS];
        mix[0] = 0.6;
        mix[1] = 0.2;
        let routing = ChannelRouting {
            main: [Some(1), None],
            cue: [None, None],
        };
        let mut output = vec![0.0f32; FRAMES_PER_CHUNK * 2];

        route_output(
            &mix,
            &slices,
            &routing,
            [false, false],
            2,
            FRAMES_PER_CHUNK,
            &mut output,
        );
        assert_eq!(output[0], 0.0, "unrouted channel stays silent");
        assert!((output[1] - 0.4).abs() < 1e-6, "mono downmix of L/R");
    }

    #[test]
    fn seek_rides_exactly_one_delta_with_flag() {
        let (mut state, mut rx) = test_state();
        state.decks[0].load(constant_track("a", 10, 0.5, None));

        mix_chunk(&mut state); // settle the first full snapshot
        drain(&mut rx);

        commands::apply(
            &mut state,
            EngineCommand::Seek {
                deck: 0,
                fraction: 0.5,
            },
        );
        std::thread::sleep(std::time::Duration::from_millis(
            STATE_SNAPSHOT_INTERVAL_MS + 1,
        ));
        mix_chunk(&mut state);

        let deltas: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::StateChanged(delta) => Some(delta),
                _ => None,
            })
            .collect();
        assert_eq!(deltas.len(), 1);
        let deck_a = deltas[0].deck_a.as_ref().expect("deck delta");
        assert_eq!(deck_a.is_seek, Some(true));
        assert!((deck_a.position_seconds.unwrap() - 5.0).abs() < 0.05);

        // The following delta must not repeat the seek flag.
        std::thread::sleep(std::time::Duration::from_millis(
            STATE_SNAPSHOT_INTERVAL_MS + 1,
        ));
        commands::apply(&mut state, EngineCommand::SetMasterTempo { bpm: 100.0 });
        mix_chunk(&mut state);
        for delta in drain(&mut rx).into_iter().filter_map(|e| match e {
            EngineEvent::StateChanged(delta) => Some(delta),
            _ => None,
        }) {
            if let Some(deck_a) = delta.deck_a {
                assert_eq!(deck_a.is_seek, None);
            }
        }
    }

    #[test]
    fn crossfader_setting_round_trips_through_snapshots() {
        let (mut state, _rx) = test_state();
        commands::apply(&mut state, EngineCommand::SetCrossfader { position: 0.42 });
        let snapshot = crate::audio::playback::events::snapshot_of(&state);
        assert_eq!(snapshot.crossfader_position, 0.42);
        assert!(!snapshot.is_crossfading);
    }

    #[test]
    fn master_tempo_snaps_deck_rate_next_chunk() {
        let (mut state, _rx) = test_state();
        state.decks[0].load(constant_track("a", 10, 0.5, Some(120.0)));
        state.decks[0].play();
        commands::apply(&mut state, EngineCommand::SetMasterTempo { bpm: 130.0 });
        assert_eq!(state.master_tempo, 130.0);
        assert!((playback_rate(Some(120.0), state.master_tempo) - 1.0833).abs() < 1e-3);
        mix_chunk(&mut state);
        assert!(state.decks[0].position > 0);
    }
}
