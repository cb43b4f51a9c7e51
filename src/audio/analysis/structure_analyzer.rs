use crate::audio::config::{DEFAULT_SECTION_BEATS, STRUCTURE_FRAME_SIZE, STRUCTURE_HOP_SIZE};
use crate::audio::types::{TrackSection, TrackStructure};

use super::bpm_analyzer::TempoAnalysis;

/// Partitions a track into intro/main/outro from its loudness envelope.
///
/// Boundaries snap to the beat; when no boundary survives the scan (or the
/// implied main section collapses), intro and outro fall back to 16 beats.
pub fn detect_structure(mono: &[f32], sample_rate: u32, tempo: &TempoAnalysis) -> TrackStructure {
    let duration = mono.len() as f64 / sample_rate as f64;
    let bpm = tempo.bpm as f64;
    let beat_duration = 60.0 / bpm;

    let envelope = rms_envelope(mono);
    let (intro_end, outro_start) =
        detect_section_boundaries(&envelope, sample_rate, beat_duration, duration);

    let intro_beats = (intro_end / beat_duration).round() as i32;
    let outro_beats = ((duration - outro_start) / beat_duration).round() as i32;
    let main_beats = ((outro_start - intro_end) / beat_duration).round() as i32;

    let mut hot_cues = vec![0.0, intro_end, outro_start];
    if duration > 120.0 {
        hot_cues.push((intro_end + outro_start) / 2.0);
    }
    hot_cues.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    hot_cues.dedup();

    TrackStructure {
        bpm,
        beats: tempo.beat_grid.clone(),
        intro: TrackSection {
            start: 0.0,
            end: intro_end,
            beats: intro_beats,
        },
        main: TrackSection {
            start: intro_end,
            end: outro_start,
            beats: main_beats,
        },
        outro: TrackSection {
            start: outro_start,
            end: duration,
            beats: outro_beats,
        },
        hot_cues,
    }
}

/// Smoothed RMS loudness envelope (4096-sample frames, 2048 hop, ±5 mean).
fn rms_envelope(mono: &[f32]) -> Vec<f32> {
    if mono.len() < STRUCTURE_FRAME_SIZE {
        return Vec::new();
    }
    let num_frames = (mono.len() - STRUCTURE_FRAME_SIZE) / STRUCTURE_HOP_SIZE;
    let mut energy = vec![0.0f32; num_frames];
    for (i, e) in energy.iter_mut().enumerate() {
        let start = i * STRUCTURE_HOP_SIZE;
        let sum: f32 = mono[start..start + STRUCTURE_FRAME_SIZE]
            .iter()
            .map(|s| s * s)
            .sum();
        *e = (sum / STRUCTURE_FRAME_SIZE as f32).sqrt();
    }

    let mut smoothed = vec![0.0f32; num_frames];
    for i in 0..num_frames {
        let lo = i.saturating_sub(5);
        let hi = (i + 6).min(num_frames);
        smoothed[i] = energy[lo..hi].iter().sum::<f32>() / (hi - lo) as f32;
    }
    smoothed
}

fn detect_section_boundaries(
    envelope: &[f32],
    sample_rate: u32,
    beat_duration: f64,
    duration: f64,
) -> (f64, f64) {
    let default_intro_end = (DEFAULT_SECTION_BEATS as f64 * beat_duration).min(duration / 2.0);
    let default_outro_start =
        (duration - DEFAULT_SECTION_BEATS as f64 * beat_duration).max(default_intro_end);

    if envelope.is_empty() {
        return (default_intro_end, default_outro_start);
    }

    let frames_per_sec = sample_rate as f64 / STRUCTURE_HOP_SIZE as f64;
    let mean: f32 = envelope.iter().sum::<f32>() / envelope.len() as f32;
    let snap = |t: f64| (t / beat_duration).round() * beat_duration;

    // Intro: first point in the opening 32 beats where the level jumps 1.5x
    // over five frames earlier and clears 0.8x of the track mean. The window
    // extends by the smoothing radius so a jump on the 32nd beat still lands.
    let intro_window =
        ((32.0 * beat_duration * frames_per_sec) as usize + 5).min(envelope.len());
    let mut intro_end = default_intro_end;
    for i in 5..intro_window {
        let current = envelope[i];
        let prior = envelope[i - 5];
        if current > prior * 1.5 && current > mean * 0.8 {
            intro_end = snap(i as f64 / frames_per_sec);
            break;
        }
    }

    // Outro: latest point in the closing 32 beats where the level five frames
    // later has fallen to 0.7x of the local level and under 0.6x of the mean.
    let outro_window = (32.0 * beat_duration * frames_per_sec) as usize + 5;
    let outro_scan_start = envelope.len().saturating_sub(outro_window);
    let mut outro_start = default_outro_start;
    for i in (outro_scan_start..envelope.len().saturating_sub(5)).rev() {
        let current = envelope[i];
        let later = envelope[i + 5];
        if later <= current * 0.7 && later <= mean * 0.6 {
            outro_start = snap(i as f64 / frames_per_sec);
            break;
        }
    }

    // A main section shorter than 8 beats means the scans latched onto noise.
    if outro_start - intro_end < 8.0 * beat_duration {
        intro_end = default_intro_end;
        outro_start = default_outro_start;
    }

    let intro_end = intro_end.clamp(0.0, duration);
    let outro_start = outro_start.clamp(intro_end, duration);
    (intro_end, outro_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::analysis::bpm_analyzer::TempoAnalysis;
    use crate::audio::config::ENGINE_SAMPLE_RATE;

    /// Quiet 32-beat intro, loud 64-beat main, fast-decaying 16-beat outro.
    fn synthetic_track(bpm: f64) -> Vec<f32> {
        let sr = ENGINE_SAMPLE_RATE as f64;
        let beat = 60.0 / bpm;
        let total_secs = 112.0 * beat;
        let intro_end = 32.0 * beat;
        let outro_start = 96.0 * beat;
        let n = (total_secs * sr) as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / sr;
                let tone = (2.0 * std::f64::consts::PI * 220.0 * t).sin();
                let amp = if t < intro_end {
                    0.05
                } else if t < outro_start {
                    0.8
                } else {
                    0.25 * (-(t - outro_start) / 2.0).exp()
                };
                (amp * tone) as f32
            })
            .collect()
    }

    fn tempo(bpm: f32, duration: f64) -> TempoAnalysis {
        let interval = 60.0 / bpm as f64;
        let beats = (0..)
            .map(|i| i as f64 * interval)
            .take_while(|t| *t < duration)
            .collect();
        TempoAnalysis {
            bpm,
            beat_grid: beats,
        }
    }

    #[test]
    fn sections_match_synthetic_envelope() {
        let audio = synthetic_track(120.0);
        let duration = audio.len() as f64 / ENGINE_SAMPLE_RATE as f64;
        let structure =
            detect_structure(&audio, ENGINE_SAMPLE_RATE, &tempo(120.0, duration));

        assert!(
            (structure.intro.beats - 32).abs() <= 2,
            "intro beats {}",
            structure.intro.beats
        );
        assert!(
            (structure.outro.beats - 16).abs() <= 2,
            "outro beats {}",
            structure.outro.beats
        );
    }

    #[test]
    fn sections_cover_track_exactly() {
        let audio = synthetic_track(120.0);
        let duration = audio.len() as f64 / ENGINE_SAMPLE_RATE as f64;
        let s = detect_structure(&audio, ENGINE_SAMPLE_RATE, &tempo(120.0, duration));

        assert_eq!(s.intro.start, 0.0);
        assert_eq!(s.intro.end, s.main.start);
        assert_eq!(s.main.end, s.outro.start);
        assert!((s.outro.end - duration).abs() < 1e-9);
        assert!(s.intro.end <= s.main.end);
    }

    #[test]
    fn short_flat_track_uses_default_sections() {
        // Uniform level: no boundary should be detected.
        let sr = ENGINE_SAMPLE_RATE as usize;
        let audio: Vec<f32> = (0..sr * 30)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 220.0 * i as f32 / sr as f32).sin())
            .collect();
        let duration = 30.0;
        let s = detect_structure(&audio, ENGINE_SAMPLE_RATE, &tempo(120.0, duration));
        assert_eq!(s.intro.beats, DEFAULT_SECTION_BEATS);
        assert_eq!(s.outro.beats, DEFAULT_SECTION_BEATS);
    }

    #[test]
    fn long_track_gains_midpoint_hot_cue() {
        let audio = synthetic_track(100.0); // 112 beats at 100 bpm = 67.2 s
        let duration = audio.len() as f64 / ENGINE_SAMPLE_RATE as f64;
        let s = detect_structure(&audio, ENGINE_SAMPLE_RATE, &tempo(100.0, duration));
        assert_eq!(s.hot_cues.len(), 3);

        // Stretch beyond 120 s by lowering the tempo far enough.
        let slow = synthetic_track(50.0); // 112 beats at 50 bpm = 134.4 s
        let slow_duration = slow.len() as f64 / ENGINE_SAMPLE_RATE as f64;
        let s = detect_structure(&slow, ENGINE_SAMPLE_RATE, &tempo(50.0, slow_duration));
        assert_eq!(s.hot_cues.len(), 4);
    }
}
