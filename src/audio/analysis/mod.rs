pub mod bpm_analyzer;
pub mod structure_analyzer;

use crate::audio::config::{ANALYSIS_MIN_SECONDS, ENGINE_SAMPLE_RATE};
use crate::audio::types::TrackStructure;

/// Runs the full offline analysis pass over a mono mixdown.
///
/// Returns `None` when the PCM is too short to carry a stable tempo or when
/// no autocorrelation peak survives; callers treat that as "no grid, play at
/// native tempo".
pub fn analyze(mono: &[f32]) -> Option<TrackStructure> {
    let sample_rate = ENGINE_SAMPLE_RATE;
    if (mono.len() as f32) < ANALYSIS_MIN_SECONDS * sample_rate as f32 {
        log::debug!(
            "Analysis: {} samples is under the {}s minimum; skipping",
            mono.len(),
            ANALYSIS_MIN_SECONDS
        );
        return None;
    }

    let tempo = bpm_analyzer::analyze_bpm(mono, sample_rate)?;
    let structure = structure_analyzer::detect_structure(mono, sample_rate, &tempo);
    log::info!(
        "Analysis: bpm={} intro={}b main={}b outro={}b",
        structure.bpm,
        structure.intro.beats,
        structure.main.beats,
        structure.outro.beats
    );
    Some(structure)
}
