use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type};

use super::config::{BAND_Q_FACTOR, ENGINE_SAMPLE_RATE, HIGH_CROSSOVER_HZ, LOW_CROSSOVER_HZ};
use super::types::{EqBand, EqCutState};

/// Stereo pair of Direct-Form-I biquads sharing one coefficient set.
struct StereoBiquad {
    left: DirectForm1<f32>,
    right: DirectForm1<f32>,
}

impl StereoBiquad {
    fn new(coeffs: Coefficients<f32>) -> Self {
        Self {
            left: DirectForm1::<f32>::new(coeffs),
            right: DirectForm1::<f32>::new(coeffs),
        }
    }

    fn process_interleaved(&mut self, buffer: &mut [f32], frames: usize) {
        for i in 0..frames {
            buffer[i * 2] = self.left.run(buffer[i * 2]);
            buffer[i * 2 + 1] = self.right.run(buffer[i * 2 + 1]);
        }
    }
}

fn band_coefficients(filter: Type<f32>, f0: f32) -> Coefficients<f32> {
    Coefficients::<f32>::from_params(
        filter,
        (ENGINE_SAMPLE_RATE as f32).hz(),
        f0.hz(),
        BAND_Q_FACTOR,
    )
    .unwrap_or(Coefficients {
        // Unity passthrough; unreachable for the fixed crossover constants.
        a1: 0.0,
        a2: 0.0,
        b0: 1.0,
        b1: 0.0,
        b2: 0.0,
    })
}

/// DJ-style three-band kill EQ.
///
/// The signal is split into low (< 250 Hz), mid (250 Hz - 4 kHz) and high
/// (> 4 kHz) bands, each through two cascaded second-order sections per edge
/// for a steep slope. A killed band is simply dropped from the sum, so the
/// cut is total and engages at the next buffer boundary; filter state carries
/// across buffers.
pub struct EqKillProcessor {
    low_1: StereoBiquad,
    low_2: StereoBiquad,
    mid_high_pass_1: StereoBiquad,
    mid_high_pass_2: StereoBiquad,
    mid_low_pass_1: StereoBiquad,
    mid_low_pass_2: StereoBiquad,
    high_1: StereoBiquad,
    high_2: StereoBiquad,

    cuts: EqCutState,

    low_buffer: Vec<f32>,
    mid_buffer: Vec<f32>,
    high_buffer: Vec<f32>,
}

impl EqKillProcessor {
    pub fn new(max_frames: usize) -> Self {
        let low = band_coefficients(Type::LowPass, LOW_CROSSOVER_HZ);
        let mid_hp = band_coefficients(Type::HighPass, LOW_CROSSOVER_HZ);
        let mid_lp = band_coefficients(Type::LowPass, HIGH_CROSSOVER_HZ);
        let high = band_coefficients(Type::HighPass, HIGH_CROSSOVER_HZ);

        Self {
            low_1: StereoBiquad::new(low),
            low_2: StereoBiquad::new(low),
            mid_high_pass_1: StereoBiquad::new(mid_hp),
            mid_high_pass_2: StereoBiquad::new(mid_hp),
            mid_low_pass_1: StereoBiquad::new(mid_lp),
            mid_low_pass_2: StereoBiquad::new(mid_lp),
            high_1: StereoBiquad::new(high),
            high_2: StereoBiquad::new(high),
            cuts: EqCutState::default(),
            low_buffer: vec![0.0; max_frames * 2],
            mid_buffer: vec![0.0; max_frames * 2],
            high_buffer: vec![0.0; max_frames * 2],
        }
    }

    pub fn set_cut(&mut self, band: EqBand, enabled: bool) {
        match band {
            EqBand::Low => self.cuts.low = enabled,
            EqBand::Mid => self.cuts.mid = enabled,
            EqBand::High => self.cuts.high = enabled,
        }
    }

    pub fn cut_state(&self) -> EqCutState {
        self.cuts
    }

    /// Drops filter memory. Called when a deck loads a new track; the kill
    /// flags themselves persist.
    pub fn reset(&mut self) {
        let cuts = self.cuts;
        let max_frames = self.low_buffer.len() / 2;
        *self = EqKillProcessor::new(max_frames);
        self.cuts = cuts;
    }

    /// Applies the active kills to an interleaved stereo buffer in place.
    pub fn process(&mut self, buffer: &mut [f32], frames: usize) {
        let EqCutState { low, mid, high } = self.cuts;

        if !low && !mid && !high {
            return;
        }
        if low && mid && high {
            buffer[..frames * 2].fill(0.0);
            return;
        }

        let samples = frames * 2;
        self.low_buffer[..samples].copy_from_slice(&buffer[..samples]);
        self.mid_buffer[..samples].copy_from_slice(&buffer[..samples]);
        self.high_buffer[..samples].copy_from_slice(&buffer[..samples]);

        self.low_1.process_interleaved(&mut self.low_buffer, frames);
        self.low_2.process_interleaved(&mut self.low_buffer, frames);

        self.mid_high_pass_1
            .process_interleaved(&mut self.mid_buffer, frames);
        self.mid_high_pass_2
            .process_interleaved(&mut self.mid_buffer, frames);
        self.mid_low_pass_1
            .process_interleaved(&mut self.mid_buffer, frames);
        self.mid_low_pass_2
            .process_interleaved(&mut self.mid_buffer, frames);

        self.high_1
            .process_interleaved(&mut self.high_buffer, frames);
        self.high_2
            .process_interleaved(&mut self.high_buffer, frames);

        for i in 0..samples {
            buffer[i] = if low { 0.0 } else { self.low_buffer[i] }
                + if mid { 0.0 } else { self.mid_buffer[i] }
                + if high { 0.0 } else { self.high_buffer[i] };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::config::FRAMES_PER_CHUNK;

    fn stereo_tone(freq: f32, frames: usize) -> Vec<f32> {
        (0..frames)
            .flat_map(|i| {
                let t = i as f32 / ENGINE_SAMPLE_RATE as f32;
                let s = 0.5 * (2.0 * std::f32::consts::PI * freq * t).sin();
                [s, s]
            })
            .collect()
    }

    fn rms(buffer: &[f32]) -> f32 {
        (buffer.iter().map(|s| s * s).sum::<f32>() / buffer.len() as f32).sqrt()
    }

    #[test]
    fn no_kill_is_bitwise_passthrough() {
        let original = stereo_tone(440.0, FRAMES_PER_CHUNK);
        let mut buffer = original.clone();
        let mut eq = EqKillProcessor::new(FRAMES_PER_CHUNK);
        eq.process(&mut buffer, FRAMES_PER_CHUNK);
        assert_eq!(buffer, original);
    }

    #[test]
    fn mid_kill_drops_midband_tone_by_20_db() {
        let mut buffer = stereo_tone(1000.0, FRAMES_PER_CHUNK * 4);
        let reference = rms(&buffer);

        let mut eq = EqKillProcessor::new(FRAMES_PER_CHUNK * 4);
        eq.set_cut(EqBand::Mid, true);
        eq.process(&mut buffer, FRAMES_PER_CHUNK * 4);

        // Skip the first chunk so filter transients settle.
        let settled = rms(&buffer[FRAMES_PER_CHUNK * 2..]);
        let drop_db = 20.0 * (settled / reference).log10();
        assert!(drop_db <= -20.0, "mid kill only dropped {:.1} dB", drop_db);
    }

    #[test]
    fn all_kills_produce_silence() {
        let mut buffer = stereo_tone(440.0, FRAMES_PER_CHUNK);
        let mut eq = EqKillProcessor::new(FRAMES_PER_CHUNK);
        eq.set_cut(EqBand::Low, true);
        eq.set_cut(EqBand::Mid, true);
        eq.set_cut(EqBand::High, true);
        eq.process(&mut buffer, FRAMES_PER_CHUNK);
        assert!(buffer.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn double_kill_is_idempotent() {
        let mut eq = EqKillProcessor::new(FRAMES_PER_CHUNK);
        eq.set_cut(EqBand::High, true);
        eq.set_cut(EqBand::High, true);
        assert!(eq.cut_state().high);
        eq.set_cut(EqBand::High, false);
        assert_eq!(eq.cut_state(), EqCutState::default());
    }

    #[test]
    fn reset_preserves_cut_flags() {
        let mut eq = EqKillProcessor::new(FRAMES_PER_CHUNK);
        eq.set_cut(EqBand::Low, true);
        eq.reset();
        assert!(eq.cut_state().low);
    }
}
