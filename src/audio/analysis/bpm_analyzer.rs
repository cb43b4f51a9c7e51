use rayon::prelude::*;
use rustfft::{FftPlanner, num_complex::Complex, num_traits::Zero};

use crate::audio::config::{
    BPM_MAX, BPM_MIN, BPM_PREFERRED_MAX, BPM_PREFERRED_MIN, ONSET_FRAME_SIZE, ONSET_HOP_SIZE,
};

/// Detected tempo plus the beat grid derived from it.
pub struct TempoAnalysis {
    pub bpm: f32,
    /// Strictly increasing beat timestamps in seconds.
    pub beat_grid: Vec<f64>,
}

/// Estimates tempo from a mono mixdown and lays a constant-interval beat grid
/// phase-aligned to the detected onsets.
pub fn analyze_bpm(mono: &[f32], sample_rate: u32) -> Option<TempoAnalysis> {
    let envelope = onset_envelope(mono);
    if envelope.is_empty() {
        return None;
    }

    let onset_rate = sample_rate as f32 / ONSET_HOP_SIZE as f32;
    let bpm = estimate_tempo(&envelope, onset_rate)?;

    let beat_interval = 60.0 / bpm as f64;
    let duration = mono.len() as f64 / sample_rate as f64;
    let first_beat = first_beat_phase(&envelope, onset_rate, beat_interval);

    let mut beat_grid = Vec::with_capacity((duration / beat_interval) as usize + 1);
    let mut pos = first_beat;
    while pos < duration {
        beat_grid.push(pos);
        pos += beat_interval;
    }

    Some(TempoAnalysis { bpm, beat_grid })
}

/// Frame-energy onset envelope: RMS per window, half-wave rectified
/// difference, ±3-frame boxcar smoothing, peak-normalized to [0, 1].
fn onset_envelope(mono: &[f32]) -> Vec<f32> {
    if mono.len() < ONSET_FRAME_SIZE {
        return Vec::new();
    }
    let num_frames = (mono.len() - ONSET_FRAME_SIZE) / ONSET_HOP_SIZE;
    if num_frames == 0 {
        return Vec::new();
    }

    let energies: Vec<f32> = (0..num_frames)
        .into_par_iter()
        .map(|i| {
            let start = i * ONSET_HOP_SIZE;
            let sum: f32 = mono[start..start + ONSET_FRAME_SIZE]
                .iter()
                .map(|s| s * s)
                .sum();
            (sum / ONSET_FRAME_SIZE as f32).sqrt()
        })
        .collect();

    let mut flux = vec![0.0f32; num_frames];
    for i in 1..num_frames {
        flux[i] = (energies[i] - energies[i - 1]).max(0.0);
    }

    let mut smoothed = vec![0.0f32; num_frames];
    for i in 0..num_frames {
        let lo = i.saturating_sub(3);
        let hi = (i + 4).min(num_frames);
        smoothed[i] = flux[lo..hi].iter().sum::<f32>() / (hi - lo) as f32;
    }

    let max = smoothed.par_iter().cloned().reduce(|| 0.0f32, f32::max);
    if max > 1e-6 {
        smoothed.par_iter_mut().for_each(|s| *s /= max);
    }
    smoothed
}

/// Autocorrelates the onset envelope over the musical lag range and picks the
/// tempo peak, preferring the common DJ range when harmonically related peaks
/// compete.
fn estimate_tempo(envelope: &[f32], onset_rate: f32) -> Option<f32> {
    let min_lag = ((60.0 / BPM_MAX) * onset_rate).floor() as usize;
    let max_lag = (((60.0 / BPM_MIN) * onset_rate).ceil() as usize).min(envelope.len() / 2);
    if min_lag == 0 || max_lag <= min_lag {
        return None;
    }

    let ac = autocorrelate(envelope, max_lag + 1);

    // Local maxima against both immediate and second neighbors.
    let mut peaks: Vec<(usize, f32)> = Vec::new();
    for lag in (min_lag.max(2))..max_lag.saturating_sub(2) {
        let c = ac[lag];
        if c > ac[lag - 1] && c > ac[lag + 1] && c > ac[lag - 2] && c > ac[lag + 2] {
            peaks.push((lag, c));
        }
    }

    let lag_to_bpm = |lag: usize| 60.0 * onset_rate / lag as f32;

    if peaks.is_empty() {
        // No structure in the autocorrelation; fall back to the global max.
        let (best_lag, best) = ac
            .iter()
            .enumerate()
            .skip(min_lag)
            .take(max_lag - min_lag + 1)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
        if *best <= 0.0 {
            return None;
        }
        return Some(refine_bpm(lag_to_bpm(best_lag)));
    }

    peaks.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut bpm = lag_to_bpm(peaks[0].0);
    for &(lag, corr) in peaks.iter().take(3).skip(1) {
        let candidate = lag_to_bpm(lag);
        let ratio = bpm / candidate;
        let harmonically_related = (ratio - 2.0).abs() < 0.1 || (ratio - 0.5).abs() < 0.1;
        let in_preferred = (BPM_PREFERRED_MIN..=BPM_PREFERRED_MAX).contains(&candidate);
        let out_of_preferred = !(BPM_PREFERRED_MIN..=BPM_PREFERRED_MAX).contains(&bpm);
        if harmonically_related && in_preferred && out_of_preferred && corr >= peaks[0].1 * 0.8 {
            bpm = candidate;
            break;
        }
    }

    Some(refine_bpm(bpm))
}

/// Rounds to an integer BPM and folds octave errors back into [80, 170].
fn refine_bpm(mut bpm: f32) -> f32 {
    if bpm < 80.0 {
        bpm *= 2.0;
    } else if bpm > 170.0 {
        bpm /= 2.0;
    }
    bpm.round().clamp(BPM_MIN, BPM_MAX)
}

/// FFT autocorrelation of `signal`, returned for lags `0..max_lag`.
fn autocorrelate(signal: &[f32], max_lag: usize) -> Vec<f32> {
    let n = (signal.len() + max_lag).next_power_of_two();
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    let ifft = planner.plan_fft_inverse(n);

    let mut buffer: Vec<Complex<f32>> = signal
        .iter()
        .map(|&x| Complex { re: x, im: 0.0 })
        .chain(std::iter::repeat(Complex::zero()).take(n - signal.len()))
        .collect();

    fft.process(&mut buffer);
    buffer.par_iter_mut().for_each(|c| *c = c.norm_sqr().into());
    ifft.process(&mut buffer);

    buffer[..max_lag.min(buffer.len())]
        .iter()
        .map(|c| c.re / n as f32)
        .collect()
}

/// Votes onset peaks into a phase histogram to place the first beat.
fn first_beat_phase(envelope: &[f32], onset_rate: f32, beat_interval: f64) -> f64 {
    const NUM_BINS: usize = 100;
    let threshold = 0.25;

    let mut histogram = [0.0f32; NUM_BINS];
    let mut voted = false;
    for i in 1..envelope.len().saturating_sub(1) {
        if envelope[i] > threshold && envelope[i] > envelope[i - 1] && envelope[i] > envelope[i + 1]
        {
            let t = i as f64 / onset_rate as f64;
            let phase = (t % beat_interval) / beat_interval;
            let bin = ((phase * NUM_BINS as f64) as usize).min(NUM_BINS - 1);
            histogram[bin] += envelope[i];
            voted = true;
        }
    }
    if !voted {
        return 0.0;
    }

    let best_bin = histogram
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let phase = (best_bin as f64 + 0.5) / NUM_BINS as f64 * beat_interval;
    if phase < beat_interval / 2.0 {
        phase
    } else {
        (phase - beat_interval).max(0.0)
    }
}
