use soundtouch::{Setting, SoundTouch};

use super::config::{ENGINE_CHANNELS, FRAMES_PER_CHUNK};

/// Input slice fed to the stretch core per iteration; smaller slices keep the
/// reservoir (and therefore seek latency) short.
const FEED_FRAMES: usize = 1024;

/// Tempo changes below this threshold are absorbed without reconfiguring.
const TEMPO_EPSILON: f32 = 0.001;

/// Pitch-preserving tempo stretcher for one deck.
///
/// Wraps SoundTouch with an output reservoir: input is fed in fixed slices
/// until enough stretched output is buffered to satisfy the caller, and the
/// number of *input* frames consumed is reported back so the deck position
/// advances in source time, not output time.
pub struct TimeStretcher {
    core: SoundTouch,
    current_tempo: f32,
    /// Scratch for draining the core.
    receive_buffer: Vec<f32>,
    /// Stretched output not yet handed to the mixer (interleaved stereo).
    reservoir: Vec<f32>,
}

impl TimeStretcher {
    pub fn new(sample_rate: u32) -> Self {
        let mut core = SoundTouch::new();
        core.set_channels(ENGINE_CHANNELS as u32)
            .set_sample_rate(sample_rate)
            .set_tempo(1.0)
            .set_setting(Setting::UseQuickseek, 1);

        Self {
            core,
            current_tempo: 1.0,
            receive_buffer: vec![0.0; FRAMES_PER_CHUNK * ENGINE_CHANNELS * 2],
            reservoir: Vec::new(),
        }
    }

    /// Stretches `pcm` from `position` (frames) into `output`.
    ///
    /// Fills exactly `frames_out` frames of `output` (zero-padded past end of
    /// input), hard-clipping to [-1, 1], and returns the number of input
    /// frames consumed.
    pub fn process(
        &mut self,
        pcm: &[f32],
        position: usize,
        tempo: f32,
        frames_out: usize,
        output: &mut [f32],
    ) -> usize {
        let channels = ENGINE_CHANNELS;
        let total_frames = pcm.len() / channels;

        if (tempo - self.current_tempo).abs() > TEMPO_EPSILON {
            self.core.set_tempo(tempo as f64);
            self.current_tempo = tempo;
        }

        // Keep twice the requested output buffered so a tempo change cannot
        // starve the next chunk.
        let target_reservoir_frames = frames_out * 2;
        let mut frames_consumed = 0;

        while self.reservoir.len() / channels < target_reservoir_frames {
            let remaining = total_frames.saturating_sub(position + frames_consumed);
            if remaining == 0 {
                break;
            }
            let slice_frames = remaining.min(FEED_FRAMES);
            let start = (position + frames_consumed) * channels;
            let end = start + slice_frames * channels;
            self.core.put_samples(&pcm[start..end], slice_frames);
            frames_consumed += slice_frames;
            self.drain_core();
        }
        self.drain_core();

        let available_frames = self.reservoir.len() / channels;
        let copy_frames = available_frames.min(frames_out);
        let copy_samples = copy_frames * channels;
        for (out, &sample) in output[..copy_samples].iter_mut().zip(&self.reservoir) {
            *out = sample.clamp(-1.0, 1.0);
        }
        self.reservoir.drain(..copy_samples);

        if copy_frames < frames_out {
            output[copy_samples..frames_out * channels].fill(0.0);
        }

        frames_consumed
    }

    /// Moves everything the core has finished into the reservoir.
    fn drain_core(&mut self) {
        let channels = ENGINE_CHANNELS;
        let buf_frames = self.receive_buffer.len() / channels;
        loop {
            let received = self.core.receive_samples(&mut self.receive_buffer, buf_frames);
            if received == 0 {
                break;
            }
            self.reservoir
                .extend_from_slice(&self.receive_buffer[..received * channels]);
        }
    }

    /// Discards all buffered input and output. Called on load and seek.
    pub fn reset(&mut self) {
        self.core.clear();
        self.reservoir.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::config::ENGINE_SAMPLE_RATE;

    fn tone(frames: usize) -> Vec<f32> {
        (0..frames * ENGINE_CHANNELS)
            .map(|i| {
                let t = (i / ENGINE_CHANNELS) as f32 / ENGINE_SAMPLE_RATE as f32;
                0.5 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
            })
            .collect()
    }

    #[test]
    fn unity_tempo_fills_output_and_advances() {
        let pcm = tone(ENGINE_SAMPLE_RATE as usize); // 1 s
        let mut stretcher = TimeStretcher::new(ENGINE_SAMPLE_RATE);
        let mut out = vec![0.0f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS];

        let consumed = stretcher.process(&pcm, 0, 1.0, FRAMES_PER_CHUNK, &mut out);
        assert!(consumed > 0);
        assert!(out.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn exhausted_input_zero_pads() {
        let pcm = tone(64);
        let mut stretcher = TimeStretcher::new(ENGINE_SAMPLE_RATE);
        let mut out = vec![1.0f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS];

        let consumed = stretcher.process(&pcm, 0, 1.0, FRAMES_PER_CHUNK, &mut out);
        assert!(consumed <= 64);
        // The tail past the short input must be silence, not stale data.
        assert_eq!(out[FRAMES_PER_CHUNK * ENGINE_CHANNELS - 1], 0.0);
    }

    #[test]
    fn reset_discards_reservoir() {
        let pcm = tone(ENGINE_SAMPLE_RATE as usize);
        let mut stretcher = TimeStretcher::new(ENGINE_SAMPLE_RATE);
        let mut out = vec![0.0f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS];
        stretcher.process(&pcm, 0, 1.0, FRAMES_PER_CHUNK, &mut out);
        stretcher.reset();
        assert!(stretcher.reservoir.is_empty());
    }

    #[test]
    fn faster_tempo_consumes_more_input() {
        let pcm = tone(ENGINE_SAMPLE_RATE as usize * 4);
        let mut out = vec![0.0f32; FRAMES_PER_CHUNK * ENGINE_CHANNELS];

        let mut slow = TimeStretcher::new(ENGINE_SAMPLE_RATE);
        let mut fast = TimeStretcher::new(ENGINE_SAMPLE_RATE);
        let mut consumed_slow = 0;
        let mut consumed_fast = 0;
        for _ in 0..8 {
            consumed_slow += slow.process(&pcm, consumed_slow, 0.7, FRAMES_PER_CHUNK, &mut out);
            consumed_fast += fast.process(&pcm, consumed_fast, 1.6, FRAMES_PER_CHUNK, &mut out);
        }
        assert!(
            consumed_fast > consumed_slow,
            "fast {} <= slow {}",
            consumed_fast,
            consumed_slow
        );
    }
}
