use std::fs::File;
use std::path::Path;

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{CODEC_TYPE_NULL, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use super::config::{ENGINE_CHANNELS, ENGINE_SAMPLE_RATE};
use super::errors::DecodeError;

/// Fully decoded track, resampled to the engine format.
pub struct DecodedAudio {
    /// Interleaved stereo f32 in [-1, 1] at the engine sample rate.
    pub pcm: Vec<f32>,
    /// Channel-averaged mono mixdown, same frame count as `pcm`.
    pub mono: Vec<f32>,
    /// Sample rate of the source file before resampling.
    pub native_sample_rate: u32,
    /// Channel count of the source file.
    pub native_channels: usize,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.pcm.len() / ENGINE_CHANNELS
    }

    pub fn duration_seconds(&self) -> f64 {
        self.frames() as f64 / ENGINE_SAMPLE_RATE as f64
    }
}

/// Decodes an entire audio file into engine-format PCM.
///
/// The whole file is decoded synchronously; callers run this off the audio
/// callback thread and hand the result to a deck by move. Rate conversion is
/// nearest-neighbor frame lookup, which is adequate for the common
/// 44.1/48 kHz cases this engine sees.
pub fn decode_file(path: &str) -> Result<DecodedAudio, DecodeError> {
    let file = File::open(path).map_err(|e| DecodeError::Io {
        path: path.to_string(),
        source: e,
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DecodeError::Unsupported {
            path: path.to_string(),
            source: e,
        })?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL && t.codec_params.sample_rate.is_some())
        .ok_or_else(|| DecodeError::NoSuitableTrack {
            path: path.to_string(),
        })?;
    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap_or(ENGINE_SAMPLE_RATE);
    let source_channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2);
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::DecoderCreation {
            path: path.to_string(),
            source: e,
        })?;

    let mut source_samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        match format.next_packet() {
            Ok(packet) => {
                if packet.track_id() != track_id {
                    continue;
                }
                match decoder.decode(&packet) {
                    Ok(audio_buf) => {
                        if sample_buf.is_none() {
                            sample_buf = Some(SampleBuffer::<f32>::new(
                                audio_buf.capacity() as u64,
                                *audio_buf.spec(),
                            ));
                        }
                        if let Some(buf) = sample_buf.as_mut() {
                            buf.copy_interleaved_ref(audio_buf);
                            source_samples.extend_from_slice(buf.samples());
                        }
                    }
                    Err(SymphoniaError::DecodeError(desc)) => {
                        log::warn!("Decode: ignoring bad packet in '{}': {}", path, desc);
                    }
                    Err(e) => {
                        return Err(DecodeError::FatalDecode {
                            path: path.to_string(),
                            source: e,
                        });
                    }
                }
            }
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                log::warn!("Decode: decoder reset required for '{}'; stopping early", path);
                break;
            }
            Err(e) => {
                return Err(DecodeError::Unsupported {
                    path: path.to_string(),
                    source: e,
                });
            }
        }
    }
    decoder.finalize();

    if source_samples.is_empty() {
        return Err(DecodeError::Empty {
            path: path.to_string(),
        });
    }

    let decoded = convert_to_engine_format(&source_samples, source_rate, source_channels);
    log::debug!(
        "Decode: '{}' -> {} frames at {} Hz (source {} Hz, {} ch)",
        path,
        decoded.frames(),
        ENGINE_SAMPLE_RATE,
        source_rate,
        source_channels
    );
    Ok(decoded)
}

/// Resamples and rechannels raw interleaved samples into stereo + mono.
fn convert_to_engine_format(
    source: &[f32],
    source_rate: u32,
    source_channels: usize,
) -> DecodedAudio {
    let source_channels = source_channels.max(1);
    let source_frames = source.len() / source_channels;
    let target_frames = if source_rate == ENGINE_SAMPLE_RATE {
        source_frames
    } else {
        (source_frames as f64 * ENGINE_SAMPLE_RATE as f64 / source_rate as f64) as usize
    };
    let ratio = source_rate as f64 / ENGINE_SAMPLE_RATE as f64;

    let mut pcm = vec![0.0f32; target_frames * ENGINE_CHANNELS];
    let mut mono = vec![0.0f32; target_frames];

    for frame in 0..target_frames {
        let src_frame = if source_rate == ENGINE_SAMPLE_RATE {
            frame
        } else {
            ((frame as f64 * ratio) as usize).min(source_frames.saturating_sub(1))
        };

        let mut mono_accum = 0.0f32;
        for ch in 0..ENGINE_CHANNELS {
            let src_ch = ch.min(source_channels - 1);
            let sample = source[src_frame * source_channels + src_ch].clamp(-1.0, 1.0);
            pcm[frame * ENGINE_CHANNELS + ch] = sample;
            mono_accum += sample;
        }
        mono[frame] = mono_accum / ENGINE_CHANNELS as f32;
    }

    DecodedAudio {
        pcm,
        mono,
        native_sample_rate: source_rate,
        native_channels: source_channels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_io_error() {
        let err = decode_file("/nonexistent/never.mp3").unwrap_err();
        assert!(matches!(err, DecodeError::Io { .. }));
    }

    #[test]
    fn conversion_downmixes_and_clamps() {
        // One stereo frame at the engine rate, hot on the left channel.
        let source = [1.5f32, -0.5];
        let out = convert_to_engine_format(&source, ENGINE_SAMPLE_RATE, 2);
        assert_eq!(out.frames(), 1);
        assert_eq!(out.pcm, vec![1.0, -0.5]);
        assert_eq!(out.mono, vec![0.25]);
    }

    #[test]
    fn conversion_resamples_by_frame_lookup() {
        // 4 mono frames at 2x the engine rate become 2 stereo frames.
        let source = [0.1f32, 0.2, 0.3, 0.4];
        let out = convert_to_engine_format(&source, ENGINE_SAMPLE_RATE * 2, 1);
        assert_eq!(out.frames(), 2);
        assert_eq!(out.pcm, vec![0.1, 0.1, 0.3, 0.3]);
    }
}
