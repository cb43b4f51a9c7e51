use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use std::num::{NonZeroU32, NonZeroU8};
use vorbis_rs::VorbisEncoder;

use crate::audio::config::{ENGINE_CHANNELS, ENGINE_SAMPLE_RATE, RECORDER_RING_FRAMES};
use crate::audio::errors::RecorderError;
use crate::audio::types::RecordingFormat;

/// State shared between the mix callback, the writer thread and snapshots.
pub struct RecorderShared {
    bytes_written: AtomicU64,
    finished: AtomicBool,
    error: parking_lot::Mutex<Option<String>>,
}

impl RecorderShared {
    fn new() -> Self {
        Self {
            bytes_written: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            error: parking_lot::Mutex::new(None),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn take_error(&self) -> Option<String> {
        self.error.try_lock().and_then(|mut e| e.take())
    }
}

/// The engine-held side of an active recording: the ring producer plus
/// drop accounting for backpressure reporting.
pub struct RecorderHandle {
    producer: rtrb::Producer<f32>,
    shared: Arc<RecorderShared>,
    dropped: u64,
    join: Option<JoinHandle<()>>,
}

impl RecorderHandle {
    /// Enqueues one chunk of master samples. Returns how many samples were
    /// dropped because the writer fell behind.
    pub fn push(&mut self, samples: &[f32]) -> u64 {
        let mut dropped_now = 0u64;
        for &sample in samples {
            if self.producer.push(sample).is_err() {
                dropped_now += 1;
            }
        }
        self.dropped += dropped_now;
        dropped_now
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped
    }

    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written()
    }

    pub fn take_error(&self) -> Option<String> {
        self.shared.take_error()
    }

    /// Signals end of input by dropping the producer; the writer drains the
    /// ring, finalizes the file and flips `finished` on the returned shared
    /// state.
    pub fn finish(mut self) -> (Arc<RecorderShared>, Option<JoinHandle<()>>) {
        drop(self.producer);
        (Arc::clone(&self.shared), self.join.take())
    }
}

trait TapWriter: Send {
    fn write_samples(&mut self, samples: &[f32]) -> Result<(), String>;
    fn finalize(self: Box<Self>) -> Result<(), String>;
}

/// RIFF/WAVE with an IEEE_FLOAT fmt chunk, 32-bit stereo.
struct WavTapWriter {
    writer: hound::WavWriter<BufWriter<File>>,
}

impl WavTapWriter {
    fn create(path: &Path) -> Result<Self, String> {
        let spec = hound::WavSpec {
            channels: ENGINE_CHANNELS as u16,
            sample_rate: ENGINE_SAMPLE_RATE,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| e.to_string())?;
        Ok(Self { writer })
    }
}

impl TapWriter for WavTapWriter {
    fn write_samples(&mut self, samples: &[f32]) -> Result<(), String> {
        for &sample in samples {
            self.writer
                .write_sample(sample)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<(), String> {
        self.writer.finalize().map_err(|e| e.to_string())
    }
}

struct OggTapWriter {
    encoder: VorbisEncoder<BufWriter<File>>,
    left: Vec<f32>,
    right: Vec<f32>,
}

impl OggTapWriter {
    fn create(path: &Path) -> Result<Self, String> {
        let file = File::create(path).map_err(|e| e.to_string())?;
        let sampling_frequency =
            NonZeroU32::new(ENGINE_SAMPLE_RATE).ok_or("invalid sample rate")?;
        let channels = NonZeroU8::new(ENGINE_CHANNELS as u8).ok_or("invalid channel count")?;
        let mut builder = vorbis_rs::VorbisEncoderBuilder::new_with_serial(
            sampling_frequency,
            channels,
            BufWriter::new(file),
            0,
        );
        let encoder = builder.build().map_err(|e| e.to_string())?;
        Ok(Self {
            encoder,
            left: Vec::new(),
            right: Vec::new(),
        })
    }
}

impl TapWriter for OggTapWriter {
    fn write_samples(&mut self, samples: &[f32]) -> Result<(), String> {
        // Interleaved stereo -> planar blocks.
        if samples.len() < 2 {
            return Ok(());
        }
        let frames = samples.len() / 2;
        self.left.clear();
        self.right.clear();
        for i in 0..frames {
            self.left.push(samples[i * 2]);
            self.right.push(samples[i * 2 + 1]);
        }
        let blocks: [&[f32]; 2] = [&self.left, &self.right];
        self.encoder
            .encode_audio_block(&blocks)
            .map_err(|e| e.to_string())
    }

    fn finalize(self: Box<Self>) -> Result<(), String> {
        self.encoder.finish().map(|_| ()).map_err(|e| e.to_string())
    }
}

/// Starts a recording: builds the SPSC ring and spawns the writer thread.
///
/// File creation happens on the writer thread, never on the caller; an open
/// failure surfaces through the shared error slot.
pub fn start(path: PathBuf, format: RecordingFormat) -> RecorderHandle {
    let (producer, consumer) =
        rtrb::RingBuffer::<f32>::new(RECORDER_RING_FRAMES * ENGINE_CHANNELS);
    let shared = Arc::new(RecorderShared::new());
    let writer_shared = Arc::clone(&shared);

    let join = thread::spawn(move || {
        writer_loop(path, format, consumer, writer_shared);
    });

    RecorderHandle {
        producer,
        shared,
        dropped: 0,
        join: Some(join),
    }
}

fn writer_loop(
    path: PathBuf,
    format: RecordingFormat,
    mut consumer: rtrb::Consumer<f32>,
    shared: Arc<RecorderShared>,
) {
    let fail = |message: String| {
        log::error!("Recorder: {}", message);
        *shared.error.lock() = Some(message);
        shared.finished.store(true, Ordering::Relaxed);
    };

    let mut writer: Box<dyn TapWriter> = match format {
        RecordingFormat::Wav => match WavTapWriter::create(&path) {
            Ok(w) => Box::new(w),
            Err(e) => return fail(format!("failed to create '{}': {}", path.display(), e)),
        },
        RecordingFormat::OggVorbis => match OggTapWriter::create(&path) {
            Ok(w) => Box::new(w),
            Err(e) => return fail(format!("failed to create '{}': {}", path.display(), e)),
        },
    };
    log::info!("Recorder: writing {:?} to '{}'", format, path.display());

    let mut batch = Vec::with_capacity(8192);
    loop {
        batch.clear();
        while batch.len() < batch.capacity() {
            match consumer.pop() {
                Ok(sample) => batch.push(sample),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            if let Err(e) = writer.write_samples(&batch) {
                return fail(format!("write failed for '{}': {}", path.display(), e));
            }
            if let Ok(meta) = std::fs::metadata(&path) {
                shared.bytes_written.store(meta.len(), Ordering::Relaxed);
            }
            continue;
        }

        if consumer.is_abandoned() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }

    if let Err(e) = writer.finalize() {
        return fail(format!("finalize failed for '{}': {}", path.display(), e));
    }
    if let Ok(meta) = std::fs::metadata(&path) {
        shared.bytes_written.store(meta.len(), Ordering::Relaxed);
    }
    shared.finished.store(true, Ordering::Relaxed);
    log::info!(
        "Recorder: finished '{}' ({} bytes)",
        path.display(),
        shared.bytes_written.load(Ordering::Relaxed)
    );
}

// --- Filename Generation ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenameStrategy {
    /// `YYYYMMDD-HHMMSS`, with a `-N` suffix on collision.
    Timestamp,
    /// `NNNN`, continuing from the highest existing number.
    Sequential,
}

/// Picks a fresh file path in `dir` for a new recording.
pub fn generate_recording_path(
    dir: &Path,
    strategy: FilenameStrategy,
    format: RecordingFormat,
) -> Result<PathBuf, RecorderError> {
    std::fs::create_dir_all(dir).map_err(|e| RecorderError::Create {
        path: dir.display().to_string(),
        source: e,
    })?;
    let ext = format.extension();

    let stem = match strategy {
        FilenameStrategy::Timestamp => {
            let now = time::OffsetDateTime::now_local()
                .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
            let fmt =
                time::macros::format_description!("[year][month][day]-[hour][minute][second]");
            now.format(&fmt)
                .unwrap_or_else(|_| format!("{}", now.unix_timestamp()))
        }
        FilenameStrategy::Sequential => {
            let next = next_sequence_number(dir, ext);
            format!("{:04}", next)
        }
    };

    let mut candidate = dir.join(format!("{}.{}", stem, ext));
    let mut suffix = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{}-{}.{}", stem, suffix, ext));
        suffix += 1;
    }
    Ok(candidate)
}

fn next_sequence_number(dir: &Path, ext: &str) -> u32 {
    let mut highest = 0u32;
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(&format!(".{}", ext)) else {
                continue;
            };
            if stem.len() == 4 {
                if let Ok(n) = stem.parse::<u32>() {
                    highest = highest.max(n);
                }
            }
        }
    }
    highest + 1
}
