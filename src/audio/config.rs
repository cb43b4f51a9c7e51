// --- Engine Format Constants ---
pub const ENGINE_SAMPLE_RATE: u32 = 44_100;
pub const ENGINE_CHANNELS: usize = 2;
/// Frames produced by one mixer pass (~46 ms at 44.1 kHz).
pub const FRAMES_PER_CHUNK: usize = 2048;

// --- EQ Filter Constants ---
pub const LOW_CROSSOVER_HZ: f32 = 250.0;
pub const HIGH_CROSSOVER_HZ: f32 = 4000.0;
pub const BAND_Q_FACTOR: f32 = std::f32::consts::FRAC_1_SQRT_2;

// --- Analyzer Constants ---
pub const BPM_MIN: f32 = 60.0;
pub const BPM_MAX: f32 = 200.0;
/// Preferred tempo window used to resolve half/double ambiguity.
pub const BPM_PREFERRED_MIN: f32 = 100.0;
pub const BPM_PREFERRED_MAX: f32 = 140.0;
/// Minimum PCM length the analyzer will accept.
pub const ANALYSIS_MIN_SECONDS: f32 = 8.0;

/// Onset-envelope frame size for BPM analysis.
pub const ONSET_FRAME_SIZE: usize = 2048;
/// Hop size for the onset envelope.
pub const ONSET_HOP_SIZE: usize = 512;

/// RMS envelope frame size for structure analysis.
pub const STRUCTURE_FRAME_SIZE: usize = 4096;
/// Hop size for the RMS envelope.
pub const STRUCTURE_HOP_SIZE: usize = 2048;
/// Intro and outro default to this many beats when no boundary is found.
pub const DEFAULT_SECTION_BEATS: i32 = 16;

// --- Playback Bounds ---
pub const STRETCH_RATE_MIN: f32 = 0.5;
pub const STRETCH_RATE_MAX: f32 = 2.0;
pub const MASTER_TEMPO_MIN: f32 = 60.0;
pub const MASTER_TEMPO_MAX: f32 = 200.0;
pub const DECK_GAIN_MAX: f32 = 2.0;

// --- Event Rate Constants ---
/// Minimum interval between differential state snapshots.
pub const STATE_SNAPSHOT_INTERVAL_MS: u64 = 16;
/// Peak-hold decay in linear full-scale units per second.
pub const PEAK_HOLD_DECAY_PER_SEC: f32 = 1.0;
/// Device list poll cadence for hotplug detection.
pub const DEVICE_WATCH_INTERVAL_SECS: u64 = 2;

// --- Recorder Constants ---
/// Frames of master mix the recorder ring can hold before dropping (~3 s).
pub const RECORDER_RING_FRAMES: usize = 1 << 17;
/// Mic passthrough ring (~100 ms stereo).
pub const MIC_RING_FRAMES: usize = ENGINE_SAMPLE_RATE as usize / 10;

// --- Control Surface Constants ---
pub const DEFAULT_MCP_PORT: u16 = 8888;
/// Mono waveform fan-out chunk length (~1 s).
pub const WAVEFORM_CHUNK_FRAMES: usize = ENGINE_SAMPLE_RATE as usize;
/// wait_until_position poll interval.
pub const WAIT_POLL_INTERVAL_MS: u64 = 100;
/// wait_until_position single-call cap.
pub const WAIT_CAP_MS: u64 = 10_000;
