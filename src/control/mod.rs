pub mod protocol;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::audio::analysis;
use crate::audio::config::WAVEFORM_CHUNK_FRAMES;
use crate::audio::decoding;
use crate::audio::devices::DeviceWatcher;
use crate::audio::errors::{ControlError, EngineError, RecorderError};
use crate::audio::playback::AudioEngine;
use crate::audio::playback::commands::EngineCommand;
use crate::audio::playback::events::{EngineEvent, EngineSnapshot};
use crate::audio::playback::recorder::{self, FilenameStrategy};
use crate::audio::playback::state::{DECK_COUNT, LoadedTrack};
use crate::audio::types::{AudioConfig, RecordingFormat, RecordingPhase, TrackInfo, TrackStructure};
use crate::cache::StructureCache;
use crate::library::Library;

use protocol::{ControlEvent, ControlReply, ControlRequest, ReplyEnvelope, RequestEnvelope};

/// Default request/response timeout for quick control commands.
const REQUEST_TIMEOUT_MS: u64 = 5_000;
/// Broadcast depth for control events; laggy subscribers lose old events.
const EVENT_CHANNEL_DEPTH: usize = 512;

pub struct SessionConfig {
    pub music_dir: PathBuf,
    pub recording_dir: PathBuf,
    pub cache_path: PathBuf,
}

/// The control plane: owns the engine handle, the library, the structure
/// cache and the outbound event fan-out.
///
/// Decoding and analysis run on blocking worker threads; the audio callback
/// only ever receives finished PCM by move through the command queue.
pub struct ControlSession {
    engine: AudioEngine,
    library: Mutex<Library>,
    cache: Mutex<StructureCache>,
    events: broadcast::Sender<ControlEvent>,
    loaded: Mutex<[Option<TrackInfo>; DECK_COUNT]>,
    /// Bumped per deck load; stale waveform fan-outs notice and stop.
    waveform_epochs: [Arc<AtomicU64>; DECK_COUNT],
    recording_dir: PathBuf,
    _device_watcher: DeviceWatcher,
}

impl ControlSession {
    /// Builds the session and starts the event pump. Must run inside a tokio
    /// runtime.
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let (engine, engine_events) = AudioEngine::new();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);

        let watcher_events = engine.event_sender();
        let device_watcher = DeviceWatcher::spawn(move |count| {
            let _ = watcher_events.send(EngineEvent::DeviceChanged {
                output_devices: count,
            });
        });

        let session = Arc::new(Self {
            engine,
            library: Mutex::new(Library::new(config.music_dir)),
            cache: Mutex::new(StructureCache::open(config.cache_path)),
            events,
            loaded: Mutex::new([None, None]),
            waveform_epochs: [Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0))],
            recording_dir: config.recording_dir,
            _device_watcher: device_watcher,
        });

        tokio::spawn(pump_events(engine_events, session.events.clone()));
        session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.engine.snapshot()
    }

    /// Dispatches one protocol request, echoing its correlation id.
    pub async fn handle_request(&self, envelope: RequestEnvelope) -> ReplyEnvelope {
        let id = envelope.id;
        let result = match envelope.request {
            // Loads decode whole files and are exempt from the quick-command
            // timeout.
            ControlRequest::LoadTrack { deck, track_id } => {
                self.load_track(deck, &track_id).await
            }
            request => {
                match tokio::time::timeout(
                    Duration::from_millis(REQUEST_TIMEOUT_MS),
                    self.dispatch_quick(request),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ControlError::Timeout(REQUEST_TIMEOUT_MS)),
                }
            }
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("Control: request failed: {}", e);
                ControlReply::failure(error_code(&e), e.to_string())
            }
        };
        ReplyEnvelope { id, reply }
    }

    async fn dispatch_quick(&self, request: ControlRequest) -> Result<ControlReply, ControlError> {
        match request {
            ControlRequest::Init { audio_config }
            | ControlRequest::ApplyAudioConfig {
                config: audio_config,
            } => {
                self.engine
                    .configure(&audio_config)
                    .map_err(EngineError::from)?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::Cleanup => {
                self.engine.shutdown();
                Ok(ControlReply::Ok)
            }
            // Loads are routed before the timeout wrapper; reject a stray one
            // rather than decode under the quick-command deadline.
            ControlRequest::LoadTrack { .. } => Err(ControlError::InvalidArgument(
                "loadTrack must be dispatched as a load".to_string(),
            )),
            ControlRequest::Play { deck } => {
                let deck = deck_index(deck)?;
                self.require_track(deck)?;
                self.engine.send(EngineCommand::Play { deck })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::StartDeck { deck } => {
                let deck = deck_index(deck)?;
                self.require_track(deck)?;
                self.engine
                    .send(EngineCommand::Seek { deck, fraction: 0.0 })?;
                self.engine.send(EngineCommand::Play { deck })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::Stop { deck } => {
                let deck = deck_index(deck)?;
                self.engine.send(EngineCommand::Stop { deck })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::Seek {
                deck,
                position_seconds,
            } => {
                let deck = deck_index(deck)?;
                let fraction = self.seconds_to_fraction(deck, position_seconds)?;
                self.engine.send(EngineCommand::Seek { deck, fraction })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::SetCrossfader { position } => {
                self.engine
                    .send(EngineCommand::SetCrossfader { position })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::StartCrossfade {
                target,
                duration_seconds,
            } => {
                if duration_seconds < 0.0 || !duration_seconds.is_finite() {
                    return Err(ControlError::InvalidArgument(
                        "crossfade duration must be a non-negative number".to_string(),
                    ));
                }
                self.engine.send(EngineCommand::StartCrossfade {
                    target,
                    duration_seconds,
                })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::SetMasterTempo { bpm } => {
                if !(60.0..=200.0).contains(&bpm) {
                    return Err(ControlError::InvalidArgument(format!(
                        "master tempo {} outside 60..200",
                        bpm
                    )));
                }
                self.engine.send(EngineCommand::SetMasterTempo { bpm })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::SetDeckCue { deck, enabled } => {
                let deck = deck_index(deck)?;
                self.engine
                    .send(EngineCommand::SetDeckCue { deck, enabled })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::SetEqCut {
                deck,
                band,
                enabled,
            } => {
                let deck = deck_index(deck)?;
                self.engine.send(EngineCommand::SetEqCut {
                    deck,
                    band,
                    enabled,
                })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::SetDeckGain { deck, gain } => {
                let deck = deck_index(deck)?;
                if !(0.0..=2.0).contains(&gain) {
                    return Err(ControlError::InvalidArgument(format!(
                        "gain {} outside 0..2",
                        gain
                    )));
                }
                self.engine.send(EngineCommand::SetDeckGain { deck, gain })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::SetMicEnabled { enabled } => {
                self.engine.set_mic_enabled(enabled)?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::SetBeatLoop { deck, beats } => {
                let deck = deck_index(deck)?;
                if beats <= 0.0 || !beats.is_finite() {
                    return Err(ControlError::InvalidArgument(
                        "loop length must be a positive beat count".to_string(),
                    ));
                }
                self.engine.send(EngineCommand::SetBeatLoop { deck, beats })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::ClearLoop { deck } => {
                let deck = deck_index(deck)?;
                self.engine.send(EngineCommand::ClearLoop { deck })?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::StartRecording { path, format } => {
                self.start_recording(path, format)
            }
            ControlRequest::StopRecording => {
                if self.engine.snapshot().recording.phase == RecordingPhase::Idle {
                    return Err(EngineError::from(RecorderError::NotRecording).into());
                }
                self.engine.send(EngineCommand::StopRecording)?;
                Ok(ControlReply::Ok)
            }
            ControlRequest::GetState => Ok(ControlReply::State {
                state: self.engine.snapshot(),
            }),
        }
    }

    /// Decodes, analyzes (cache-first) and hands the PCM to the deck.
    pub async fn load_track(
        &self,
        deck: usize,
        track_id: &str,
    ) -> Result<ControlReply, ControlError> {
        let deck = deck_index(deck)?;

        let snapshot = self.engine.snapshot();
        let playing = match deck {
            0 => snapshot.deck_a.playing,
            _ => snapshot.deck_b.playing,
        };
        if playing {
            return Err(EngineError::DeckBusy(deck + 1).into());
        }

        let info = {
            let library = self.library.lock();
            let cache = self.cache.lock();
            library.find(track_id, &cache)?
        };
        let cached_structure = {
            let cache = self.cache.lock();
            cache.get(&info.id).cloned()
        };

        let path = info.path.clone();
        let needs_analysis = cached_structure.is_none();
        let decoded = tokio::task::spawn_blocking(move || {
            let decoded = decoding::decode_file(&path)?;
            let structure = if needs_analysis {
                analysis::analyze(&decoded.mono)
            } else {
                None
            };
            Ok::<_, ControlError>((decoded, structure))
        })
        .await
        .map_err(|e| ControlError::InvalidArgument(format!("decode task failed: {}", e)))??;
        let (decoded, fresh_structure) = decoded;

        let structure = match cached_structure {
            Some(structure) => Some(structure),
            None => {
                if let Some(structure) = fresh_structure.clone() {
                    let mut cache = self.cache.lock();
                    cache.insert(info.id.clone(), structure.clone());
                    if let Err(e) = cache.save() {
                        log::warn!("Control: structure cache save failed: {}", e);
                    }
                }
                fresh_structure
            }
        };

        let duration = decoded.duration_seconds();
        let info = TrackInfo {
            duration_seconds: Some(duration),
            bpm: structure.as_ref().map(|s| s.bpm as f32).or(info.bpm),
            structure: structure.clone(),
            ..info
        };

        if let Some(structure) = &structure {
            let _ = self.events.send(ControlEvent::TrackStructure {
                track_id: info.id.clone(),
                structure: structure.clone(),
            });
        }

        // A new load obsoletes any still-running waveform fan-out for the
        // previous track on this deck.
        let epoch = self.waveform_epochs[deck].fetch_add(1, Ordering::SeqCst) + 1;
        spawn_waveform_fanout(
            self.events.clone(),
            info.id.clone(),
            decoded.mono,
            epoch,
            Arc::clone(&self.waveform_epochs[deck]),
        );

        self.loaded.lock()[deck] = Some(info.clone());
        self.engine.send(EngineCommand::LoadTrack {
            deck,
            track: Box::new(LoadedTrack {
                info,
                pcm: decoded.pcm,
            }),
        })?;
        log::info!(
            "Control: loaded '{}' onto deck {} ({:.1}s)",
            track_id,
            deck + 1,
            duration
        );
        Ok(ControlReply::Ok)
    }

    fn start_recording(
        &self,
        path: Option<String>,
        format: RecordingFormat,
    ) -> Result<ControlReply, ControlError> {
        let phase = self.engine.snapshot().recording.phase;
        if matches!(phase, RecordingPhase::Recording | RecordingPhase::Preparing) {
            return Err(EngineError::from(RecorderError::AlreadyRecording).into());
        }

        let path = match path {
            Some(path) => PathBuf::from(path),
            None => recorder::generate_recording_path(
                &self.recording_dir,
                FilenameStrategy::Timestamp,
                format,
            )
            .map_err(EngineError::from)?,
        };
        let display = path.display().to_string();
        let handle = recorder::start(path, format);
        self.engine.send(EngineCommand::StartRecording {
            handle,
            path: display.clone(),
            format,
        })?;
        Ok(ControlReply::RecordingStarted { path: display })
    }

    // --- Library passthroughs for the tool surface ---

    pub fn workspaces(&self) -> Vec<String> {
        self.library.lock().workspaces()
    }

    pub fn select_workspace(&self, name: &str) -> Result<(), ControlError> {
        self.library.lock().select_workspace(name)
    }

    pub fn selected_workspace(&self) -> String {
        self.library.lock().selected_workspace().to_string()
    }

    pub fn tracks(&self) -> Vec<TrackInfo> {
        let library = self.library.lock();
        let cache = self.cache.lock();
        library.tracks(&cache)
    }

    pub fn loaded_track(&self, deck: usize) -> Option<TrackInfo> {
        self.loaded.lock().get(deck).and_then(|t| t.clone())
    }

    /// Structure for a track: from a loaded deck, the cache, or the library.
    pub fn track_structure(&self, track_id: &str) -> Result<TrackStructure, ControlError> {
        if let Some(structure) = self
            .loaded
            .lock()
            .iter()
            .flatten()
            .find(|t| t.id == track_id)
            .and_then(|t| t.structure.clone())
        {
            return Ok(structure);
        }
        if let Some(structure) = self.cache.lock().get(track_id).cloned() {
            return Ok(structure);
        }
        // Confirm the id at least resolves before reporting no analysis.
        let library = self.library.lock();
        let cache = self.cache.lock();
        library.find(track_id, &cache)?;
        Err(ControlError::InvalidArgument(format!(
            "track '{}' has not been analyzed yet; load it onto a deck first",
            track_id
        )))
    }

    fn require_track(&self, deck: usize) -> Result<(), ControlError> {
        if self.loaded.lock()[deck].is_none() {
            return Err(EngineError::NoTrackLoaded(deck + 1).into());
        }
        Ok(())
    }

    fn seconds_to_fraction(&self, deck: usize, seconds: f64) -> Result<f64, ControlError> {
        let duration = self.loaded.lock()[deck]
            .as_ref()
            .and_then(|t| t.duration_seconds)
            .ok_or(EngineError::NoTrackLoaded(deck + 1))?;
        if duration <= 0.0 {
            return Err(EngineError::NoTrackLoaded(deck + 1).into());
        }
        Ok((seconds / duration).clamp(0.0, 1.0))
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

/// External deck numbers are 1 and 2.
fn deck_index(deck: usize) -> Result<usize, ControlError> {
    if (1..=DECK_COUNT).contains(&deck) {
        Ok(deck - 1)
    } else {
        Err(EngineError::InvalidDeck(deck).into())
    }
}

fn error_code(error: &ControlError) -> &'static str {
    match error {
        ControlError::UnknownTrack(_) => "unknownTrack",
        ControlError::UnknownWorkspace(_) => "unknownWorkspace",
        ControlError::InvalidArgument(_) => "invalidArgument",
        ControlError::Timeout(_) => "commandTimeout",
        ControlError::Decode(e) => match e {
            crate::audio::errors::DecodeError::Io { .. } => "decodeIo",
            crate::audio::errors::DecodeError::Empty { .. } => "decodeEmpty",
            _ => "decodeUnsupported",
        },
        ControlError::Engine(e) => match e {
            EngineError::DeckBusy(_) => "deckBusy",
            EngineError::InvalidDeck(_) => "invalidArgument",
            EngineError::NoTrackLoaded(_) => "noTrackLoaded",
            EngineError::Device(_) => "deviceUnavailable",
            EngineError::Recorder(_) => "recorderError",
            EngineError::CommandChannelClosed => "engineGone",
        },
    }
}

async fn pump_events(
    mut engine_events: UnboundedReceiver<EngineEvent>,
    events: broadcast::Sender<ControlEvent>,
) {
    while let Some(event) = engine_events.recv().await {
        let event = match event {
            EngineEvent::StateChanged(delta) => ControlEvent::StateChanged { delta },
            EngineEvent::Levels(levels) => ControlEvent::LevelState { levels },
            EngineEvent::TrackEnded { deck } => ControlEvent::TrackEnded { deck: deck + 1 },
            EngineEvent::Error { context, message } => ControlEvent::Error { context, message },
            EngineEvent::RecordingError { message } => ControlEvent::RecordingError { message },
            EngineEvent::DeviceChanged { output_devices } => {
                ControlEvent::DeviceChanged { output_devices }
            }
        };
        // No subscribers is fine; events are fire-and-forget.
        let _ = events.send(event);
    }
    log::debug!("Control: engine event pump finished");
}

fn spawn_waveform_fanout(
    events: broadcast::Sender<ControlEvent>,
    track_id: String,
    mono: Vec<f32>,
    epoch: u64,
    epoch_slot: Arc<AtomicU64>,
) {
    let total_chunks = mono.len().div_ceil(WAVEFORM_CHUNK_FRAMES).max(1);

    tokio::spawn(async move {
        for (index, chunk) in mono.chunks(WAVEFORM_CHUNK_FRAMES).enumerate() {
            // A newer load on this deck obsoletes the remaining chunks.
            if epoch_slot.load(Ordering::SeqCst) != epoch {
                log::debug!("Control: waveform fan-out for '{}' cancelled", track_id);
                return;
            }
            let _ = events.send(ControlEvent::WaveformChunk {
                track_id: track_id.clone(),
                chunk_index: index,
                total_chunks,
                samples: chunk.to_vec(),
            });
            // Yield between chunks so a burst of loads cannot starve the
            // event loop.
            tokio::task::yield_now().await;
        }
        let _ = events.send(ControlEvent::WaveformComplete { track_id });
    });
}
