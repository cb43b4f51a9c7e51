pub mod commands;
pub mod events;
pub mod mixer;
pub mod recorder;
pub mod state;

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::config::{ENGINE_SAMPLE_RATE, FRAMES_PER_CHUNK, MIC_RING_FRAMES};
use super::devices::{self, OutputPlan};
use super::errors::{DeviceError, EngineError};
use super::types::AudioConfig;

use commands::EngineCommand;
use events::{EngineEvent, EngineSnapshot, snapshot_of};
use state::EngineState;

/// How long facade calls wait for the driver thread to answer.
const DRIVER_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests handled on the driver thread, which exclusively owns the device
/// streams (cpal streams never cross threads).
enum DriverRequest {
    Configure {
        config: AudioConfig,
        reply: Sender<Result<OutputPlan, DeviceError>>,
    },
    SetMicEnabled {
        enabled: bool,
        reply: Sender<Result<(), DeviceError>>,
    },
    Shutdown,
}

/// The audio engine: live state behind one lock, a command queue into the
/// device callback, and a driver thread owning the streams.
///
/// All mutation goes through [`AudioEngine::send`]; the device callback
/// drains pending commands at the start of each callback, mixes as many
/// fixed-size chunks as the device asks for, and never blocks on anything
/// but the short engine-held state lock.
pub struct AudioEngine {
    state: Arc<Mutex<EngineState>>,
    command_tx: Sender<EngineCommand>,
    events_tx: UnboundedSender<EngineEvent>,
    driver_tx: Sender<DriverRequest>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl AudioEngine {
    /// Creates the engine with no device attached yet; the paired receiver
    /// carries every engine event to the control session.
    pub fn new() -> (Self, UnboundedReceiver<EngineEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        let (command_tx, command_rx) = unbounded();
        let (driver_tx, driver_rx) = unbounded();
        let state = Arc::new(Mutex::new(EngineState::new(events_tx.clone())));

        let driver_state = Arc::clone(&state);
        let driver_command_rx = command_rx;
        let driver_command_tx = command_tx.clone();
        let driver = std::thread::Builder::new()
            .name("duodeck-driver".to_string())
            .spawn(move || {
                run_driver(
                    driver_state,
                    driver_command_rx,
                    driver_command_tx,
                    driver_rx,
                )
            })
            .ok();

        (
            Self {
                state,
                command_tx,
                events_tx,
                driver_tx,
                driver: Mutex::new(driver),
            },
            events_rx,
        )
    }

    pub fn event_sender(&self) -> UnboundedSender<EngineEvent> {
        self.events_tx.clone()
    }

    /// Negotiates a device for the requested configuration and (re)starts the
    /// output stream. Passing a new config at runtime swaps the stream with a
    /// brief silence; engine state (decks, positions) survives the swap.
    pub fn configure(&self, config: &AudioConfig) -> Result<OutputPlan, DeviceError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.driver_tx
            .send(DriverRequest::Configure {
                config: config.clone(),
                reply: reply_tx,
            })
            .map_err(|_| DeviceError::Unavailable)?;
        reply_rx
            .recv_timeout(DRIVER_REPLY_TIMEOUT)
            .map_err(|_| DeviceError::Unavailable)?
    }

    /// Queues a state mutation for the next callback.
    pub fn send(&self, command: EngineCommand) -> Result<(), EngineError> {
        self.command_tx
            .send(command)
            .map_err(|_| EngineError::CommandChannelClosed)
    }

    /// Full state snapshot, reflecting positions at the end of the most
    /// recently mixed callback.
    pub fn snapshot(&self) -> EngineSnapshot {
        snapshot_of(&self.state.lock())
    }

    /// Enables or disables microphone capture. The input stream feeds an
    /// SPSC ring that the mixer drains into the master mix.
    pub fn set_mic_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.driver_tx
            .send(DriverRequest::SetMicEnabled {
                enabled,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::CommandChannelClosed)?;
        reply_rx
            .recv_timeout(DRIVER_REPLY_TIMEOUT)
            .map_err(|_| EngineError::CommandChannelClosed)?
            .map_err(EngineError::from)
    }

    /// Stops the streams. Deck state survives until drop so a final
    /// `getState` still answers during teardown.
    pub fn shutdown(&self) {
        let _ = self.driver_tx.send(DriverRequest::Shutdown);
        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        let _ = self.driver_tx.send(DriverRequest::Shutdown);
        if let Some(handle) = self.driver.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Driver thread: exclusive owner of the cpal streams.
fn run_driver(
    state: Arc<Mutex<EngineState>>,
    command_rx: Receiver<EngineCommand>,
    command_tx: Sender<EngineCommand>,
    driver_rx: Receiver<DriverRequest>,
) {
    log::info!("Engine: driver thread started");
    let mut output_stream: Option<cpal::Stream> = None;
    let mut mic_stream: Option<cpal::Stream> = None;

    while let Ok(request) = driver_rx.recv() {
        match request {
            DriverRequest::Configure { config, reply } => {
                let result =
                    configure_device(&state, &command_rx, &config, &mut output_stream);
                let _ = reply.send(result);
            }
            DriverRequest::SetMicEnabled { enabled, reply } => {
                let result = set_mic_enabled(&command_tx, enabled, &mut mic_stream);
                let _ = reply.send(result);
            }
            DriverRequest::Shutdown => break,
        }
    }

    drop(mic_stream);
    drop(output_stream);
    log::info!("Engine: driver thread stopped");
}

fn configure_device(
    state: &Arc<Mutex<EngineState>>,
    command_rx: &Receiver<EngineCommand>,
    config: &AudioConfig,
    output_stream: &mut Option<cpal::Stream>,
) -> Result<OutputPlan, DeviceError> {
    let descriptors = devices::enumerate_outputs()?;
    let plan = devices::plan_output(&descriptors, config.device_id.as_deref(), config.routing)?;

    // Stop the old stream before the routing switch so no callback mixes
    // against a half-applied channel layout.
    if let Some(old) = output_stream.take() {
        if let Err(e) = old.pause() {
            log::warn!("Engine: failed to pause old stream: {}", e);
        }
    }

    let mic_available = cpal::default_host().default_input_device().is_some();
    {
        let mut state = state.lock();
        state.routing = plan.routing;
        state.output_channels = plan.channels;
        state.device_name = Some(plan.device_name.clone());
        state.mic.available = mic_available;
        state.scratch.ensure_output_channels(plan.channels as usize);
    }

    let stream = build_output_stream(&plan, Arc::clone(state), command_rx.clone())?;
    *output_stream = Some(stream);

    log::info!(
        "Engine: device '{}' configured with {} channels, main={:?} cue={:?}",
        plan.device_name,
        plan.channels,
        plan.routing.main,
        plan.routing.cue
    );
    Ok(plan)
}

fn set_mic_enabled(
    command_tx: &Sender<EngineCommand>,
    enabled: bool,
    mic_stream: &mut Option<cpal::Stream>,
) -> Result<(), DeviceError> {
    if !enabled {
        *mic_stream = None;
        let _ = command_tx.send(EngineCommand::SetMicInput { input: None });
        log::info!("Engine: mic disabled");
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(DeviceError::Unavailable)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let (mut producer, consumer) = rtrb::RingBuffer::<f32>::new(MIC_RING_FRAMES);
    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: SampleRate(ENGINE_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _| {
                for &sample in data {
                    // A full ring just drops mic frames; the mix goes on.
                    let _ = producer.push(sample);
                }
            },
            move |err| log::error!("Engine: mic stream error: {}", err),
            None,
        )
        .map_err(|e| DeviceError::StreamBuild {
            name: name.clone(),
            reason: e.to_string(),
        })?;
    stream.play().map_err(|e| DeviceError::StreamStart {
        name: name.clone(),
        reason: e.to_string(),
    })?;

    *mic_stream = Some(stream);
    let _ = command_tx.send(EngineCommand::SetMicInput {
        input: Some(consumer),
    });
    log::info!("Engine: mic enabled on '{}'", name);
    Ok(())
}

fn build_output_stream(
    plan: &OutputPlan,
    state: Arc<Mutex<EngineState>>,
    command_rx: Receiver<EngineCommand>,
) -> Result<cpal::Stream, DeviceError> {
    let device = devices::open_output(&plan.device_name)?;
    let name = plan.device_name.clone();

    let stream_config = StreamConfig {
        channels: plan.channels,
        sample_rate: SampleRate(ENGINE_SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let chunk_samples = FRAMES_PER_CHUNK * plan.channels as usize;
    let mut pending: VecDeque<f32> = VecDeque::with_capacity(chunk_samples * 4);
    let error_events = state.lock().events.clone();

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _| {
                let mut state = state.lock();

                // Commands apply in arrival order, before any mixing.
                for command in command_rx.try_iter() {
                    commands::apply(&mut state, command);
                }

                while pending.len() < data.len() {
                    let mixed = catch_unwind(AssertUnwindSafe(|| mixer::mix_chunk(&mut state)));
                    match mixed {
                        Ok(()) => pending.extend(state.scratch.output.iter().copied()),
                        Err(_) => {
                            // A panicking chunk becomes silence; playback
                            // carries on with the next chunk.
                            state.emit(EngineEvent::Error {
                                context: "mixer".to_string(),
                                message: "audio chunk panicked; replaced with silence"
                                    .to_string(),
                            });
                            pending.extend(std::iter::repeat(0.0).take(chunk_samples));
                        }
                    }
                }
                for sample in data.iter_mut() {
                    *sample = pending.pop_front().unwrap_or(0.0);
                }
            },
            move |err| {
                log::error!("Engine: output stream error: {}", err);
                let _ = error_events.send(EngineEvent::Error {
                    context: "device".to_string(),
                    message: err.to_string(),
                });
            },
            None,
        )
        .map_err(|e| DeviceError::StreamBuild {
            name: name.clone(),
            reason: e.to_string(),
        })?;

    stream.play().map_err(|e| DeviceError::StreamStart {
        name,
        reason: e.to_string(),
    })?;
    Ok(stream)
}
