use symphonia::core::errors::Error as SymphoniaError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Failed to open file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unsupported or unreadable format in '{path}': {source}")]
    Unsupported {
        path: String,
        #[source]
        source: SymphoniaError,
    },
    #[error("No suitable audio track in '{path}'")]
    NoSuitableTrack { path: String },
    #[error("Failed to create decoder for '{path}': {source}")]
    DecoderCreation {
        path: String,
        #[source]
        source: SymphoniaError,
    },
    #[error("Fatal decode error in '{path}': {source}")]
    FatalDecode {
        path: String,
        #[source]
        source: SymphoniaError,
    },
    #[error("No samples decoded from '{path}'")]
    Empty { path: String },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No output device available")]
    Unavailable,
    #[error("Device '{name}' rejected the requested configuration: {reason}")]
    ConfigRejected { name: String, reason: String },
    #[error("Failed to build output stream on '{name}': {reason}")]
    StreamBuild { name: String, reason: String },
    #[error("Failed to start output stream on '{name}': {reason}")]
    StreamStart { name: String, reason: String },
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recording already in progress")]
    AlreadyRecording,
    #[error("No recording in progress")]
    NotRecording,
    #[error("Failed to create '{path}': {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Encoder error for '{path}': {reason}")]
    Encode { path: String, reason: String },
    #[error("Recorder ring overflowed; {dropped} samples dropped")]
    Backpressure { dropped: u64 },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Deck {0} has no track loaded")]
    NoTrackLoaded(usize),
    #[error("Deck {0} is currently playing")]
    DeckBusy(usize),
    #[error("Invalid deck index {0}; decks are 1 and 2")]
    InvalidDeck(usize),
    #[error("Engine command channel is closed")]
    CommandChannelClosed,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Unknown track id '{0}'")]
    UnknownTrack(String),
    #[error("Unknown workspace '{0}'")]
    UnknownWorkspace(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Request timed out after {0} ms")]
    Timeout(u64),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),
}
