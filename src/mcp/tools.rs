use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::audio::config::{WAIT_CAP_MS, WAIT_POLL_INTERVAL_MS};
use crate::audio::errors::ControlError;
use crate::audio::playback::events::{DeckSnapshot, EngineSnapshot};
use crate::audio::types::{EqBand, RecordingFormat};
use crate::control::ControlSession;
use crate::control::protocol::{ControlReply, ControlRequest, RequestEnvelope};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeckArg {
    deck: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadDeckArgs {
    track_id: String,
    deck: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeekDeckArgs {
    deck: usize,
    seconds: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrossfaderArgs {
    position: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerCrossfadeArgs {
    #[serde(default)]
    target: Option<f32>,
    duration: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EqCutArgs {
    deck: usize,
    band: EqBand,
    enabled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TempoArgs {
    bpm: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackIdArgs {
    track_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceArgs {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordingArgs {
    #[serde(default)]
    path: Option<String>,
    format: RecordingFormat,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct WaitArgs {
    pub deck: usize,
    #[serde(default)]
    pub remaining_seconds: Option<f64>,
    #[serde(default)]
    pub position_seconds: Option<f64>,
    #[serde(default)]
    pub elapsed_seconds: Option<f64>,
}

/// The position reference a wait resolves against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitTarget {
    Remaining(f64),
    Position(f64),
    Elapsed(f64),
}

/// Exactly one of the three time references must be supplied.
pub fn validate_wait_args(args: &WaitArgs) -> Result<WaitTarget, ControlError> {
    let supplied = [
        args.remaining_seconds.map(WaitTarget::Remaining),
        args.position_seconds.map(WaitTarget::Position),
        args.elapsed_seconds.map(WaitTarget::Elapsed),
    ];
    let mut present = supplied.into_iter().flatten();
    match (present.next(), present.next()) {
        (Some(target), None) => Ok(target),
        _ => Err(ControlError::InvalidArgument(
            "supply exactly one of remainingSeconds, positionSeconds, elapsedSeconds".to_string(),
        )),
    }
}

fn parse<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ControlError> {
    serde_json::from_value(args.clone())
        .map_err(|e| ControlError::InvalidArgument(e.to_string()))
}

fn deck_snapshot(snapshot: &EngineSnapshot, deck: usize) -> &DeckSnapshot {
    if deck == 1 {
        &snapshot.deck_a
    } else {
        &snapshot.deck_b
    }
}

fn reply_to_value(reply: ControlReply) -> Result<Value, ControlError> {
    match reply {
        ControlReply::Ok => Ok(json!({"ok": true})),
        ControlReply::State { state } => {
            serde_json::to_value(state).map_err(|e| ControlError::InvalidArgument(e.to_string()))
        }
        ControlReply::RecordingStarted { path } => Ok(json!({"ok": true, "path": path})),
        ControlReply::Failure { code, message } => Err(match code.as_str() {
            "invalidArgument" => ControlError::InvalidArgument(message),
            _ => ControlError::InvalidArgument(format!("{}: {}", code, message)),
        }),
    }
}

async fn forward(
    session: &Arc<ControlSession>,
    request: ControlRequest,
) -> Result<Value, ControlError> {
    let reply = session
        .handle_request(RequestEnvelope { id: None, request })
        .await;
    match reply.reply {
        ControlReply::Failure { code, message } => Err(failure_to_error(&code, message)),
        other => reply_to_value(other),
    }
}

fn failure_to_error(code: &str, message: String) -> ControlError {
    // The tool surface folds typed failures into its error envelope; keep the
    // code visible for the caller.
    ControlError::InvalidArgument(format!("{}: {}", code, message))
}

/// Runs one named tool against the session.
pub async fn dispatch(
    session: &Arc<ControlSession>,
    name: &str,
    args: &Value,
) -> Result<Value, ControlError> {
    match name {
        "list_workspaces" => Ok(json!({
            "workspaces": session.workspaces(),
            "selected": session.selected_workspace(),
        })),
        "select_workspace" => {
            let args: WorkspaceArgs = parse(args)?;
            session.select_workspace(&args.name)?;
            Ok(json!({"ok": true, "selected": args.name}))
        }
        "list_tracks" => {
            let tracks: Vec<Value> = session
                .tracks()
                .into_iter()
                .map(|t| {
                    json!({
                        "id": t.id,
                        "title": t.title,
                        "durationSeconds": t.duration_seconds,
                        "bpm": t.bpm,
                    })
                })
                .collect();
            Ok(json!({"tracks": tracks}))
        }
        "load_deck" => {
            let args: LoadDeckArgs = parse(args)?;
            let reply = session.load_track(args.deck, &args.track_id).await?;
            reply_to_value(reply)
        }
        "play_deck" => {
            let args: DeckArg = parse(args)?;
            forward(session, ControlRequest::Play { deck: args.deck }).await
        }
        "stop_deck" => {
            let args: DeckArg = parse(args)?;
            forward(session, ControlRequest::Stop { deck: args.deck }).await
        }
        "seek_deck" => {
            let args: SeekDeckArgs = parse(args)?;
            forward(
                session,
                ControlRequest::Seek {
                    deck: args.deck,
                    position_seconds: args.seconds,
                },
            )
            .await
        }
        "set_crossfader" => {
            let args: CrossfaderArgs = parse(args)?;
            if !(0.0..=1.0).contains(&args.position) {
                return Err(ControlError::InvalidArgument(format!(
                    "crossfader position {} outside 0..1",
                    args.position
                )));
            }
            forward(
                session,
                ControlRequest::SetCrossfader {
                    position: args.position,
                },
            )
            .await
        }
        "get_crossfader" => {
            let snapshot = session.snapshot();
            Ok(json!({
                "position": snapshot.crossfader_position,
                "isCrossfading": snapshot.is_crossfading,
            }))
        }
        "trigger_crossfade" => {
            let args: TriggerCrossfadeArgs = parse(args)?;
            forward(
                session,
                ControlRequest::StartCrossfade {
                    target: args.target,
                    duration_seconds: args.duration,
                },
            )
            .await
        }
        "get_deck_info" => {
            let args: DeckArg = parse(args)?;
            require_deck(args.deck)?;
            let snapshot = session.snapshot();
            let deck = deck_snapshot(&snapshot, args.deck);
            let track = session.loaded_track(args.deck - 1);
            Ok(json!({
                "deck": args.deck,
                "track": track,
                "playing": deck.playing,
                "positionSeconds": deck.position_seconds,
                "gain": deck.gain,
                "cueEnabled": deck.cue_enabled,
                "eqCuts": deck.eq_cuts,
                "loopActive": deck.loop_active,
            }))
        }
        "set_eq_cut" => {
            let args: EqCutArgs = parse(args)?;
            forward(
                session,
                ControlRequest::SetEqCut {
                    deck: args.deck,
                    band: args.band,
                    enabled: args.enabled,
                },
            )
            .await
        }
        "get_eq_state" => {
            let snapshot = session.snapshot();
            Ok(json!({
                "deck1": snapshot.deck_a.eq_cuts,
                "deck2": snapshot.deck_b.eq_cuts,
            }))
        }
        "get_master_tempo" => Ok(json!({"bpm": session.snapshot().master_tempo})),
        "set_master_tempo" => {
            let args: TempoArgs = parse(args)?;
            forward(session, ControlRequest::SetMasterTempo { bpm: args.bpm }).await
        }
        "get_track_structure" => {
            let args: TrackIdArgs = parse(args)?;
            let structure = session.track_structure(&args.track_id)?;
            serde_json::to_value(structure)
                .map_err(|e| ControlError::InvalidArgument(e.to_string()))
        }
        "get_playback_time_remaining" => {
            let args: DeckArg = parse(args)?;
            require_deck(args.deck)?;
            let snapshot = session.snapshot();
            let deck = deck_snapshot(&snapshot, args.deck);
            let remaining = remaining_seconds(deck);
            Ok(json!({
                "deck": args.deck,
                "remainingSeconds": remaining,
                "positionSeconds": deck.position_seconds,
            }))
        }
        "start_recording" => {
            let args: RecordingArgs = parse(args)?;
            forward(
                session,
                ControlRequest::StartRecording {
                    path: args.path,
                    format: args.format,
                },
            )
            .await
        }
        "stop_recording" => forward(session, ControlRequest::StopRecording).await,
        "wait_until_position" => {
            let args: WaitArgs = parse(args)?;
            require_deck(args.deck)?;
            let target = validate_wait_args(&args)?;
            wait_until_position(session, args.deck, target).await
        }
        other => Err(ControlError::InvalidArgument(format!(
            "unknown tool '{}'",
            other
        ))),
    }
}

fn require_deck(deck: usize) -> Result<(), ControlError> {
    if (1..=2).contains(&deck) {
        Ok(())
    } else {
        Err(ControlError::InvalidArgument(format!(
            "deck {} out of range; decks are 1 and 2",
            deck
        )))
    }
}

fn remaining_seconds(deck: &DeckSnapshot) -> Option<f64> {
    let duration = deck.track.as_ref().and_then(|t| t.duration_seconds)?;
    let position = deck.position_seconds?;
    Some((duration - position).max(0.0))
}

/// Polls engine state every 100 ms under a 10 s cap.
///
/// A timeout is not an error: the caller gets `reached: false` and is
/// expected to re-issue the wait.
async fn wait_until_position(
    session: &Arc<ControlSession>,
    deck: usize,
    target: WaitTarget,
) -> Result<Value, ControlError> {
    let start_snapshot = session.snapshot();
    let start_position = deck_snapshot(&start_snapshot, deck)
        .position_seconds
        .unwrap_or(0.0);

    let absolute_target = |snapshot_deck: &DeckSnapshot| -> Option<(bool, f64)> {
        let position = snapshot_deck.position_seconds?;
        match target {
            WaitTarget::Remaining(remaining) => {
                let duration = snapshot_deck.track.as_ref().and_then(|t| t.duration_seconds)?;
                Some((duration - position <= remaining, position))
            }
            WaitTarget::Position(absolute) => Some((position >= absolute, position)),
            WaitTarget::Elapsed(elapsed) => Some((position - start_position >= elapsed, position)),
        }
    };

    let poll = Duration::from_millis(WAIT_POLL_INTERVAL_MS);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(WAIT_CAP_MS);
    loop {
        let snapshot = session.snapshot();
        let snapshot_deck = deck_snapshot(&snapshot, deck);
        if let Some((reached, position)) = absolute_target(snapshot_deck) {
            if reached {
                return Ok(json!({
                    "reached": true,
                    "currentPosition": position,
                    "remaining": remaining_seconds(snapshot_deck),
                }));
            }
        }
        if tokio::time::Instant::now() >= deadline {
            let position = snapshot_deck.position_seconds;
            return Ok(json!({
                "reached": false,
                "currentPosition": position,
                "remaining": remaining_seconds(snapshot_deck),
            }));
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_args_require_exactly_one_reference() {
        let none = WaitArgs {
            deck: 1,
            remaining_seconds: None,
            position_seconds: None,
            elapsed_seconds: None,
        };
        assert!(validate_wait_args(&none).is_err());

        let two = WaitArgs {
            remaining_seconds: Some(5.0),
            position_seconds: Some(60.0),
            ..none
        };
        assert!(validate_wait_args(&two).is_err());

        let one = WaitArgs {
            remaining_seconds: Some(5.0),
            ..none
        };
        assert_eq!(
            validate_wait_args(&one).unwrap(),
            WaitTarget::Remaining(5.0)
        );
    }

    #[test]
    fn wait_args_parse_camel_case() {
        let args: WaitArgs =
            serde_json::from_value(json!({"deck": 1, "remainingSeconds": 5.0})).unwrap();
        assert_eq!(args.deck, 1);
        assert_eq!(args.remaining_seconds, Some(5.0));
        assert_eq!(args.position_seconds, None);
    }

    #[test]
    fn deck_bounds_are_validated() {
        assert!(require_deck(1).is_ok());
        assert!(require_deck(2).is_ok());
        assert!(require_deck(0).is_err());
        assert!(require_deck(3).is_err());
    }
}
