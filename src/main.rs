use std::path::PathBuf;
use std::sync::Arc;

use duodeck::audio::config::DEFAULT_MCP_PORT;
use duodeck::audio::types::AudioConfig;
use duodeck::control::protocol::{ControlRequest, RequestEnvelope};
use duodeck::control::{ControlSession, SessionConfig};
use duodeck::mcp::server;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let port = match std::env::var("MCP_PORT") {
        Ok(value) => match value.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                log::error!("MCP_PORT '{}' is not a valid port", value);
                std::process::exit(2);
            }
        },
        Err(_) => DEFAULT_MCP_PORT,
    };

    let music_dir = std::env::var("DUODECK_MUSIC_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let recording_dir = music_dir.join("recordings");
    let cache_path = music_dir.join(".duodeck").join("structures.json");

    log::info!(
        "duodeck starting: music='{}' port={}",
        music_dir.display(),
        port
    );

    let session = ControlSession::new(SessionConfig {
        music_dir,
        recording_dir,
        cache_path,
    });

    // Attach the default device up front; a machine with no usable output is
    // a fatal start.
    let init = session
        .handle_request(RequestEnvelope {
            id: None,
            request: ControlRequest::Init {
                audio_config: AudioConfig::default(),
            },
        })
        .await;
    if let duodeck::control::protocol::ControlReply::Failure { code, message } = init.reply {
        log::error!("audio init failed ({}): {}", code, message);
        std::process::exit(1);
    }

    let serve = server::run_server(Arc::clone(&session), port).await;
    session.shutdown();
    if let Err(e) = serve {
        log::error!("tool server failed: {}", e);
        std::process::exit(1);
    }
}
