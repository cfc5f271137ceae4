use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use duplex_voice::audio::{
    default_input_device, default_output_device, list_audio_devices, CpalCaptureDevice, CpalOutputDevice,
    ResourceLifecycleManager, SessionState, StartOutcome, WebSocketTransport,
};
use duplex_voice::config::SessionConfig;

#[derive(Parser)]
#[command(name = "duplex-voice", version, about = "Live two-way voice conversation with a remote agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a conversation using the default microphone and speakers
    Run(RunArgs),
    /// List audio devices
    Devices,
}

#[derive(Args)]
struct RunArgs {
    /// JSON session config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, env = "DUPLEX_VOICE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "DUPLEX_VOICE_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "DUPLEX_VOICE_MODEL")]
    model: Option<String>,

    #[arg(long)]
    voice: Option<String>,

    #[arg(long)]
    input_device: Option<String>,

    #[arg(long)]
    output_device: Option<String>,

    #[arg(long)]
    activity_threshold: Option<f32>,
}

impl RunArgs {
    fn apply(self, config: &mut SessionConfig) {
        if let Some(api_key) = self.api_key {
            config.api_key = Some(api_key);
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(voice) = self.voice {
            config.voice_name = Some(voice);
        }
        if let Some(device) = self.input_device {
            config.input_device = Some(device);
        }
        if let Some(device) = self.output_device {
            config.output_device = Some(device);
        }
        if let Some(threshold) = self.activity_threshold {
            config.activity_threshold = threshold;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Devices => print_devices().await,
        Command::Run(args) => run(args).await,
    }
}

async fn print_devices() -> Result<()> {
    let default_input = default_input_device().ok();
    let default_output = default_output_device().ok();

    for device in list_audio_devices().await? {
        let is_default = Some(&device) == default_input.as_ref() || Some(&device) == default_output.as_ref();
        println!("{}{}", device, if is_default { " [default]" } else { "" });
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = SessionConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate().context("invalid session configuration")?;
    if config.api_key.is_none() {
        warn!("No API key configured; set DUPLEX_VOICE_API_KEY if the agent requires one");
    }

    let manager = ResourceLifecycleManager::new(
        config.clone(),
        Arc::new(CpalCaptureDevice::new(config.input_device.clone())),
        Arc::new(CpalOutputDevice::new(config.output_device.clone())),
        Arc::new(WebSocketTransport::new()),
    );
    let mut states = manager.subscribe_state();

    match manager.start_session().await.context("failed to start session")? {
        StartOutcome::Open => info!("Conversation live, press Ctrl-C to stop"),
        StartOutcome::Cancelled => return Ok(()),
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut last_activity = manager.activity();

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received, ending conversation");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() || *states.borrow() == SessionState::Idle {
                    break;
                }
            }
            _ = ticker.tick() => {
                let activity = manager.activity();
                if activity != last_activity {
                    println!(
                        "user: {:<8} agent: {}",
                        if activity.user_speaking { "speaking" } else { "-" },
                        if activity.agent_speaking { "speaking" } else { "-" },
                    );
                    last_activity = activity;
                }
            }
        }
    }

    manager.stop_session().await;

    let stats = manager.stats();
    info!(
        "Session finished: {} frames sent, {} chunks played, {} dropped, {} interruptions",
        stats.frames_sent, stats.chunks_scheduled, stats.chunks_dropped, stats.interruptions
    );

    match manager.last_error() {
        Some(error) => Err(anyhow::Error::new(error).context("session ended with an error")),
        None => Ok(()),
    }
}
