//! eqmon: real-time earthquake notifications with spoken announcements.

mod config;
mod event;
mod feed;
mod player;
mod policy;
mod scale;
mod store;
mod voice;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{FeedEnv, Overrides};
use crate::player::{CommandPlayer, Player};
use crate::policy::{NotificationPolicy, PolicySettings};
use crate::scale::Scale;
use crate::store::{EventStore, JsonFileStore, NullStore};
use crate::voice::{Synthesizer, VoicevoxSynthesizer};

#[derive(Parser, Debug)]
#[command(name = "eqmon", about = "Earthquake feed receiver with voice alerts")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Feed environment (default: sandbox)
    #[arg(long, value_enum)]
    env: Option<FeedEnv>,

    /// Do not play sounds at or below this intensity (1 2 3 4 5- 5+ 6- 6+ 7)
    #[arg(long, value_parser = scale::parse_sign)]
    silent: Option<Scale>,

    /// Do not log received JSON payloads
    #[arg(short, long)]
    quiet: bool,

    /// Directory for stored events
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Do not store received events
    #[arg(long)]
    no_store: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging (suppress noisy transport internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,tungstenite=info,tokio_tungstenite=info,hyper=info,hyper_util=info,reqwest=info")
    } else {
        EnvFilter::new("info,tungstenite=warn,tokio_tungstenite=warn,hyper=warn,hyper_util=warn,reqwest=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("eqmon starting");

    let mut config = config::Config::load(args.config.as_deref());
    config.apply(Overrides {
        env: args.env,
        silent: args.silent,
        quiet: args.quiet,
        detect_areas: std::env::var("DETECT_AREA").ok(),
        data_dir: args.data_dir,
        no_store: args.no_store,
    });

    // Misconfiguration is fatal here, before anything connects
    let silent = config.notify.silent_scale()?;
    let url = config.feed.url()?.to_string();
    info!("Silent threshold: {:?}", silent.map(Scale::sign));
    info!("Detect areas: {:?}", config.notify.detect_areas);

    let player: Arc<dyn Player> = Arc::new(CommandPlayer::new(&config.player));
    let voice: Arc<dyn Synthesizer> = Arc::new(VoicevoxSynthesizer::new(&config.voice)?);
    let store: Arc<dyn EventStore> = if config.store.enabled {
        info!("Storing events under {}", config.store.data_dir.display());
        Arc::new(JsonFileStore::new(config.store.data_dir.clone()))
    } else {
        Arc::new(NullStore)
    };

    let settings = PolicySettings {
        silent,
        detect_areas: config.notify.detect_areas.clone(),
    };
    let policy = Arc::new(NotificationPolicy::new(settings, voice, player.clone()));

    let mut feed = feed::FeedConnection::new(
        url,
        config.feed.env.display_name(),
        config.feed.quiet,
        policy,
        store,
        player,
    );

    match feed.run(shutdown_signal()).await {
        Ok(state) => info!("Receiver stopped ({state})"),
        Err(e) => error!("Receiver stopped ({}): {e}", feed.state()),
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
