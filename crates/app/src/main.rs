use std::path::PathBuf;
use std::time::{Duration, Instant};

use audio_visualiser_core::{AppConfig, AudioVizError, FeatureSnapshot, SourceManager, SourceMode};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

fn main() -> audio_visualiser_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Mic { seconds } => run_mic(config, seconds, cli.json),
        Commands::File { path, seconds } => run_file(config, &path, seconds, cli.json),
    }
}

fn run_mic(config: AppConfig, seconds: f32, json: bool) -> audio_visualiser_core::Result<()> {
    tracing::info!("starting microphone mode");

    let mut sources = SourceManager::new(config);
    sources.connect_microphone()?;
    poll_features(&mut sources, seconds, json);
    sources.disconnect_audio();
    Ok(())
}

fn run_file(
    config: AppConfig,
    path: &PathBuf,
    seconds: f32,
    json: bool,
) -> audio_visualiser_core::Result<()> {
    tracing::info!(?path, "starting file mode");

    let mut sources = SourceManager::new(config);
    sources.connect_file(path.clone())?;

    // Wait out the background decode; the manager surfaces failures while
    // it keeps loading, so a stuck decode is reported rather than spun on.
    let deadline = Instant::now() + Duration::from_secs(30);
    while sources.playback().is_loading {
        sources.get_features();
        if let Some(e) = sources.last_error() {
            let message = e.to_string();
            sources.disconnect_audio();
            return Err(AudioVizError::msg(message));
        }
        if Instant::now() > deadline {
            sources.disconnect_audio();
            return Err(AudioVizError::msg("timed out waiting for the file to load"));
        }
        std::thread::sleep(Duration::from_millis(16));
    }

    poll_features(&mut sources, seconds, json);
    sources.disconnect_audio();
    Ok(())
}

/// Polls the feature snapshot at display cadence and prints it, standing in
/// for the renderer this engine normally feeds.
fn poll_features(sources: &mut SourceManager, seconds: f32, json: bool) {
    let deadline = Instant::now() + Duration::from_secs_f32(seconds.max(0.0));
    let mut last_print = Instant::now() - Duration::from_secs(1);

    while Instant::now() < deadline {
        let features = sources.get_features();

        if json {
            if let Ok(line) = serde_json::to_string(&features) {
                println!("{line}");
            }
        } else if features.is_beat || last_print.elapsed() >= Duration::from_millis(250) {
            print_meter(sources, &features);
            last_print = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(16));
    }
    if !json {
        println!();
    }
}

fn print_meter(sources: &SourceManager, features: &FeatureSnapshot) {
    let playback = sources.playback();
    let time = match sources.mode() {
        SourceMode::File => format!("{:6.1}s/{:6.1}s", playback.current_time, playback.duration),
        _ => "   live".to_string(),
    };
    println!(
        "{time}  bass {:5.2}  mid {:5.2}  treble {:5.2}{}",
        features.bass,
        features.mid,
        features.treble,
        if features.is_beat { "  BEAT" } else { "" }
    );
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio source & analysis engine demo", long_about = None)]
struct Cli {
    /// Optional JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit one JSON line per tick instead of the text meter.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyse the default capture device.
    Mic {
        /// How long to keep polling features, in seconds.
        #[arg(short, long, default_value_t = 30.0)]
        seconds: f32,
    },
    /// Play an audio file and analyse what is heard.
    File {
        /// Path to the audio file.
        path: PathBuf,
        /// How long to keep polling features, in seconds.
        #[arg(short, long, default_value_t = 30.0)]
        seconds: f32,
    },
}
