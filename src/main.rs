//! SightAssist command line

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use image::RgbaImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sight_assist::app::{AssistApp, CycleOutcome, Engines};
use sight_assist::capture::NoCamera;
use sight_assist::config::{self, AppConfig};
use sight_assist::export;
use sight_assist::geometry::ViewRect;
use sight_assist::mode::Mode;
use sight_assist::overlay::{render_boxes, BoxStyle, ScreenBox};
use sight_assist::pipeline::aggregator::AggregatedResult;
use sight_assist::speech::{CommandSpeech, LogSpeech, SpeechEngine};
use sight_assist::vision::{
    Analyzer, ModelManager, ModelType, OnnxAnalyzer, OnnxRecognizer, Recognizer, ReplayAnalyzer,
    UnavailableRecognizer,
};

/// SightAssist - read signs and spot walkway damage aloud
#[derive(Parser, Debug)]
#[command(name = "sight-assist")]
#[command(about = "Detects signs or surface damage in images and reads the text inside aloud")]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run images through detection and recognition, clearing between each
    Analyze(AnalyzeArgs),
    /// Show model files, optionally downloading the public ones
    Models {
        #[arg(long)]
        download: bool,
    },
    /// Print the active configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        write_default: bool,
    },
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Images to analyze, in order
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Detection mode (overrides the config file)
    #[arg(short, long, value_enum)]
    mode: Option<Mode>,

    /// Run every image again after toggling to the other mode
    #[arg(long)]
    both_modes: bool,

    /// Feed the images as camera frames instead of uploads
    #[arg(long)]
    camera: bool,

    /// Replay recorded detections from a JSON file instead of running the detector
    #[arg(long)]
    detections: Option<PathBuf>,

    /// Write one JSON record per image into this directory instead of stdout
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Save copies of the images with the detected boxes drawn into this directory
    #[arg(long)]
    annotated_dir: Option<PathBuf>,

    /// Disable speech output
    #[arg(long)]
    no_speech: bool,

    /// Give up on an image after this many seconds
    #[arg(long, default_value = "60")]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG overrides the level
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };

    match cli.command {
        Command::Analyze(args) => run_analyze(&config_path, args),
        Command::Models { download } => run_models(download),
        Command::Config { write_default } => run_config(&config_path, write_default),
    }
}

fn run_analyze(config_path: &Path, args: AnalyzeArgs) -> Result<()> {
    let mut config = config::load_or_default(config_path);
    if let Some(mode) = args.mode {
        config.general.default_mode = mode;
    }

    let images = args
        .images
        .iter()
        .map(|path| {
            image::open(path)
                .with_context(|| format!("Failed to open image {:?}", path))
                .map(|image| image.to_rgba8())
        })
        .collect::<Result<Vec<RgbaImage>>>()?;

    for dir in [&args.out_dir, &args.annotated_dir].into_iter().flatten() {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }

    let manager = ModelManager::new()?;
    let analyzer: Box<dyn Analyzer> = match &args.detections {
        Some(path) => {
            info!("Replaying detections from {:?}", path);
            Box::new(ReplayAnalyzer::new(path.clone()))
        }
        None => Box::new(OnnxAnalyzer::new(config.detector.clone())),
    };
    let profiles_manager = manager.clone();

    let engines = Engines {
        analyzer,
        profiles: Box::new(move |mode| profiles_manager.profile_for(mode)),
        recognizer: load_recognizer(&manager, &config),
        speech: if args.no_speech { None } else { Some(speech_engine(&config)) },
        camera: Box::new(NoCamera),
    };

    let app = AssistApp::start(&config, engines)?;
    let timeout = Duration::from_secs(args.timeout_secs);
    let passes = if args.both_modes { 2 } else { 1 };

    for pass in 0..passes {
        if pass > 0 {
            let next = app.state().active_mode.toggled();
            app.toggle_mode();
            app.wait_for_mode(next, timeout)?;
        }
        let mode = app.state().active_mode;

        for (path, image) in args.images.iter().zip(&images) {
            if args.camera {
                app.capture(image.clone());
            } else {
                app.upload(image.clone());
            }

            let outcome = app.wait_for_cycle(timeout);
            // back to live before the next image, whatever happened
            app.clear();

            match outcome.with_context(|| format!("Failed to analyze {:?}", path))? {
                CycleOutcome::Record(result) => report(&args, &config, path, mode, image, &result)?,
                CycleOutcome::NothingDetected => {
                    println!("{} [{}]: nothing detected", path.display(), mode.display_name())
                }
            }
        }
    }

    // Dropping the app lets queued speech finish
    drop(app);
    Ok(())
}

/// Print or write one image's record, and its annotated copy
fn report(
    args: &AnalyzeArgs,
    config: &AppConfig,
    path: &Path,
    mode: Mode,
    image: &RgbaImage,
    result: &AggregatedResult,
) -> Result<()> {
    println!("{} [{}]:", path.display(), mode.display_name());
    println!("{}", result.summary());

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let name = format!("{}.{}", stem, mode.display_name().to_lowercase());

    match &args.out_dir {
        Some(dir) => {
            let out = dir.join(format!("{}.json", name));
            export::write_json(result, config.export.box_format, config.export.decimals, &out)?;
            info!("Wrote {} region(s) to {:?}", result.records.len(), out);
        }
        None => println!(
            "{}",
            export::to_json(result, config.export.box_format, config.export.decimals)?
        ),
    }

    if let Some(dir) = &args.annotated_dir {
        // crop boxes are already in image pixels
        let boxes: Vec<ScreenBox> = result
            .records
            .iter()
            .map(|record| ScreenBox {
                label: record.label.clone(),
                rect: ViewRect {
                    left: record.pixel_box.x1 as f32,
                    top: record.pixel_box.y1 as f32,
                    right: record.pixel_box.x2 as f32,
                    bottom: record.pixel_box.y2 as f32,
                },
            })
            .collect();
        let out = dir.join(format!("{}.png", name));
        render_boxes(image, &boxes, &BoxStyle::default())
            .save(&out)
            .with_context(|| format!("Failed to save annotated image {:?}", out))?;
        info!("Saved annotated image to {:?}", out);
    }
    Ok(())
}

/// Load the recognition model, or fall back to reporting every region as N/A
fn load_recognizer(manager: &ModelManager, config: &AppConfig) -> Arc<dyn Recognizer> {
    let loaded = manager.ensure_model(ModelType::Recognition).and_then(|model| {
        let dictionary = manager.ensure_model(ModelType::Dictionary)?;
        OnnxRecognizer::new(&model, &dictionary, config.recognition.clone())
    });

    match loaded {
        Ok(recognizer) => Arc::new(recognizer),
        Err(e) => {
            warn!("Text recognition unavailable: {:#}", e);
            Arc::new(UnavailableRecognizer)
        }
    }
}

fn speech_engine(config: &AppConfig) -> Box<dyn SpeechEngine> {
    match &config.speech.command {
        Some(program) => Box::new(CommandSpeech::new(program.clone())),
        None => Box::new(LogSpeech),
    }
}

fn run_models(download: bool) -> Result<()> {
    let manager = ModelManager::new()?;
    if download {
        manager.ensure_downloadable_models()?;
    }

    println!("Models in {:?}:", manager.models_dir());
    for status in manager.get_model_status() {
        let size = status
            .size_bytes
            .map(|bytes| format!("{} bytes", bytes))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<22} {:<9} {}",
            status.model_type.display_name(),
            if status.available { "ready" } else { "missing" },
            size
        );
    }

    for mode in [Mode::SignReading, Mode::SurfaceDamage] {
        if !manager.is_mode_ready(mode) {
            println!("{} mode is missing model files", mode.display_name());
        }
    }
    Ok(())
}

fn run_config(config_path: &Path, write_default: bool) -> Result<()> {
    if write_default {
        config::save_config(&AppConfig::default(), config_path)?;
        info!("Wrote default config to {:?}", config_path);
    }

    let config = config::load_or_default(config_path);
    println!("# {}", config_path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
