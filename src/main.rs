use anyhow::Result;
use clap::{Arg, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use script_rewriter::{AppContext, Config, PipelineEvent, PipelineOutcome, PipelineRequest};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("Script Rewriter")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Turn a video into a rewritten short-video script")
        .arg(
            Arg::new("video")
                .short('i')
                .long("video")
                .value_name("FILE")
                .help("Video file to process")
                .required(true),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file (TOML)"),
        )
        .arg(
            Arg::new("audio-output")
                .short('a')
                .long("audio-output")
                .value_name("FILE")
                .help("Where to write the extracted audio"),
        )
        .arg(
            Arg::new("no-rewrite")
                .long("no-rewrite")
                .help("Stop after transcription")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("model")
                .short('m')
                .long("model")
                .value_name("NAME")
                .help("LLM model used for rewriting"),
        )
        .arg(
            Arg::new("whisper-model")
                .short('w')
                .long("whisper-model")
                .value_name("NAME")
                .help("Speech recognition model (tiny, base, small, medium, large)"),
        )
        .arg(
            Arg::new("style-prompt-file")
                .short('p')
                .long("style-prompt-file")
                .value_name("FILE")
                .help("File containing the rewriting style prompt"),
        )
        .arg(
            Arg::new("save")
                .short('s')
                .long("save")
                .help("Save the run report to the output directory")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let default_filter = if verbose {
        "script_rewriter=debug,info"
    } else {
        "script_rewriter=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let config = match matches.get_one::<String>("config") {
        Some(path) => Config::load_from(&PathBuf::from(path))?,
        None => Config::load().unwrap_or_else(|e| {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        }),
    };
    config.validate()?;
    if verbose {
        info!("{}", config.summary());
    }

    let system_prompt = match matches.get_one::<String>("style-prompt-file") {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };

    let request = PipelineRequest {
        video_path: matches
            .get_one::<String>("video")
            .map(PathBuf::from)
            .unwrap_or_default(),
        output_audio_path: matches.get_one::<String>("audio-output").map(PathBuf::from),
        skip_rewrite: matches.get_flag("no-rewrite"),
        whisper_model: matches.get_one::<String>("whisper-model").cloned(),
        model: matches.get_one::<String>("model").cloned(),
        system_prompt,
    };
    let keep_audio = request.output_audio_path.is_some();

    let context = AppContext::new(config.clone())?;
    let coordinator = Arc::new(context.coordinator());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut last_percent = None;
        while let Some(event) = rx.recv().await {
            match event {
                PipelineEvent::StageStarted(stage) => {
                    last_percent = None;
                    info!("▶️  {}", stage);
                }
                PipelineEvent::Progress { stage, percent, message } => {
                    if last_percent != Some(percent) {
                        last_percent = Some(percent);
                        info!("[{}] {:>3}% {}", stage, percent, message);
                    }
                }
                PipelineEvent::Status { stage, message } => info!("[{}] {}", stage, message),
            }
        }
    });

    let stopper = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("🛑 Interrupt received, stopping...");
                coordinator.stop().await;
            }
        })
    };

    let outcome = coordinator.process(request, tx).await;
    stopper.abort();
    let _ = printer.await;

    match outcome {
        PipelineOutcome::Completed(report) => {
            println!("{}", report.final_text());

            if matches.get_flag("save") || config.output.auto_save {
                report.save(&config.output.dir)?;
            }
            if config.audio.cleanup_temp_files && !keep_audio {
                context
                    .extractor()
                    .cleanup_temp_files(Some(&report.audio.audio_path))
                    .await?;
            }
            Ok(())
        }
        PipelineOutcome::Failed { stage, message } => {
            error!("❌ {} failed: {}", stage, message);
            std::process::exit(1);
        }
        PipelineOutcome::Cancelled { stage } => {
            warn!("🛑 Cancelled during {}", stage);
            std::process::exit(130);
        }
    }
}
