use anyhow::Result;
use clap::{Arg, ArgAction, Command as CliCommand};
use tokio::process::Command;
use tracing::info;

use script_rewriter::config::Config;
use script_rewriter::transcription::{model_info, recommend_model, Device, ModelDownloader, WhisperCliRuntime};
use script_rewriter::{AppContext, CancellationToken, ProgressReporter};

async fn tool_version(program: &str) -> Option<String> {
    let output = Command::new(program).arg("-version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).lines().next().map(str::to_string)
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = CliCommand::new("check-services")
        .about("Report on ffmpeg, whisper.cpp and the LLM service")
        .arg(
            Arg::new("download-model")
                .long("download-model")
                .value_name("NAME")
                .help("Download a whisper model into the model directory first"),
        )
        .arg(
            Arg::new("cleanup-models")
                .long("cleanup-models")
                .help("Delete model files other than the configured model")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    tracing_subscriber::fmt()
        .with_env_filter("script_rewriter=info,check_services=info")
        .init();

    let config = Config::load()?;

    if let Some(name) = matches.get_one::<String>("download-model") {
        let downloader = ModelDownloader::new(&config.whisper.download_url)?;
        let token = CancellationToken::new();
        let progress = ProgressReporter::silent(token.clone());
        let path = downloader
            .download(name, &config.whisper.model_dir, &token, &progress)
            .await?;
        info!("📦 Model ready: {}", path.display());
    }

    if matches.get_flag("cleanup-models") {
        let removed = WhisperCliRuntime::cleanup_models(&config.whisper.model_dir, &[config.whisper.model.as_str()])?;
        info!("🧹 Removed {} unused model(s)", removed.len());
    }

    info!("🔍 Checking external services...");

    for program in [&config.audio.ffmpeg_path, &config.audio.ffprobe_path] {
        match tool_version(program).await {
            Some(version) => info!("✅ {}: {}", program, version),
            None => info!("❌ {} not found", program),
        }
    }

    match config.whisper.binary.clone().or_else(WhisperCliRuntime::detect_binary) {
        Some(binary) => info!("✅ whisper.cpp binary: {}", binary),
        None => {
            info!("❌ No whisper.cpp binary found");
            info!("💡 Build whisper.cpp and put whisper-cli on PATH:");
            info!("   git clone https://github.com/ggerganov/whisper.cpp.git");
            info!("   cd whisper.cpp && make -j");
        }
    }

    let installed = WhisperCliRuntime::installed_models(&config.whisper.model_dir);
    if installed.is_empty() {
        info!("❌ No models in {}", config.whisper.model_dir.display());
    } else {
        info!("📋 Installed speech models:");
        for name in &installed {
            let description = model_info(name).map_or("", |m| m.description);
            info!("   - {} {}", name, description);
        }
    }

    let device = Device::resolve(config.whisper.device);
    info!("🖥️  Device: {} (recommended model: {})", device, recommend_model(device, None));

    let context = AppContext::new(config.clone())?;
    let report = context.rewriter().test_connection().await;
    if report.connected {
        info!("✅ LLM service at {}", config.llm.base_url);
        info!(
            "   - model {} {}",
            report.current_model,
            if report.model_available { "available" } else { "NOT installed" }
        );
        for name in &report.available_models {
            info!("   - {}", name);
        }
    } else {
        info!(
            "❌ LLM service unavailable: {}",
            report.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    info!("{}", config.summary());
    Ok(())
}
