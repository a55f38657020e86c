//! Mandre - local LLM runner
//!
//! Loads a GGUF model (and optionally a vision projector), streams one
//! completion to stdout and cancels it on Ctrl-C.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mandre::inference::{EngineWorker, GenerationRequest, LlamaCppBackend, StreamToken, WorkerError};
use mandre::storage::settings;
use mandre::types::StatusCode;

#[derive(Parser, Debug)]
#[command(name = "mandre")]
#[command(about = "Run a local GGUF model with optional image input", version)]
struct Args {
    /// Path to the GGUF model
    #[arg(short, long)]
    model: PathBuf,

    /// Path to the multimodal projector (mmproj) GGUF
    #[arg(long)]
    mmproj: Option<PathBuf>,

    /// Image to attach to the prompt; needs --mmproj
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Inline JSON config update, e.g. '{"n_ctx": 4096}'
    #[arg(long)]
    config: Option<String>,

    /// Config file to load instead of the default location
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Write the effective config back to the config file
    #[arg(long)]
    save_config: bool,

    /// Prompt text
    prompt: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mandre=info")))
        .init();

    info!("Starting Mandre v{}", env!("CARGO_PKG_VERSION"));

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            // Exit code is the magnitude of the boundary status code
            ExitCode::from(e.status_code().unsigned_abs().min(255) as u8)
        }
    }
}

async fn run(args: Args) -> Result<(), WorkerError> {
    let worker = EngineWorker::spawn(|| LlamaCppBackend)?;

    let config_file = args
        .config_file
        .clone()
        .or_else(|| settings::config_path().ok());
    if let Some(path) = &config_file {
        match settings::load_config_json(path) {
            Ok(Some(json)) => worker.configure(&json)?,
            Ok(None) => {}
            Err(e) => warn!("Ignoring config file {}: {}", path.display(), e),
        }
    }
    if let Some(json) = &args.config {
        worker.configure(json)?;
    }
    if args.save_config {
        match &config_file {
            Some(path) => {
                if let Err(e) = settings::save_config(path, &worker.config()?) {
                    warn!("Could not save config: {}", e);
                }
            }
            None => warn!("No config location available, not saving"),
        }
    }

    worker.load_model(&args.model)?;
    if let Some(mmproj) = &args.mmproj {
        worker.load_projector(mmproj)?;
    }

    let mut request = GenerationRequest::new(args.prompt);
    if let Some(image) = args.image {
        request = request.with_image(image);
    }

    let mut rx = worker.infer_stream(request)?;
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(StreamToken::Token(text)) => {
                    let _ = write!(stdout, "{}", text);
                    let _ = stdout.flush();
                }
                Some(StreamToken::Done(report)) => {
                    let _ = writeln!(stdout);
                    info!(
                        "Done: {:?} ({} steps, {} fragments, image {:?})",
                        report.termination, report.steps, report.fragments, report.image
                    );
                    break;
                }
                Some(StreamToken::Error(e)) => {
                    error!("Generation did not start: {}", e);
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Cancelling generation");
                worker.cancel();
            }
        }
    }

    worker.free_engine()?;
    Ok(())
}
