// edge-inference/crates/edge-inference/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use edge_inference::{
    config::EngineConfig, engine::InferenceEngine, model_store::{DownloadEvent, DownloadListener}, telemetry, Capability,
    InferenceRequest,
};
#[cfg(feature = "cli")]
use futures::StreamExt;
#[cfg(feature = "cli")]
use std::io::Write;
#[cfg(feature = "cli")]
use std::sync::Arc;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "edge-inference", version, about = "On-device inference engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// List catalog models and whether they are ready
    Models,
    /// Download a model and record it as ready
    Download { model_id: String },
    /// Run one request against a capability
    Run {
        capability: Capability,
        text: String,
        #[arg(long)]
        stream: bool,
    },
    /// Delete a downloaded model
    Remove { model_id: String },
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cli = Cli::parse();

    let cfg = EngineConfig::from_env()?;
    cfg.print_config();
    let engine = InferenceEngine::from_config(cfg)?;

    match cli.command {
        Command::Models => {
            for model in engine.catalog().models() {
                let ready = engine.downloads().is_ready(&model.id).await;
                println!(
                    "{:<32} runner={:<12} ram={:.1}GB ready={}",
                    model.id, model.runner, model.ram_gb, ready
                );
            }
        }
        Command::Download { model_id } => {
            let listener: Arc<dyn DownloadListener> = Arc::new(|event: &DownloadEvent| {
                if let DownloadEvent::Progress {
                    file_name,
                    overall_percent,
                    speed_bps,
                    ..
                } = event
                {
                    println!("{} {:>5.1}% {:.0} B/s", file_name, overall_percent, speed_bps);
                } else {
                    println!("{}: {}", event.name(), event.model_id());
                }
            });
            engine.downloads().download(&model_id, Some(listener)).await?;
            println!("{} is ready", model_id);
        }
        Command::Run {
            capability,
            text,
            stream,
        } => {
            let request = InferenceRequest::generate().with_input("prompt", text);
            if stream {
                let mut results = engine.process_stream(request, capability);
                let mut stdout = std::io::stdout();
                while let Some(result) = results.next().await {
                    if let Some(error) = &result.error {
                        anyhow::bail!("{}", error);
                    }
                    if result.partial {
                        write!(stdout, "{} ", result.text("text").unwrap_or_default())?;
                        stdout.flush()?;
                    }
                }
                println!();
            } else {
                let result = engine.process(request, capability).await;
                if let Some(error) = result.error {
                    anyhow::bail!("{}", error);
                }
                println!("{}", serde_json::to_string_pretty(&result.outputs)?);
            }
        }
        Command::Remove { model_id } => {
            let removed = engine.downloads().remove_model(&model_id).await?;
            println!("{}", if removed { "removed" } else { "nothing to remove" });
        }
    }

    engine.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
