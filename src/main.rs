use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use ai_video_pipeline::api::kie::KieClient;
use ai_video_pipeline::config::Config;
use ai_video_pipeline::driver::PhaseSummary;
use ai_video_pipeline::phases;
use ai_video_pipeline::scenario::{Scenario, scenario_stem};
use ai_video_pipeline::status::StatusStore;
use ai_video_pipeline::{ffmpeg, init};

#[derive(Parser)]
#[command(
    name = "ai-video-pipeline",
    version,
    about = "Scenario-driven video generation via the KIE.ai Kling API"
)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate reference images for every element in the scenario.
    GenerateElements {
        #[arg(long)]
        scenario: PathBuf,
        /// Regenerate even if reference images were already completed.
        #[arg(long)]
        force: bool,
    },
    /// Upload completed reference images to remote storage.
    UploadElements {
        /// Re-upload even if recorded URLs are still fresh.
        #[arg(long)]
        force: bool,
    },
    /// Generate the scene clips for a scenario.
    GenerateShots {
        #[arg(long)]
        scenario: PathBuf,
        /// Only run the named scene ids.
        #[arg(long, value_delimiter = ',')]
        scenes: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    /// Re-download completed artifacts whose local files are missing.
    Download {
        #[arg(long)]
        scenario: PathBuf,
    },
    /// Concatenate finished scene clips into the final video.
    Assemble {
        #[arg(long)]
        scenario: PathBuf,
    },
    /// Show recorded progress for the element and scenario stores.
    Status {
        #[arg(long)]
        scenario: Option<PathBuf>,
    },
    /// Run the whole pipeline: elements, uploads, shots, then assembly.
    RunAll {
        #[arg(long)]
        scenario: PathBuf,
        #[arg(long, value_delimiter = ',')]
        scenes: Vec<String>,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateElements { scenario, force } => {
            let config = Config::load(&cli.config).await?;
            let scenario = Scenario::load(&scenario).await?;
            let client = Arc::new(KieClient::new(&config)?);
            let summary =
                phases::elements::generate_elements(client, &config, &scenario, force).await?;
            finish_phase("generate-elements", &summary)
        }
        Command::UploadElements { force } => {
            let config = Config::load(&cli.config).await?;
            let client = KieClient::new(&config)?;
            let summary = phases::upload::upload_elements(&client, &config, force).await?;
            if summary.failed > 0 {
                anyhow::bail!("{} reference images failed to upload", summary.failed);
            }
            Ok(())
        }
        Command::GenerateShots {
            scenario,
            scenes,
            force,
        } => {
            let config = Config::load(&cli.config).await?;
            let stem = scenario_stem(&scenario);
            let scenario = Scenario::load(&scenario).await?;
            let client = Arc::new(KieClient::new(&config)?);
            let filter = (!scenes.is_empty()).then_some(scenes.as_slice());
            let summary =
                phases::shots::generate_shots(client, &config, &scenario, &stem, filter, force)
                    .await?;
            finish_phase("generate-shots", &summary)
        }
        Command::Download { scenario } => {
            let config = Config::load(&cli.config).await?;
            let stem = scenario_stem(&scenario);
            let client = KieClient::new(&config)?;
            let summary = phases::download::download_missing(&client, &config, &stem).await?;
            if summary.failed > 0 {
                anyhow::bail!("{} artifacts could not be re-downloaded", summary.failed);
            }
            Ok(())
        }
        Command::Assemble { scenario } => {
            let config = Config::load(&cli.config).await?;
            require_ffmpeg().await?;
            let stem = scenario_stem(&scenario);
            phases::assemble::assemble(&config, &stem).await?;
            Ok(())
        }
        Command::Status { scenario } => {
            let config = Config::load(&cli.config).await?;
            print_store("elements", &config.elements_status_path())?;
            if let Some(path) = scenario {
                let stem = scenario_stem(&path);
                print_store(&stem, &config.scenario_status_path(&stem))?;
            }
            Ok(())
        }
        Command::RunAll {
            scenario,
            scenes,
            force,
        } => {
            let config = Config::load(&cli.config).await?;
            require_ffmpeg().await?;
            let stem = scenario_stem(&scenario);
            let scenario = Scenario::load(&scenario).await?;
            init::ensure_directories(&config, &stem).await?;
            let client = Arc::new(KieClient::new(&config)?);

            let elements =
                phases::elements::generate_elements(client.clone(), &config, &scenario, force)
                    .await?;
            finish_phase("generate-elements", &elements)?;

            let uploads = phases::upload::upload_elements(client.as_ref(), &config, force).await?;
            if uploads.failed > 0 {
                anyhow::bail!("{} reference images failed to upload", uploads.failed);
            }

            let filter = (!scenes.is_empty()).then_some(scenes.as_slice());
            let shots = phases::shots::generate_shots(
                client.clone(),
                &config,
                &scenario,
                &stem,
                filter,
                force,
            )
            .await?;
            finish_phase("generate-shots", &shots)?;

            let downloads =
                phases::download::download_missing(client.as_ref(), &config, &stem).await?;
            if downloads.failed > 0 {
                anyhow::bail!("{} artifacts could not be re-downloaded", downloads.failed);
            }

            phases::assemble::assemble(&config, &stem).await?;
            Ok(())
        }
    }
}

fn finish_phase(name: &str, summary: &PhaseSummary) -> Result<()> {
    eprintln!(
        "[{}] {} completed, {} skipped, {} failed",
        name, summary.completed, summary.skipped, summary.failed
    );
    if summary.failed > 0 {
        for (key, cause) in &summary.failures {
            eprintln!("  {key}: {cause}");
        }
        anyhow::bail!(
            "{name}: {} items failed; rerun to retry them",
            summary.failed
        );
    }
    Ok(())
}

fn print_store(label: &str, path: &std::path::Path) -> Result<()> {
    let store = StatusStore::load(path)?;
    println!("{label} ({}):", path.display());
    if store.is_empty() {
        println!("  (no records)");
        return Ok(());
    }
    for (key, item) in store.all() {
        let status = serde_json::to_value(item.status)?;
        let mut line = format!("  {key}: {}", status.as_str().unwrap_or("unknown"));
        if let Some(err) = &item.error {
            line.push_str(&format!(" ({err})"));
        }
        println!("{line}");
    }
    Ok(())
}

async fn require_ffmpeg() -> Result<()> {
    if !ffmpeg::check_ffmpeg().await {
        anyhow::bail!("ffmpeg not found in PATH; install it to assemble videos");
    }
    Ok(())
}
