//! PostgreSQL Backup Service
//!
//! Dumps a database with pg_dump, compresses the dump and delivers it either
//! as an HTTP download or as an upload to S3-compatible object storage.

// pgbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod server;

use anyhow::{Context, Result};
use backup::Delivery;
use config::{PipelineSettings, ServerSettings};
use futures::StreamExt;
use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Main entry point for the backup service
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run_app().await {
        Ok(_) => {
            info!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    // A missing .env is fine; the process environment may already be complete.
    let _ = dotenv::dotenv();
    let vars: HashMap<String, String> = env::vars().collect();

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    let settings = PipelineSettings::from_vars(&vars).context("Invalid pipeline settings")?;
    let server_settings = ServerSettings::from_vars(&vars).context("Invalid server settings")?;
    let pipeline = backup::default_pipeline(settings).context("Failed to set up backup pipeline")?;

    match choice.as_str() {
        "1" | "serve" => {
            let state = server::AppState {
                pipeline: Arc::new(pipeline),
                vars: Arc::new(vars),
            };
            server::serve(server_settings.listen_addr, state)
                .await
                .context("HTTP server failed")?;
        }
        "2" | "backup" => {
            info!("🚀 Starting Backup Process...");
            let delivery = pipeline.run_backup(&vars).await.context("Backup process failed")?;
            match delivery {
                Delivery::Uploaded(stored) => {
                    info!(bucket = %stored.bucket, key = %stored.key, bytes = stored.size, "🎉 Backup uploaded");
                }
                Delivery::Download(download) => {
                    save_download(download, &server_settings).await?;
                }
            }
        }
        _ => {
            error!("❌ Invalid choice. Please enter '1' (serve) or '2' (backup).");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

/// Writes a download-mode archive into the local output directory.
async fn save_download(
    download: backup::download::ArchiveDownload,
    server_settings: &ServerSettings,
) -> Result<()> {
    let output_dir = &server_settings.output_dir;
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;

    let destination = output_dir.join(&download.file_name);
    let mut file = tokio::fs::File::create(&destination)
        .await
        .with_context(|| format!("Failed to create {}", destination.display()))?;

    let mut stream = download.stream;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Failed to read archive")?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", destination.display()))?;
    }
    file.sync_all()
        .await
        .with_context(|| format!("Failed to sync {}", destination.display()))?;

    info!(path = %destination.display(), bytes = stream.bytes_sent(), "🎉 Backup saved locally");
    Ok(())
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Start backup HTTP service (or type 'serve')");
    println!("2. Take a backup now (or type 'backup')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
