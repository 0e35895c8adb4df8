use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use atlasvault::api::ApiServer;
use atlasvault::events::{self, Event, EventDispatcher};
use atlasvault::runner::{run_backup, RunOptions};
use atlasvault::source::Target;
use atlasvault::uploader::pretty_size;
use atlasvault::Config;

#[derive(Parser, Debug)]
#[command(name = "atlasvault")]
#[command(about = "Backup automation for Atlassian Cloud services")]
#[command(version)]
struct Args {
    /// Backup target: "jira" or "confluence"
    target: Option<String>,

    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/atlasvault.toml")]
    config: PathBuf,

    /// Print backup progress to the console
    #[arg(short = 'I', long)]
    interactive: bool,

    /// Run the HTTP service instead of a one-shot backup
    #[arg(short = 'S', long)]
    server: bool,

    /// Start a fresh export even when a pending one could be reused
    #[arg(short = 'F', long)]
    force: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Can't load configuration from {}", args.config.display()))?;
    config.validate().context("Invalid configuration")?;

    init_logging(&config);

    if args.server {
        return ApiServer::new(Arc::new(config)).serve().await.map_err(Into::into);
    }

    let Some(target) = args.target else {
        bail!("Backup target must be given: jira or confluence");
    };
    let target: Target = target.parse()?;

    let options = RunOptions {
        force: args.force,
        dispatcher: args.interactive.then(console_dispatcher),
    };

    run_backup(&config, target, options).await?;

    Ok(())
}

/// Log filtering follows the config, RUST_LOG overrides it.
fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone()),
    );

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Builds the dispatcher rendering lifecycle events on the console.
fn console_dispatcher() -> EventDispatcher {
    let dispatcher = EventDispatcher::new();

    dispatcher.add_handler(events::BACKUP_STARTED, |_| {
        println!("Backup task is running, waiting for completion");
    });

    dispatcher.add_handler(events::BACKUP_PROGRESS, |event| {
        if let Event::BackupProgress(info) = event {
            println!("[{:3}%] {}", info.progress, info.message);
        }
    });

    dispatcher.add_handler(events::BACKUP_SAVING, |_| {
        println!("Fetching backup file");
    });

    dispatcher.add_handler(events::BACKUP_DONE, |_| {
        println!("Backup file saved");
    });

    dispatcher.add_handler(events::UPLOAD_STARTED, |event| {
        if let Event::UploadStarted(storage) = event {
            println!("Uploading backup file to {} storage", storage);
        }
    });

    dispatcher.add_handler(events::UPLOAD_PROGRESS, |event| {
        if let Event::UploadProgress(progress) = event {
            match progress.progress {
                Some(percent) => println!(
                    "[{:5.1}%] Uploading file ({}/{})",
                    percent,
                    pretty_size(progress.current),
                    pretty_size(progress.total),
                ),
                None => println!("Uploading file ({} sent)", pretty_size(progress.current)),
            }
        }
    });

    dispatcher.add_handler(events::UPLOAD_DONE, |_| {
        println!("Upload finished");
    });

    dispatcher
}
