//! Dummy HTTP Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dummy_http_server::response::probe_pattern;
use dummy_http_server::{Server, ServerConfig};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "dummy-http-server",
    about = "Dummy HTTP server - canned responses and request capture",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Log to stderr instead of <captureDir>/log.log
    #[arg(long)]
    log_stderr: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Test a path pattern regular expression against sample paths
    TestPattern {
        /// Path pattern regex to be tested
        #[arg(short, long)]
        pattern: String,

        /// Paths to test against the pattern
        paths: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::TestPattern { pattern, paths }) = &args.command {
        println!("Pattern: {}", pattern);
        for (path, matched) in probe_pattern(pattern, paths)? {
            println!(" {} => {}", path, matched);
        }
        return Ok(());
    }

    let config = if args.config.exists() {
        ServerConfig::from_file(&args.config)
            .with_context(|| format!("unable to load {}", args.config.display()))?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        ServerConfig::default()
    };

    if args.validate {
        let problems = config.validate();
        for (index, error) in &problems {
            println!("Rule {}: {}", index, error);
        }
        println!(
            "Configuration checked ({} of {} rules valid)",
            config.responses.len() - problems.len(),
            config.responses.len()
        );
        return Ok(());
    }

    std::fs::create_dir_all(&config.capture_dir).with_context(|| {
        format!(
            "unable to create capture directory {}",
            config.capture_dir.display()
        )
    })?;

    // Initialize logging
    let builder = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false);
    if args.log_stderr {
        tracing::subscriber::set_global_default(builder.with_writer(std::io::stderr).finish())?;
    } else {
        let log_file = config.capture_dir.join("log.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("unable to open {}", log_file.display()))?;
        tracing::subscriber::set_global_default(
            builder.with_ansi(false).with_writer(Mutex::new(file)).finish(),
        )?;
    }

    if args.config.exists() {
        info!(path = ?args.config, "Configuration loaded");
    } else {
        info!(path = ?args.config, "Configuration file not found, using defaults");
    }

    let server = Server::bind(&config).await?;
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
