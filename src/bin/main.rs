//! Symfetch CLI - fetch the dSYMs a crash report needs
//!
//! Parses an Apple crash log, runs the configured fetch script for its build
//! UUID and reports the dSYM bundles it found.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use symfetch::dsym::{install_script, DsymDownloader};
use symfetch::{crash_env, CrashReport, FetchConfig, FetchError, FetchProgress, FetchStatus};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "symfetch")]
#[command(about = "Fetch the dSYMs a crash report needs through your own download script")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the dSYMs for a crash report
    Fetch {
        /// Crash log to symbolicate
        crash: PathBuf,

        /// Fetch script to run
        #[arg(long, env = "SYMFETCH_SCRIPT")]
        script: Option<PathBuf>,

        /// Directory the script downloads dSYMs into (`~/` is expanded)
        #[arg(long, env = "SYMFETCH_DSYM_DIR")]
        dsym_dir: Option<String>,

        /// Keep the crash log handed to the script at this path
        #[arg(long)]
        save_to: Option<PathBuf>,

        /// Output format: pretty or json
        #[arg(short, long, default_value = "pretty")]
        format: OutputFormat,
    },

    /// Print the environment the fetch script receives for a crash report
    Env {
        /// Crash log to read
        crash: PathBuf,
    },

    /// Install a fetch script (the bundled default unless --from is given)
    InstallScript {
        /// Where to install the script
        #[arg(long, env = "SYMFETCH_SCRIPT")]
        script: Option<PathBuf>,

        /// Script to install instead of the bundled default
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum OutputFormat {
    Pretty,
    Json,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch {
            crash,
            script,
            dsym_dir,
            save_to,
            format,
        } => {
            let config = build_config(script, dsym_dir);
            fetch(&crash, config, save_to, format).await?;
        }
        Commands::Env { crash } => {
            show_env(&crash)?;
        }
        Commands::InstallScript { script, from } => {
            let path = script.unwrap_or_else(|| FetchConfig::default().script_path);
            install_script(&path, from.as_deref())?;
            println!("{} {}", "Installed".green().bold(), path.display());
        }
    }

    Ok(())
}

fn build_config(script: Option<PathBuf>, dsym_dir: Option<String>) -> FetchConfig {
    let mut config = match dsym_dir {
        Some(dir) => FetchConfig::with_stored_download_dir(&dir),
        None => FetchConfig::default(),
    };
    if let Some(script) = script {
        config.script_path = script;
    }
    config
}

fn read_crash(path: &PathBuf) -> Result<CrashReport, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    Ok(CrashReport::parse(&content))
}

fn show_env(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let crash = read_crash(path)?;
    for (key, value) in crash_env(&crash) {
        println!("{}={}", key.cyan(), value);
    }
    Ok(())
}

/// Requests a fetch and follows it until it settles or Ctrl-C cancels it.
async fn fetch(
    path: &PathBuf,
    config: FetchConfig,
    save_to: Option<PathBuf>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let crash = Arc::new(read_crash(path)?);
    let Some(uuid) = crash.uuid.clone() else {
        return Err(format!("{} has no build UUID", path.display()).into());
    };

    let downloader = DsymDownloader::new(config)?;
    let Some(task) = downloader.request(crash.clone(), save_to) else {
        return Err(FetchError::ScriptUnavailable(downloader.config().script_path.clone()).into());
    };

    let pretty = matches!(format, OutputFormat::Pretty);
    if pretty {
        println!("{}", "━".repeat(60).dimmed());
        println!(
            "{} {} {}",
            "Fetching dSYMs for".green().bold(),
            crash.app_name.as_deref().unwrap_or("<unknown app>"),
            crash.app_version.as_deref().unwrap_or_default().dimmed()
        );
        println!("  {} {}", "uuid:".dimmed(), uuid);
        println!(
            "  {} {}",
            "into:".dimmed(),
            downloader.config().download_dir.display()
        );
        println!("{}", "━".repeat(60).dimmed());
    }

    let settled = task.settled();
    tokio::pin!(settled);
    let mut progress = task.subscribe_progress();
    loop {
        tokio::select! {
            _ = &mut settled => break,
            changed = progress.changed() => {
                if changed.is_ok() && pretty {
                    print_progress(&progress.borrow_and_update());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                task.cancel();
                break;
            }
        }
    }

    let snapshot = task.snapshot();
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        OutputFormat::Pretty => {
            println!();
            let files = snapshot.dsym_files.as_deref().unwrap_or_default();
            if files.is_empty() {
                println!("  {}", "No matching dSYM reported".yellow());
            }
            for file in files {
                let kind = if file.is_app { "app" } else { "framework" };
                println!(
                    "  {} {} {}",
                    format!("[{}]", kind).cyan(),
                    file.name.green(),
                    file.uuids.join(", ").dimmed()
                );
                println!("      {}", file.path.dimmed());
            }
            println!();
        }
    }

    match snapshot.status {
        FetchStatus::Success => Ok(()),
        FetchStatus::Failed { code, message } => {
            if pretty {
                if let Some(message) = message.filter(|m| !m.trim().is_empty()) {
                    eprintln!("{}", message.trim_end().dimmed());
                }
            }
            Err(format!("fetch script failed with code {}", code).into())
        }
        FetchStatus::Canceled => Err("fetch canceled".into()),
        other => Err(format!("fetch stopped while {}", other.as_str()).into()),
    }
}

fn print_progress(progress: &FetchProgress) {
    let percentage = if progress.is_determinate() {
        format!("{:>3}%", progress.percentage)
    } else {
        "  ?%".to_string()
    };
    print!(
        "\r  {} {} / {}  {}/s  {} left   ",
        percentage.cyan(),
        progress.downloaded_size,
        progress.total_size,
        progress.speed,
        progress.time_left
    );
    let _ = std::io::stdout().flush();
}
