use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use chat_autopilot::config::ObserverConfig;
use chat_autopilot::dom::Document;
use chat_autopilot::live::{self, WatchOptions};
use chat_autopilot::replay::{self, ReplayReport};
use chat_autopilot::scenario::{self, Scenario};
use chat_autopilot::settings::{Settings, SettingsStore};
use chat_autopilot::transcript;

#[derive(Parser)]
#[command(name = "chat-autopilot")]
#[command(about = "Watches a chat web app and reacts to its UI state")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file against the observers, offline
    Replay {
        /// Scenario JSON file
        scenario: PathBuf,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Write markers instead of clicking
        #[arg(long)]
        inert: bool,
    },

    /// List the scenarios in a directory
    Scenarios {
        /// Directory containing scenario JSON files
        dir: PathBuf,
    },

    /// Watch a live chat tab over CDP
    Watch {
        /// Chat URL to open
        url: String,

        /// Chrome debugging port to connect to
        #[arg(short, long, default_value_t = 9222)]
        port: u16,

        /// Launch a new Chrome instead of connecting
        #[arg(short, long)]
        launch: bool,

        /// Write markers instead of clicking
        #[arg(long)]
        inert: bool,

        /// Observer config JSON (any subset of fields)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Also observe the iframe with this data-extension-frame-id ("self" for all)
        #[arg(long)]
        frame: Option<String>,

        /// Only watch the subtree matching this selector
        #[arg(long)]
        scope: Option<String>,

        /// Keep a plain-text transcript of the chat in this file
        #[arg(long)]
        transcript: Option<PathBuf>,

        /// Poll interval for the page record queue, in ms
        #[arg(long, default_value_t = 100)]
        poll_ms: u64,
    },

    /// Print the conversation in a saved page as plain text
    Transcript {
        /// Saved HTML page
        page: PathBuf,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show or change persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print current settings as JSON
    Show,
    /// Enable or disable clicking Continue automatically
    SetAutoContinue {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Replay {
            scenario,
            format,
            inert,
        } => {
            info!(scenario = %scenario.display(), format = %format, "replay command");
            let loaded = Scenario::load(&scenario)?;
            let report = replay::run(&loaded, inert)?;
            print_report(&report, &format)
        }
        Commands::Scenarios { dir } => {
            for s in scenario::list(&dir)? {
                let description = s.description.unwrap_or_default();
                println!("{:<32} {:>3} steps  {description}", s.name, s.step_count);
            }
            Ok(())
        }
        Commands::Watch {
            url,
            port,
            launch,
            inert,
            config,
            frame,
            scope,
            transcript,
            poll_ms,
        } => {
            let mut config = match config {
                Some(path) => load_config(&path)?,
                None => ObserverConfig::default(),
            };
            config.inert |= inert;
            let settings = SettingsStore::new().load_settings()?;
            info!(url = %url, port = port, launch = launch, inert = config.inert, "watch command");

            let opts = WatchOptions {
                port,
                launch,
                config,
                settings,
                poll: Duration::from_millis(poll_ms),
                frame,
                scope,
                transcript,
                ..WatchOptions::new(url)
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(live::watch(opts))
        }
        Commands::Transcript { page, output } => {
            let html = fs::read_to_string(&page)
                .with_context(|| format!("Failed to read {}", page.display()))?;
            let doc = Document::parse(&html);
            let messages = transcript::parse(&doc);
            info!(page = %page.display(), messages = messages.len(), "transcript command");
            if transcript::ends_truncated(&messages) {
                info!("last reply stopped at the length limit");
            }
            match output {
                Some(path) => {
                    transcript::save(&doc, &path)?;
                }
                None => println!("{}", transcript::format(&messages)),
            }
            Ok(())
        }
        Commands::Settings { action } => {
            let store = SettingsStore::new();
            match action {
                SettingsAction::Show => {
                    let settings = store.load_settings()?;
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                SettingsAction::SetAutoContinue { enabled } => {
                    store.save_settings(&Settings {
                        auto_continue_enabled: enabled,
                    })?;
                    info!(enabled = enabled, "auto-continue updated");
                }
            }
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<ObserverConfig> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Malformed config {}", path.display()))
}

fn print_report(report: &ReplayReport, format: &str) -> Result<()> {
    let output = match format {
        "json" => serde_json::to_string_pretty(report)?,
        _ => report.to_text(),
    };
    println!("{output}");
    Ok(())
}
