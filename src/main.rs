use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Env;

pub mod commands;

#[derive(Parser)]
#[command(version, about = "Manage virtual displays", long_about = None)]
pub struct Cli {
    /// Display configuration file
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Coordinator settings (JSON, durations in milliseconds)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// List configured displays
    List {
        #[arg(long)]
        json: bool,
    },
    /// Add a display configuration
    Add {
        name: String,
        #[arg(long, default_value_t = 1920)]
        width: u32,
        #[arg(long, default_value_t = 1080)]
        height: u32,
        #[arg(long, default_value_t = 60.0)]
        refresh: f64,
        #[arg(long)]
        hidpi: bool,
        /// Defaults to the smallest unused serial number
        #[arg(long)]
        serial: Option<u32>,
        /// Store the display without enabling it
        #[arg(long)]
        disabled: bool,
    },
    /// Remove a display configuration
    Remove { id: String },
    /// Mark a display as enabled or disabled for the next run
    SetEnabled {
        id: String,
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Bring up every enabled display and keep them alive until Ctrl-C
    Run {
        /// Use the in-process simulator instead of the OS backend
        #[arg(long)]
        simulate: bool,
    },
}

fn init_logging(debug: u8) {
    let default_filter = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} [{}] {} - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.level(),
                chrono::Local::now().format("%H:%M:%S.%6f"),
                record.args()
            )
        })
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = commands::execute(cli).await {
        log::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
