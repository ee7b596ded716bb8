//! childwin - pixmap-tiled X11 window with an ICCCM-aware event loop
//!
//! ```text
//! childwin test-display --display 9   → simulated display on :9
//! childwin                            → window on :9, reports events
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use childwin::app::{self, Outcome};
use childwin::config::{BackgroundStyle, Config, Tail};
use childwin::test_display;

#[derive(Parser)]
#[command(name = "childwin")]
#[command(about = "Pixmap-tiled X11 window with an ICCCM-aware event loop")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// X display to connect to (empty string uses $DISPLAY)
    #[arg(short, long)]
    display: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Map the window and report events until it goes away
    Run {
        /// Leave the loop once the window is destroyed
        #[arg(long)]
        exit_on_destroy: Option<bool>,

        /// Leave the loop on WM_DELETE_WINDOW (needs --wm)
        #[arg(long)]
        honor_close_request: bool,

        /// Set WM_NAME, WM_CLASS, WM_PROTOCOLS and size hints
        #[arg(long)]
        wm: bool,

        /// Draw four white circles on black instead of a solid tile
        #[arg(long)]
        pattern: bool,
    },

    /// Map the window and sleep instead of reading events
    Sleep {
        /// How long to keep the window up
        #[arg(short, long)]
        seconds: Option<u64>,
    },

    /// Serve a simulated display for local testing
    #[command(name = "test-display")]
    TestDisplay {
        /// Display number (socket /tmp/.X11-unix/XN, TCP port 6000+N)
        #[arg(short, long = "display", default_value = "9")]
        number: u32,

        #[arg(long, default_value = "1280")]
        width: u16,

        #[arg(long, default_value = "720")]
        height: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path).context("failed to load configuration")?,
        None => Config::default(),
    };
    if let Some(display) = cli.display {
        config.display = display;
    }

    match cli.command {
        None => run_client(config).await,
        Some(Commands::Run {
            exit_on_destroy,
            honor_close_request,
            wm,
            pattern,
        }) => {
            config.tail = Tail::EventLoop;
            if let Some(exit) = exit_on_destroy {
                config.exit_on_destroy = exit;
            }
            config.honor_close_request |= honor_close_request;
            config.wm_integration |= wm;
            if pattern {
                config.background_style = BackgroundStyle::FourArcPattern;
            }
            run_client(config).await
        }
        Some(Commands::Sleep { seconds }) => {
            config.tail = Tail::Sleep;
            if let Some(seconds) = seconds {
                config.sleep_seconds = seconds;
            }
            run_client(config).await
        }
        Some(Commands::TestDisplay {
            number,
            width,
            height,
        }) => test_display::run_test_display(number, width, height).await,
    }
}

/// The client blocks on the display socket, so it runs off the async workers.
async fn run_client(config: Config) -> Result<()> {
    let display = config.display.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        app::run_session(&config, std::io::stdout().lock())
    })
    .await
    .context("client thread panicked")?
    .with_context(|| format!("childwin failed on display {display:?}"))?;

    match outcome {
        Outcome::EventLoop(reason) => tracing::info!(?reason, "done"),
        Outcome::Slept(duration) => tracing::info!(?duration, "done"),
    }
    Ok(())
}
