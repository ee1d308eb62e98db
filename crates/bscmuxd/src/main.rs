//! bscmuxd: BSC multiplexer daemon
//!
//! Connects out to one MSC, accepts many BSCs, and relays signaling
//! between them. All the relay logic lives in `bscmux-core`; this binary
//! only parses options, initializes logging, and turns the relay's fate
//! into an exit code.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bscmux_core::{RelayConfig, RelayError, Supervisor, UpstreamFatal};

/// Exit codes, one per fatal condition an init system might act on
const EXIT_UPSTREAM_CONNECT: u8 = 1;
const EXIT_LISTEN_FAILED: u8 = 2;
const EXIT_UPSTREAM_LOST: u8 = 3;

/// BSC multiplexer: one MSC uplink, many BSC peers.
#[derive(Parser, Debug)]
#[command(name = "bscmuxd", version, about = "BSC multiplexer daemon")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short = 'c', long)]
    config_file: Option<PathBuf>,

    /// Address of the MSC to connect to (overrides config)
    #[arg(short = 'm', long)]
    msc: Option<String>,

    /// Local address to accept BSC connections on (overrides config)
    #[arg(short = 'l', long)]
    local: Option<String>,

    /// Log filter, e.g. "bscmux_core=debug"
    #[arg(short = 'd', long)]
    debug: Option<String>,

    /// Disable colored log output
    #[arg(short = 's', long)]
    disable_color: bool,

    /// Prefix log lines with timestamps
    #[arg(short = 'T', long)]
    timestamp: bool,
}

fn init_tracing(cli: &Cli) {
    let filter = match &cli.debug {
        Some(spec) => EnvFilter::try_new(spec).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!cli.disable_color);
    if cli.timestamp {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

fn exit_code_for(err: &RelayError) -> u8 {
    match err {
        RelayError::Upstream(UpstreamFatal::ConnectFailed { .. }) => EXIT_UPSTREAM_CONNECT,
        RelayError::Upstream(_) => EXIT_UPSTREAM_LOST,
        RelayError::ListenFailed { .. } => EXIT_LISTEN_FAILED,
        _ => EXIT_UPSTREAM_CONNECT,
    }
}

async fn run(cli: Cli) -> Result<(), RelayError> {
    let mut cfg = RelayConfig::load(cli.config_file.as_deref())?;
    if let Some(msc) = cli.msc {
        cfg.msc_addr = msc;
    }
    if let Some(local) = cli.local {
        cfg.listen_addr = local;
    }

    info!(
        version = bscmux_core::VERSION,
        msc = %cfg.msc_addr,
        local = %cfg.listen_addr,
        "starting bscmuxd"
    );

    Supervisor::run(cfg).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    match run(cli).await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "relay terminated");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
