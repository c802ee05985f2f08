//! `concordd` — a minimal runnable host for the [`concord`] runtime.
//!
//! This is ambient scaffolding, not the demo CLI/REPL spec.md calls external
//! (§1): it does nothing beyond parsing overrides, calling `initialize`,
//! optionally becoming the clock master, and driving `run()` until the
//! process is killed. Embedding hosts are expected to call the library API
//! directly; this binary exists so the crate is runnable at all, in the same
//! spirit as the teacher's own `main.rs` providing a thin launcher in front
//! of its library.

use clap::Parser;
use concord::{log_error, log_info};

#[derive(Parser, Debug)]
#[command(
    name = "concordd",
    version,
    about = "Peer-to-peer messaging runtime for interactive music and media applications."
)]
struct Cli {
    /// Application name peers discover each other under.
    #[arg(short, long, value_name = "NAME")]
    app_name: Option<String>,

    /// Path to a TOML config file. Defaults to the OS-standard per-user
    /// config directory for this application (defaults applied for any
    /// field the file omits or if it is absent entirely).
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// UDP/TCP discovery port.
    #[arg(long, value_name = "PORT")]
    discovery_port: Option<u16>,

    /// Become the clock master for this application (spec §4.6: election is
    /// static — exactly one process should pass this flag).
    #[arg(long)]
    master: bool,

    /// Poll rate, in Hz, for the `run()` loop.
    #[arg(long, value_name = "HZ")]
    poll_rate_hz: Option<u32>,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => concord::RuntimeConfig::load(path),
        None => concord::RuntimeConfig::load_default(cli.app_name.as_deref().unwrap_or("concord")),
    };
    if let Some(name) = cli.app_name {
        config.application_name = name;
    }
    if let Some(port) = cli.discovery_port {
        config.network.discovery_port = port;
    }
    if let Some(rate) = cli.poll_rate_hz {
        config.poll_rate_hz = rate;
    }
    let poll_rate_hz = config.poll_rate_hz;
    let app_name = config.application_name.clone();

    let code = concord::initialize(config);
    if code != concord::ReturnCode::Success {
        log_error!("initialize failed: {code:?}");
        std::process::exit(1);
    }

    if cli.master {
        concord::set_clock(None, None);
    }

    log_info!("concordd joining application '{app_name}' at {poll_rate_hz} Hz");

    let code = concord::run(poll_rate_hz);
    if code != concord::ReturnCode::Success {
        log_error!("run() exited with {code:?}");
    }

    concord::finish();
    log_info!("concordd stopped");
}
