//! alprd - licence plate relay daemon
//!
//! Listens on a TCP port for a single client. Every message starting with
//! `Z` captures one frame, runs it through the recognition engine and sends
//! back the best plate (or `NO_LEGIBLE`) as one line.
//!
//! Exit codes: 1 for command-line, configuration, camera or engine failures;
//! -1 when the listening socket cannot be opened; 0 after Ctrl-C.

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use std::path::PathBuf;

use plate_relay::{open_recognizer, open_source, CliOverrides, Relay, RelayConfig, Session};

const EXIT_FATAL: i32 = 1;
const EXIT_SOCKET: i32 = -1;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Answer `Z` triggers over TCP with the licence plate the camera sees"
)]
struct Args {
    /// Country code for plate recognition [default: eu].
    #[arg(short = 'c', long, env = "ALPR_COUNTRY")]
    country: Option<String>,

    /// Recognition engine configuration file [default: runtime_data/eu.conf].
    #[arg(long = "config", env = "ALPR_ENGINE_CONFIG", value_name = "PATH")]
    engine_config: Option<PathBuf>,

    /// TCP port to listen on [default: 1234].
    #[arg(short, long, env = "ALPR_PORT")]
    port: Option<u16>,

    /// Network camera address; selects network capture instead of USB.
    #[arg(short, long, env = "ALPR_CAMERA_ADDRESS")]
    address: Option<String>,

    /// USB camera index, i.e. /dev/video<INDEX> [default: 0].
    #[arg(long, env = "ALPR_CAMERA", value_name = "INDEX")]
    camera: Option<u32>,

    /// Reply with the full recognition result as JSON.
    #[arg(short, long)]
    json: bool,

    /// Verbose diagnostic output.
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            country: self.country.clone(),
            engine_config: self.engine_config.clone(),
            port: self.port,
            address: self.address.clone(),
            camera: self.camera,
            json: self.json,
        }
    }
}

/// Startup or runtime failure with the process exit code it maps to.
struct Fatal {
    code: i32,
    error: anyhow::Error,
}

impl Fatal {
    fn config(error: anyhow::Error) -> Self {
        Self {
            code: EXIT_FATAL,
            error,
        }
    }

    fn socket(error: anyhow::Error) -> Self {
        Self {
            code: EXIT_SOCKET,
            error,
        }
    }
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(EXIT_FATAL);
        }
    };

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let code = match serve(&args) {
        Ok(()) => 0,
        Err(fatal) => {
            log::error!("{:#}", fatal.error);
            fatal.code
        }
    };
    std::process::exit(code);
}

fn serve(args: &Args) -> Result<(), Fatal> {
    let cfg = RelayConfig::load(&args.overrides()).map_err(Fatal::config)?;
    log::info!(
        "alprd {}: country={}, engine={} ({}), port={}, capture={:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.engine.country,
        cfg.engine.backend,
        cfg.engine.config_path.display(),
        cfg.port,
        cfg.camera.mode()
    );

    let mut recognizer = open_recognizer(&cfg.engine).map_err(Fatal::config)?;
    recognizer
        .warm_up()
        .context("recognition engine failed to load")
        .map_err(Fatal::config)?;

    let mut session = Session::bind(cfg.port, cfg.framing).map_err(Fatal::socket)?;

    let mut source = open_source(&cfg.camera).map_err(Fatal::config)?;
    source
        .connect()
        .with_context(|| format!("connect camera {}", source.name()))
        .map_err(Fatal::config)?;

    let shutdown = session.shutdown_handle();
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received, stopping relay...");
        shutdown.trigger();
    })
    .context("install Ctrl-C handler")
    .map_err(Fatal::config)?;

    log::info!("waiting for a client on port {}", session.port());
    if !session.accept().map_err(Fatal::socket)? {
        source.disconnect();
        return Ok(());
    }

    let mut relay = Relay::new(source, recognizer, cfg.output.clone());
    let stats = relay.run(&mut session).map_err(Fatal::socket)?;
    log::info!(
        "served {} triggers ({} replies, {} capture failures)",
        stats.triggers,
        stats.replies_sent,
        stats.capture_failures
    );
    Ok(())
}
