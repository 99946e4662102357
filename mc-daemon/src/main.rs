//! Meshcap Daemon (meshcapd)
//!
//! Hosts one session per paired mesh device. The mesh stack bridge connects
//! over a Unix domain socket and streams stack events as JSON lines; the
//! daemon answers with capability updates and outbound device commands.
//!
//! # Startup
//! - Compiles the profile catalog; a fatal catalog error aborts startup
//! - Loads core settings (defaults when the file is missing)
//! - Opens the calibration store used for learned battery curves
//!
//! # Hardening
//! - Restrictive umask (0077) for calibration files and the socket
//! - Symlink refusal on the socket path
//! - Maximum message size enforcement
//! - Graceful shutdown on SIGINT/SIGTERM tearing down every device

mod hub;
mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use mc_core::{compile, load_settings, Catalog, JsonCalibrationStore};
use tokio::sync::watch;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable holding the log filter
const LOG_ENV: &str = "MESHCAP_LOG";

// ============================================================================
// Paths
// ============================================================================

/// Default socket path
fn get_default_socket_path() -> &'static str {
    if Path::new("/run").exists() {
        "/run/meshcap.sock"
    } else {
        "/var/run/meshcap.sock"
    }
}

/// Validate the socket path before binding
fn validate_socket_path(path: &str) -> Result<(), String> {
    let p = Path::new(path);

    if !p.is_absolute() {
        return Err("Socket path must be absolute".into());
    }
    if path.contains("..") {
        return Err("Socket path contains path traversal".into());
    }
    if path.contains('\0') {
        return Err("Socket path contains null byte".into());
    }
    if let Some(parent) = p.parent() {
        if !parent.exists() {
            return Err(format!("Parent directory does not exist: {:?}", parent));
        }
    }
    if p.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
        return Err("Socket path is a symlink - refusing for security".into());
    }
    Ok(())
}

/// Set restrictive umask
fn set_secure_umask() {
    // SAFETY: umask only sets the file creation mask of this process.
    unsafe { libc::umask(0o077) };
}

// ============================================================================
// CLI
// ============================================================================

struct Options {
    catalog: PathBuf,
    socket: String,
    settings: Option<PathBuf>,
}

fn print_help() {
    eprintln!("meshcapd {} - meshcap device host daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    meshcapd --catalog PATH [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --catalog PATH   Profile catalog (JSON)");
    eprintln!("    -s, --socket PATH    Socket path (default /run/meshcap.sock)");
    eprintln!("        --settings PATH  Core settings file");
    eprintln!("    -v, --version        Print version");
    eprintln!("    -h, --help           Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    MESHCAP_LOG          Log filter (trace, debug, info, warn, error)");
    eprintln!("    MESHCAP_CONFIG_DIR   Override the configuration directory");
}

/// Parse arguments. `Ok(None)` means help or version was printed.
fn parse_args(args: &[String]) -> Result<Option<Options>, String> {
    let mut catalog = None;
    let mut socket = get_default_socket_path().to_string();
    let mut settings = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-v" | "--version" => {
                println!("meshcapd {}", VERSION);
                return Ok(None);
            }
            flag @ ("-c" | "--catalog" | "-s" | "--socket" | "--settings") => {
                i += 1;
                let Some(value) = args.get(i) else {
                    return Err(format!("{} requires a path argument", flag));
                };
                match flag {
                    "-c" | "--catalog" => catalog = Some(PathBuf::from(value)),
                    "-s" | "--socket" => socket = value.clone(),
                    _ => settings = Some(PathBuf::from(value)),
                }
            }
            arg => return Err(format!("Unknown argument: {}", arg)),
        }
        i += 1;
    }

    let catalog = catalog.ok_or_else(|| "--catalog is required".to_string())?;
    Ok(Some(Options {
        catalog,
        socket,
        settings,
    }))
}

// ============================================================================
// Logging
// ============================================================================

/// Initialize tracing, preferring the systemd journal. Returns whether the
/// journal is in use.
fn init_logging(filter: &str) -> bool {
    use tracing_subscriber::prelude::*;

    if Path::new("/run/systemd/journal/socket").exists() {
        match tracing_journald::layer() {
            Ok(layer) => {
                tracing_subscriber::registry()
                    .with(layer)
                    .with(tracing_subscriber::EnvFilter::new(filter))
                    .init();
                return true;
            }
            Err(e) => eprintln!("Failed to create journald layer: {}, falling back to stdout", e),
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();
    false
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => return Ok(()),
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    set_secure_umask();

    let log_filter = std::env::var(LOG_ENV).unwrap_or_else(|_| "info".to_string());
    let journald = init_logging(&log_filter);

    info!(version = VERSION, "meshcapd starting");
    info!(target_log = if journald { "systemd journal" } else { "stdout" }, filter = %log_filter, "Logging initialized");

    let settings = load_settings(options.settings.as_deref()).context("Failed to load settings")?;

    let catalog = Catalog::load(&options.catalog)
        .with_context(|| format!("Failed to load catalog {}", options.catalog.display()))?;
    let registry = compile(&catalog, &settings.catalog.compile_options()).context("Catalog rejected")?;
    info!(
        profiles = registry.len(),
        identities = registry.identity_count(),
        collisions = registry.collisions().len(),
        "Catalog compiled"
    );

    let calibration_dir = settings
        .calibration_dir()
        .context("No calibration directory available; set storage.calibration_dir")?;
    info!(dir = %calibration_dir.display(), "Calibration store");
    let store = Arc::new(JsonCalibrationStore::new(calibration_dir));

    if let Err(e) = validate_socket_path(&options.socket) {
        error!(error = %e, "Invalid socket path");
        std::process::exit(1);
    }

    let hub = hub::Hub::new(registry, settings, store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    }) {
        warn!(error = %e, "Failed to set signal handler, shutdown via signals may not be clean");
    }

    let result = server::run_server(&options.socket, Arc::clone(&hub), shutdown_rx).await;

    let stopped = hub.shutdown().await;
    info!(devices = stopped, "meshcapd stopped");

    result
}
