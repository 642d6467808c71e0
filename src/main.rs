//! piece-exchange - Main entry point
//!
//! Runs one peer of a cooperative piece-exchange session.

use anyhow::{Context, Result};
use piece_exchange::{CliArgs, Config, FilePieceStore, PieceStore, Session};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        let location = panic_info.location().unwrap();

        error!(
            "PANIC occurred at {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("piece-exchange starting as peer {}", args.peer_id);
    debug!("CLI arguments: {:?}", args);

    let config = Config::load(&args.common_config, &args.peer_config)
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Each peer keeps its copy of the file in its own subdirectory
    let working_dir = args
        .working_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("peer_{}", args.peer_id)));
    std::fs::create_dir_all(&working_dir)
        .with_context(|| format!("Failed to create {}", working_dir.display()))?;
    let file_path = working_dir.join(&config.common.file_name);

    info!(
        "Session file: {} ({} bytes, {} pieces of {} bytes)",
        file_path.display(),
        config.common.file_size,
        config.common.num_pieces(),
        config.common.piece_size
    );

    let store: Arc<dyn PieceStore> = Arc::new(
        FilePieceStore::open(&file_path, config.common.file_size, config.common.piece_size)
            .await
            .context("Failed to open piece store")?,
    );

    let session = Session::new(args.peer_id, config, store).context("Failed to build session")?;
    session.run().await.context("Session failed")?;

    info!("piece-exchange finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized at {:?}", level);
}
