#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod events;
pub mod logging;
pub mod peer;
pub mod state;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use slsk_config::Options;

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "slskd", about = "A Soulseek daemon")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log filter, in tracing's EnvFilter syntax.
    #[arg(long, default_value = "info")]
    log_filter: String,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    check_config: bool,
}

/// The real main: parse arguments, load configuration, run the daemon
/// until shutdown.
///
/// Kept in the library crate so the binary shim stays trivial.
pub async fn main_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_buffer = logging::LogBuffer::new(logging::DEFAULT_LOG_BUFFER_CAPACITY);
    logging::install(&args.log_filter, &log_buffer).context("failed to set up logging")?;

    let options = match &args.config {
        Some(path) => Options::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => {
            info!("no configuration file given; using defaults");
            std::sync::Arc::new(Options::default())
        }
    };
    if args.check_config {
        info!("configuration is valid");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                shutdown.cancel();
            }
        });
    }

    let daemon = app::Daemon::new(options, peer::unconfigured(), log_buffer, shutdown)
        .context("failed to start")?;
    daemon.run().await;
    info!("shut down cleanly");
    Ok(())
}
