//! Binary shim for the slskd daemon.

use slsk_error::Report;

/// Entry point: run the daemon, mapping failure to a nonzero exit.
#[tokio::main]
async fn main() {
    if let Err(e) = slskd::main_main().await {
        tracing::error!("{}", Report(&e));
        std::process::exit(1);
    }
}
