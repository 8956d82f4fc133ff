//! remotecall-server: accepts a single remote call and traces it
//!
//! The client sends a correlation tag and a message. The server attaches
//! the tag to an incoming remote call span, so the call can be stitched to
//! the caller's side of the trace, and runs its handler inside that span.
//!
//! Features:
//! - Exactly one connection per run, then shutdown
//! - Text or binary correlation tags
//! - Handler failures recorded on the span, never fatal
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod remote_call;
mod request;
mod sdk;
mod server;
#[cfg(test)]
mod test_logs;

use config::Config;
use sdk::{SdkState, SpanSdk, TracingSdk};
use server::Server;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("remote call server failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen_addr(),
        accept_timeout = ?config.accept_timeout,
        flush_delay = ?config.flush_delay,
        "Running remote call server"
    );
    for arg in &config.unknown_args {
        warn!(argument = %arg, "unknown argument");
    }

    let sdk = Arc::new(SpanSdk::new(config.tracing_enabled));
    report_sdk_state(sdk.current_state());

    match run(&config, sdk).await {
        Ok(()) => {
            info!(
                flush_delay = ?config.flush_delay,
                "remote call server stopped, waiting for trace data to be flushed"
            );
            tokio::time::sleep(config.flush_delay).await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "remote call server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config, sdk: Arc<dyn TracingSdk>) -> Result<(), server::ServerError> {
    Server::bind(config.listen_addr(), sdk)?
        .with_accept_timeout(config.accept_timeout)
        .run()
        .await
}

fn report_sdk_state(state: SdkState) {
    match state {
        SdkState::Active => info!("SDK is active and capturing"),
        SdkState::PermanentlyInactive => {
            warn!("SDK is permanently inactive; tracing is disabled in the configuration")
        }
        SdkState::TemporarilyInactive => {
            warn!("SDK is temporarily inactive; check the tracing configuration")
        }
        SdkState::Unknown => warn!("SDK is in unknown state"),
    }
}
