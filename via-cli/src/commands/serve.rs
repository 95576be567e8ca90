//! `via serve` - run the daemon
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 vector backend
//! unreachable at startup, 3 unrecoverable internal error.

use std::process::ExitCode;

use clap::Args;
use tracing::error;
use via_core::config::ViaConfig;
use via_core::error::{ViaError, VectorError};
use via_server::ViaServer;

#[derive(Debug, Args, Default)]
pub struct ServeArgs {
    /// Override the bind address (otherwise BIND_ADDR or the default)
    #[arg(long)]
    bind: Option<String>,
}

pub async fn run(args: ServeArgs) -> ExitCode {
    let mut config = match ViaConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "configuration error");
            return ExitCode::from(1);
        }
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let server = match ViaServer::initialize(config).await {
        Ok(server) => server,
        Err(ViaError::Config(err)) => {
            error!(%err, "configuration error");
            return ExitCode::from(1);
        }
        Err(ViaError::Vector(VectorError::Unavailable(detail))) => {
            error!(%detail, "vector backend unreachable at startup");
            return ExitCode::from(2);
        }
        Err(err) => {
            error!(%err, "failed to start");
            return ExitCode::from(3);
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "server terminated abnormally");
            ExitCode::from(3)
        }
    }
}
