use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use roost_config::{Config, StreamCredentials};
use roost_server::{HttpServer, ServiceState};
use roost_system::{Controller, Service};

/// How long services get to wind down after SIGTERM.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "roost", version, about = "Parent node for streaming telemetry")]
struct Cli {
    /// Directory holding roost.yml and stream.yml.
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("roost: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(Config::load(&cli.config).context("loading configuration")?);

    roost_log::init(config.logging());
    roost_statsd::init(config.metrics()).context("initializing metrics")?;

    let credentials =
        Arc::new(StreamCredentials::load(&config).context("loading streaming credentials")?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("roost")
        .build()
        .context("creating the runtime")?;

    runtime.block_on(async {
        Controller::start(SHUTDOWN_TIMEOUT);

        let state = ServiceState::start(config.clone(), credentials);
        let server = HttpServer::new(config, state.clone()).context("starting the server")?;
        let _server = server.start();

        Controller::shutdown().await;
        state.shutdown_streaming();

        Ok::<_, anyhow::Error>(())
    })?;

    roost_log::info!("roost shutdown complete");
    Ok(())
}
