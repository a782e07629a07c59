use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use faros_core::{drain, signal, telemetry};
use faros_ingress::{Config, ConnectorConfig, api, connector, gateway, store};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Parser)]
#[command(name = "faros", about = "Ingress tunneling service", version)]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the management API service.
	Api,
	/// Run the public gateway.
	Gateway,
	/// Run the connector next to a local service.
	Connector,
	/// Run API and gateway together with an in-memory store, for development.
	Dev,
}

fn main() -> ExitCode {
	telemetry::setup_logging();
	let cli = Cli::parse();
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to build runtime");
	match runtime.block_on(run(cli.command)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!("fatal: {err:#}");
			ExitCode::FAILURE
		},
	}
}

async fn run(command: Commands) -> anyhow::Result<()> {
	// One TLS provider for the rustls servers and every outbound client.
	let _ = rustls::crypto::ring::default_provider().install_default();
	match command {
		Commands::Api => {
			let config = Arc::new(Config::load()?);
			let store = store::from_config(&config.database).await?;
			let service = api::Service::new(config, store).await?;
			run_until_shutdown(|drain| service.run(drain)).await
		},
		Commands::Gateway => {
			let config = Arc::new(Config::load()?);
			let store = store::from_config(&config.database).await?;
			let service = gateway::Service::new(config, store).await?;
			run_until_shutdown(|drain| service.run(drain)).await
		},
		Commands::Dev => {
			let mut config = Config::load()?;
			config.database = faros_ingress::config::Database::Memory;
			let config = Arc::new(config);
			let store = store::from_config(&config.database).await?;
			let api = api::Service::new(config.clone(), store.clone()).await?;
			let gateway = gateway::Service::new(config, store).await?;
			run_until_shutdown(move |drain| async move {
				let (api_res, gateway_res) = tokio::join!(api.run(drain.clone()), gateway.run(drain));
				api_res.and(gateway_res)
			})
			.await
		},
		Commands::Connector => {
			let config = ConnectorConfig::load()?;
			let connector = connector::Connector::new(config)?;
			let token = CancellationToken::new();
			let mut task = tokio::spawn(connector.run(token.clone()));
			let shutdown = signal::Shutdown::new();
			tokio::select! {
				res = &mut task => return res?,
				_ = shutdown.wait() => {},
			}
			token.cancel();
			task.await??;
			Ok(())
		},
	}
}

/// Runs a drain-aware service until SIGINT/SIGTERM, then drains gracefully.
async fn run_until_shutdown<F, Fut>(f: F) -> anyhow::Result<()>
where
	F: FnOnce(drain::DrainWatcher) -> Fut,
	Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
	let (drain_tx, drain_rx) = drain::new();
	let mut task = tokio::spawn(f(drain_rx));
	let shutdown = signal::Shutdown::new();
	tokio::select! {
		// The service failed on its own; surface the error.
		res = &mut task => return res?,
		_ = shutdown.wait() => {},
	}
	drain_tx.start_drain_and_wait(drain::DrainMode::Graceful).await;
	task.await??;
	Ok(())
}
