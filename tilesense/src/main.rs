mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use tilesense::Service;
use tilesense_core::{ImageRequest, ServiceConfig};

#[derive(Parser, Debug)]
#[command(
	author,
	version,
	about,
	long_about = None,
	propagate_version = true,
	disable_help_subcommand = true,
)]
struct Cli {
	#[command(subcommand)]
	command: Commands,

	#[command(flatten)]
	verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Commands {
	/// Start the worker loop
	Run(RunArgs),

	/// Validate an image request payload
	CheckRequest(CheckRequestArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
	/// Directory backing the local object store; in-memory if omitted
	#[arg(long)]
	data_dir: Option<PathBuf>,

	/// Seed a synthetic image and one request, then process it
	#[arg(long)]
	demo: bool,
}

#[derive(clap::Args, Debug)]
struct CheckRequestArgs {
	/// Path to a JSON image request payload
	file: PathBuf,
}

fn main() -> Result<()> {
	let cli = Cli::parse();

	env_logger::Builder::new()
		.filter_level(cli.verbose.log_level_filter())
		.format_timestamp(None)
		.init();

	run(cli)
}

fn run(cli: Cli) -> Result<()> {
	match &cli.command {
		Commands::Run(arguments) => run_service(arguments),
		Commands::CheckRequest(arguments) => check_request(arguments),
	}
}

fn run_service(arguments: &RunArgs) -> Result<()> {
	let config = ServiceConfig::from_env()?;
	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.context("could not start async runtime")?;

	runtime.block_on(async {
		let collaborators = demo::local_collaborators(
			arguments.data_dir.clone(),
			arguments.demo,
			std::time::Duration::from_secs(config.message_visibility),
		)
		.await?;
		let service = Service::build(collaborators, config);

		let shutdown = service.shutdown_handle();
		tokio::spawn(async move {
			wait_for_termination().await;
			log::info!("termination signal received, shutting down");
			let _ = shutdown.send(true);
		});

		service.run().await;
		Ok(())
	})
}

async fn wait_for_termination() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		let mut sigterm = match signal(SignalKind::terminate()) {
			Ok(sigterm) => sigterm,
			Err(error) => {
				log::error!("could not install SIGTERM handler: {error}");
				let _ = tokio::signal::ctrl_c().await;
				return;
			}
		};
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {}
			_ = sigterm.recv() => {}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}

fn check_request(arguments: &CheckRequestArgs) -> Result<()> {
	let body = std::fs::read_to_string(&arguments.file)
		.with_context(|| format!("could not read '{}'", arguments.file.display()))?;
	let request = ImageRequest::from_external_message(&body)?;
	println!("valid image request:");
	println!("  image id:  {}", request.image_id());
	println!("  endpoint:  {} ({})", request.endpoint.name, request.endpoint.invoke_mode);
	println!(
		"  tiles:     {}x{} overlap {}x{} as {}/{}",
		request.tile_geometry.tile_width,
		request.tile_geometry.tile_height,
		request.tile_geometry.overlap_x,
		request.tile_geometry.overlap_y,
		request.tile_format,
		request.tile_compression
	);
	println!("  outputs:   {}", request.outputs.len());
	Ok(())
}
