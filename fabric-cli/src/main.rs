use std::process;
use std::str::from_utf8;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fabric_client::{Client, FabricClientConfig};
use tokio::signal;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main(flavor = "current_thread")]
async fn main() -> fabric_client::Result<()> {
	setup_tracing().expect("failed to install tracing subscriber");

	let arguments = Arguments::parse();
	let config = FabricClientConfig::load(&arguments.config)
		.unwrap_or_else(|error| {
			eprintln!("failed to load {:?}: {error}", arguments.config);
			process::exit(1);
		});

	let client = Client::new(config).await?;
	client.connect().await?;

	match arguments.command {
		Commands::Sub { topics } => {
			let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
			let mut callback_ids = Vec::with_capacity(topics.len());
			for topic in &topics {
				let tx = tx.clone();
				let id = client
					.add_event_callback(
						topic.clone(),
						true,
						std::sync::Arc::new(move |message: &fabric_client::Message| {
							let _ = tx.send(message.clone());
						}),
					)
					.await?;
				callback_ids.push(id);
			}
			drop(tx);

			let signal_handler = {
				let client = client.clone();
				let callback_ids = callback_ids.clone();
				tokio::spawn(async move {
					let _ = signal::ctrl_c().await;
					for id in callback_ids {
						let _ = client.remove_event_callback(id).await;
					}
				})
			};

			while let Some(message) = rx.recv().await {
				println!(
					"{}: {}",
					message.destination_topic(),
					from_utf8(&message.envelope().payload).unwrap_or("<binary>")
				);
			}

			signal_handler.await.ok();
		}
		Commands::Pub { topic, payload, count } => {
			for _ in 0..count.unwrap_or(1) {
				client.send_event(topic.clone(), payload.clone().into_bytes()).await?;
			}
		}
		Commands::Request { topic, payload, service_id, timeout } => {
			let timeout = Duration::from_secs(timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT.as_secs()));
			let response = client
				.sync_request_with_timeout(topic, payload.into_bytes(), service_id, timeout)
				.await?;
			match response {
				fabric_client::Message::ErrorResponse(error) => {
					eprintln!("error {}: {}", error.error_code, error.error_message);
					process::exit(1);
				}
				other => {
					println!("{}", from_utf8(&other.envelope().payload).unwrap_or("<binary>"));
				}
			}
		}
	}

	client.disconnect().await?;
	client.close().await;

	Ok(())
}

fn setup_tracing() -> Result<(), SetGlobalDefaultError> {
	let filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::ERROR.into())
		.with_env_var("FABRIC_LOG")
		.try_from_env();

	let subscriber = tracing_subscriber::fmt()
		.with_file(true)
		.with_target(false)
		.with_env_filter(filter.unwrap_or_default())
		.finish();

	tracing::subscriber::set_global_default(subscriber)
}

#[derive(Debug, Parser)]
#[command(name = "fabric", about = "Demo CLI for the fabric-client pub/sub library")]
struct Arguments {
	#[command(subcommand)]
	command: Commands,

	/// Path to the client's INI configuration file.
	#[arg(long, short = 'c', global = true, default_value = "client.conf", env = "FABRIC_CONFIG")]
	config: std::path::PathBuf,
}

#[derive(Debug, Subcommand)]
enum Commands {
	/// Subscribe to one or more event topics and print received events.
	Sub {
		#[clap(required = true)]
		topics: Vec<String>,
	},
	/// Publish an event to a topic.
	Pub {
		topic: String,
		payload: String,

		/// Number of times to publish the payload.
		#[arg(long, short = 'C')]
		count: Option<usize>,
	},
	/// Send a request and print the matching response.
	Request {
		topic: String,
		payload: String,

		/// Target a named service instead of broadcasting to all subscribers.
		#[arg(long)]
		service_id: Option<String>,

		/// Seconds to wait for a response before giving up.
		#[arg(long)]
		timeout: Option<u64>,
	},
}
