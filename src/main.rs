use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;

#[allow(unused)]
use log::{info, warn, error, debug, trace};
use clap::Parser;

use tftpkit::{cli, client, server, sim};

#[tokio::main]
async fn main() -> ExitCode {
	let options = cli::Options::parse();
	cli::init_logger(options.debug, options.verbose);

	match options.run_mode {
		cli::RunMode::Server { bind, port, root_dir } => {
			let root = match resolve_root(root_dir) {
				Ok(root) => root,
				Err(e) => {
					error!("{}", e);
					return ExitCode::FAILURE;
				},
			};
			debug!("serving root '{}'", root.display());

			let listen_addr = SocketAddr::from((bind, port));
			match server::server_task(listen_addr, root, cancel_on_sigint()).await {
				Ok(()) => ExitCode::SUCCESS,
				Err(e) => {
					error!("server failed to start: {}", e);
					ExitCode::FAILURE
				},
			}
		},

		/* no SIGINT hook here: a client run is one transfer, interrupting it
		 * simply kills the process */
		cli::RunMode::Client { opts, source, dest } => {
			match client::client_task(opts, source, dest).await {
				Ok(()) => {
					info!("transfer complete");
					ExitCode::SUCCESS
				},
				Err(e) => {
					error!("{}", e);
					ExitCode::FAILURE
				},
			}
		},

		cli::RunMode::Sim { client_port, server_ip, server_port } => {
			let settings = sim::SimSettings {
				bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
				client_port,
				server_ip,
				server_port,
			};
			match sim::sim_task(settings, cancel_on_sigint()).await {
				Ok(()) => ExitCode::SUCCESS,
				Err(e) => {
					error!("simulator failed to start: {}", e);
					ExitCode::FAILURE
				},
			}
		},
	}
}

/// SIGINT cancels the returned token so the listener loops can wind down on
/// their own instead of being killed mid-transfer.
fn cancel_on_sigint() -> CancellationToken {
	let token = CancellationToken::new();
	let sigint_token = token.clone();

	if let Err(e) = ctrlc::set_handler(move || {
		info!("received SIGINT");
		sigint_token.cancel();
	}) {
		warn!("cannot install SIGINT handler: {}", e);
	}
	token
}

fn resolve_root(root_dir: Option<PathBuf>) -> Result<PathBuf, String> {
	match root_dir {
		Some(dir) => {
			let dir = PathBuf::from(shellexpand::tilde(&dir.to_string_lossy().into_owned()).into_owned());
			match dir.try_exists() {
				Ok(true) => Ok(dir),
				_ => Err(format!("cannot find/access root path '{}'", dir.display())),
			}
		},
		None => std::env::current_dir()
			.map_err(|e| format!("cannot access current working dir: {}", e)),
	}
}
