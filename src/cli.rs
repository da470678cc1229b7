use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use simple_logger::SimpleLogger;

use crate::tftp::consts;
use crate::tftp::options::TftpOption;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Options {
	#[arg(value_enum, short, long,
		default_value_t = DebugLevel::Warn,
		help = "Debug level to determine which messages are printed", global = true
	)]
	pub debug: DebugLevel,

	#[arg(short, long, global = true, help = "Log packets and transfer progress")]
	pub verbose: bool,

	#[command(subcommand)]
	pub run_mode: RunMode,
}

#[derive(Debug, Clone, ValueEnum, Default)]
pub enum DebugLevel {
	Off = 0,
	Error,

	#[default]
	Warn,
	Info,
	Debug,
	Trace
}
impl From<DebugLevel> for log::LevelFilter {
	fn from(value: DebugLevel) -> Self {
		match value {
			DebugLevel::Off => Self::Off,
			DebugLevel::Error => Self::Error,
			DebugLevel::Warn => Self::Warn,
			DebugLevel::Info => Self::Info,
			DebugLevel::Debug => Self::Debug,
			DebugLevel::Trace => Self::Trace,
		}
	}
}

#[derive(Debug, Args)]
pub struct ClientOpts {
	#[arg(short, long,
		default_value_t = consts::TFTP_LISTEN_PORT,
		help = "Server port the request is sent to"
	)]
	pub port: u16,

	#[arg(
		short = 'T', long, default_value_t = false,
		help = "Request (for get) or hand over (for put) the size of the file"
	)]
	pub transfer_size: bool,

	#[arg(
		short, long, value_parser = clap::value_parser!(u8).range(1..),
		help = "Negotiate the retransmit interval in seconds"
	)]
	pub timeout: Option<u8>,
}

#[derive(Subcommand, Debug)]
pub enum RunMode {
	/// Serve files below a root directory to TFTP clients
	Server {
		#[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
		bind: IpAddr,

		#[arg(short, long, default_value_t = consts::TFTP_LISTEN_PORT)]
		port: u16,

		#[arg(short = 'r', long = "root", help = "Directory served to clients (default: working dir)")]
		root_dir: Option<PathBuf>,
	},
	/// Run one transfer; the endpoint written as host:path is the server side
	Client {
		#[command(flatten)]
		opts: ClientOpts,

		#[arg(help = "Local path or host:path")]
		source: String,

		#[arg(help = "Local path or host:path")]
		dest: String,
	},
	/// Relay transfers between a client and a server, perturbing packets on demand
	Sim {
		#[arg(short = 'c', long, default_value_t = consts::SIM_LISTEN_PORT)]
		client_port: u16,

		#[arg(short = 'a', long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
		server_ip: IpAddr,

		#[arg(short = 'p', long, default_value_t = consts::TFTP_LISTEN_PORT)]
		server_port: u16,
	},
}

/// Maps the client flags onto the options the request will carry.
pub fn requested_tftp_options(opts: &ClientOpts) -> Vec<TftpOption> {
	let mut res: Vec<TftpOption> = Vec::with_capacity(2);
	if opts.transfer_size {
		res.push(TftpOption::TransferSize(0));
	}
	if let Some(secs) = opts.timeout {
		res.push(TftpOption::Timeout(Duration::from_secs(secs as u64)));
	}
	res
}

pub fn init_logger(debug_level: DebugLevel, verbose: bool) {
	let mut level: log::LevelFilter = debug_level.into();
	if verbose {
		level = level.max(log::LevelFilter::Info);
	}

	SimpleLogger::new()
		.with_level(level)
		.env()
		.init()
		.unwrap();
}
