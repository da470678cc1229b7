use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use thiserror::Error;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::cli;
use crate::tftp::error::RecvError;
use crate::tftp::options::{parse_tftp_options, OptionSet, TftpOption};
use crate::tftp::packet::Packet;
use crate::tftp::transfer::{LogSink, ReceiveTransaction, SendTransaction};
use crate::tftp::{ErrorCode, Mode, RequestKind, TftpConnection, Timings, TransferState};

// ############################################################################
// ############################################################################
// ############################################################################

#[derive(Debug, Error)]
pub enum ClientError {
	#[error("{0}")]
	BadArguments(String),
	#[error("cannot resolve server address '{0}'")]
	Resolve(String),
	#[error("cannot open '{0}': {1}")]
	File(PathBuf, io::Error),
	#[error("transfer failed: {0}")]
	Transfer(TransferState),
	#[error("socket error: {0}")]
	Socket(#[from] io::Error),
}

pub struct TftpRequestParameters {
	pub req_kind: RequestKind,
	pub server: SocketAddr,
	pub remote_file: String,
	pub local_file: PathBuf,
	pub options: Vec<TftpOption>,
}

/// Splits `host:path` into its parts. Anything without a colon is a plain
/// local path.
fn split_remote(arg: &str) -> Option<(&str, &str)> {
	arg.split_once(':')
}

/// Decides the transfer direction from the two positional arguments: the
/// remote side is the one written as `host:path`, and there must be exactly
/// one of them.
pub fn parse_transfer_args(
	source: &str,
	dest: &str,
	port: u16,
	options: Vec<TftpOption>,
) -> Result<TftpRequestParameters, ClientError> {
	let (req_kind, remote, local) = match (split_remote(source), split_remote(dest)) {
		(Some(remote), None) => (RequestKind::Rrq, remote, dest),
		(None, Some(remote)) => (RequestKind::Wrq, remote, source),
		(None, None) => return Err(ClientError::BadArguments(
			"one of <source> and <dest> must name the server as host:path".to_string())),
		(Some(_), Some(_)) => return Err(ClientError::BadArguments(
			"only one of <source> and <dest> may name the server".to_string())),
	};

	let (host, remote_file) = remote;
	if host.is_empty() || remote_file.is_empty() {
		return Err(ClientError::BadArguments("empty host or remote path".to_string()));
	}

	let server = (host, port).to_socket_addrs()
		.map_err(|_| ClientError::Resolve(host.to_string()))?
		.next()
		.ok_or_else(|| ClientError::Resolve(host.to_string()))?;

	let local_file = PathBuf::from(shellexpand::tilde(local).into_owned());
	Ok(TftpRequestParameters {
		req_kind,
		server,
		remote_file: remote_file.to_string(),
		local_file,
		options,
	})
}

pub async fn client_task(opts: cli::ClientOpts, source: String, dest: String) -> Result<(), ClientError> {
	let params = parse_transfer_args(&source, &dest, opts.port, cli::requested_tftp_options(&opts))?;

	let state = tokio::task::spawn_blocking(move || {
		match params.req_kind {
			RequestKind::Rrq => get(&params, Timings::default()),
			RequestKind::Wrq => put(&params, Timings::default()),
		}
	}).await.map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

	match state {
		TransferState::Complete => Ok(()),
		other => Err(ClientError::Transfer(other)),
	}
}

// ############################################################################
// #### GET / PUT #############################################################
// ############################################################################

fn request_option_set(params: &TftpRequestParameters, file_size: u64) -> OptionSet {
	let mut set = OptionSet::new();
	for opt in params.options.iter() {
		let resolved = match (params.req_kind, opt) {
			/* for a read the server fills the size in; for a write we
			 * announce it */
			(RequestKind::Rrq, TftpOption::TransferSize(_)) => TftpOption::TransferSize(0),
			(RequestKind::Wrq, TftpOption::TransferSize(_)) => TftpOption::TransferSize(file_size),
			(_, other) => *other,
		};
		let (name, value) = resolved.as_str_tuple();
		set.insert(name, &value);
	}
	set
}

/// Applies a server OACK to the transfer parameters. A garbled OACK is a
/// negotiation failure, answered with ERROR 8.
fn apply_oack(
	conn: &TftpConnection,
	oack_options: &OptionSet,
	timings: &mut Timings,
) -> Result<(), TransferState> {
	let confirmed = match parse_tftp_options(oack_options) {
		Ok(opts) => opts,
		Err(e) => {
			warn!("server OACK is unusable: {}", e);
			let _ = conn.send(&Packet::error(ErrorCode::InvalidOption, "bad option value in OACK"));
			return Err(TransferState::ReceivedBadPacket);
		},
	};

	for opt in confirmed {
		match opt {
			TftpOption::Timeout(t) => timings.resend = t,
			TftpOption::TransferSize(ts) => debug!("server confirmed transfer size {}", ts),
		}
	}
	Ok(())
}

pub fn get(params: &TftpRequestParameters, mut timings: Timings) -> Result<TransferState, ClientError> {
	let file = OpenOptions::new().write(true).create(true).truncate(true)
		.open(&params.local_file)
		.map_err(|e| ClientError::File(params.local_file.clone(), e))?;
	let mut writer = BufWriter::new(file);

	let conn = TftpConnection::new(
		IpAddr::V4(Ipv4Addr::UNSPECIFIED), params.server.ip(), Some(params.server.port()),
	)?;

	let options = request_option_set(params, 0);
	let negotiating = !options.is_empty();
	let request = Packet::Rrq {
		filename: params.remote_file.clone(),
		mode: Mode::Octet,
		options,
	};
	conn.send(&request)?;
	info!("RRQ for '{}' sent to {}", params.remote_file, params.server);

	let mut sink = LogSink;
	if !negotiating {
		/* the first DATA tells us the server's transfer TID */
		return Ok(ReceiveTransaction::new(
			&conn, &mut writer, false, true, timings, &mut sink,
		).run());
	}

	/* with options on the wire the first reply is either an OACK or, from a
	 * server that ignored them all, plain DATA 1 */
	match conn.recv(timings.packet_lost, true) {
		Ok((Packet::OAck { options }, _)) => {
			if let Err(state) = apply_oack(&conn, &options, &mut timings) {
				return Ok(state);
			}
			conn.send(&Packet::Ack { block: 0 })?;
			Ok(ReceiveTransaction::new(
				&conn, &mut writer, false, false, timings, &mut sink,
			).run())
		},
		Ok((first @ Packet::Data { .. }, _)) => Ok(ReceiveTransaction::new(
			&conn, &mut writer, false, false, timings, &mut sink,
		).with_pending(first).run()),
		Ok((Packet::Error { code, message }, _)) => {
			error!("server refused the request: error {} '{}'", code, message);
			Ok(TransferState::ReceivedBadPacket)
		},
		Ok((other, _)) => {
			error!("unexpected reply to RRQ: {}", other);
			Ok(TransferState::ReceivedBadPacket)
		},
		Err(RecvError::Timeout) => Ok(TransferState::BlockZeroTimeout),
		Err(RecvError::BadPacket(_)) => Ok(TransferState::ReceivedBadPacket),
		Err(RecvError::Io(e)) => Err(e.into()),
	}
}

pub fn put(params: &TftpRequestParameters, mut timings: Timings) -> Result<TransferState, ClientError> {
	let file = File::open(&params.local_file)
		.map_err(|e| ClientError::File(params.local_file.clone(), e))?;
	let size = file.metadata()
		.map_err(|e| ClientError::File(params.local_file.clone(), e))?
		.len();
	let mut reader = BufReader::new(file);

	let conn = TftpConnection::new(
		IpAddr::V4(Ipv4Addr::UNSPECIFIED), params.server.ip(), Some(params.server.port()),
	)?;

	let options = request_option_set(params, size);
	let negotiating = !options.is_empty();
	let request = Packet::Wrq {
		filename: params.remote_file.clone(),
		mode: Mode::Octet,
		options,
	};
	conn.send(&request)?;
	info!("WRQ for '{}' sent to {}", params.remote_file, params.server);

	let mut sink = LogSink;
	if !negotiating {
		/* ACK 0 arrives from the server's transfer TID */
		return Ok(SendTransaction::new(
			&conn, &mut reader, size, true, timings, &mut sink,
		).run());
	}

	match conn.recv(timings.packet_lost, true) {
		Ok((Packet::OAck { options }, _)) => {
			if let Err(state) = apply_oack(&conn, &options, &mut timings) {
				return Ok(state);
			}
			Ok(SendTransaction::new(&conn, &mut reader, size, false, timings, &mut sink).run())
		},
		Ok((Packet::Ack { block: 0 }, _)) => Ok(SendTransaction::new(
			&conn, &mut reader, size, false, timings, &mut sink,
		).run()),
		Ok((Packet::Error { code, message }, _)) => {
			error!("server refused the request: error {} '{}'", code, message);
			Ok(TransferState::ReceivedBadPacket)
		},
		Ok((other, _)) => {
			error!("unexpected reply to WRQ: {}", other);
			Ok(TransferState::ReceivedBadPacket)
		},
		Err(RecvError::Timeout) => Ok(TransferState::BlockZeroTimeout),
		Err(RecvError::BadPacket(_)) => Ok(TransferState::ReceivedBadPacket),
		Err(RecvError::Io(e)) => Err(e.into()),
	}
}

// ############################################################################
// ############################################################################

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn direction_follows_the_remote_argument() {
		let params = parse_transfer_args("127.0.0.1:remote.bin", "local.bin", 69, Vec::new()).unwrap();
		assert_eq!(params.req_kind, RequestKind::Rrq);
		assert_eq!(params.remote_file, "remote.bin");
		assert_eq!(params.local_file, PathBuf::from("local.bin"));
		assert_eq!(params.server.port(), 69);

		let params = parse_transfer_args("local.bin", "127.0.0.1:remote.bin", 6969, Vec::new()).unwrap();
		assert_eq!(params.req_kind, RequestKind::Wrq);
		assert_eq!(params.server.port(), 6969);
	}

	#[test]
	fn both_or_neither_remote_is_a_user_error() {
		assert!(matches!(
			parse_transfer_args("a:x", "b:y", 69, Vec::new()),
			Err(ClientError::BadArguments(_)),
		));
		assert!(matches!(
			parse_transfer_args("x", "y", 69, Vec::new()),
			Err(ClientError::BadArguments(_)),
		));
	}

	#[test]
	fn empty_host_or_path_is_rejected() {
		assert!(matches!(
			parse_transfer_args(":x", "y", 69, Vec::new()),
			Err(ClientError::BadArguments(_)),
		));
		assert!(matches!(
			parse_transfer_args("x", "127.0.0.1:", 69, Vec::new()),
			Err(ClientError::BadArguments(_)),
		));
	}
}
