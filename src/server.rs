use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[allow(unused)]
use log::{info, warn, error, debug, trace};

use crate::tftp::error::{OptionError, RequestError};
use crate::tftp::options::{parse_tftp_options, OptionSet, TftpOption};
use crate::tftp::packet::Packet;
use crate::tftp::transfer::{LogSink, ReceiveTransaction, SendTransaction};
use crate::tftp::{consts, ErrorCode, Mode, RequestKind, TftpConnection, Timings, TransferState};

// ############################################################################
// ############################################################################
// ############################################################################

/// Listens on the well-known port, validates each request and hands it to a
/// transfer thread bound to a fresh ephemeral port. The listener itself never
/// carries transfer traffic.
pub struct TftpServer {
	socket: UdpSocket,
	listen_ip: IpAddr,
	root: PathBuf,
	timings: Timings,
}

impl TftpServer {
	pub fn new(listen_addr: SocketAddr, root: PathBuf) -> io::Result<Self> {
		let socket = UdpSocket::bind(listen_addr)?;
		socket.set_read_timeout(Some(Duration::from_millis(500)))?;

		Ok(Self {
			socket,
			listen_ip: listen_addr.ip(),
			root,
			timings: Timings::default(),
		})
	}

	pub fn with_timings(mut self, timings: Timings) -> Self {
		self.timings = timings;
		self
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	/// The dispatcher loop. Returns once the token is cancelled.
	pub fn serve(&self, cxl_token: CancellationToken) {
		let mut buf = [ 0u8; consts::MAX_PACKET_SIZE ];

		loop {
			if cxl_token.is_cancelled() {
				warn!("server loop cancelled by signal");
				break;
			}

			let (len, client) = match self.socket.recv_from(&mut buf) {
				Ok(recv) => recv,
				Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
				Err(e) => {
					error!("listen socket failed: {}", e);
					break;
				},
			};
			debug!("received packet ({} bytes) from {}", len, client);

			match Packet::parse(&buf[..len]) {
				Ok(pkt) if pkt.is_request() => {
					let root = self.root.clone();
					let listen_ip = self.listen_ip;
					let timings = self.timings;
					std::thread::spawn(move || {
						if let Err(e) = handle_request(listen_ip, root, timings, pkt, client) {
							info!("request from {} rejected: {}", client, e);
						}
					});
				},
				Ok(Packet::Data { .. }) | Ok(Packet::Ack { .. }) => {
					/* transfer traffic for a TID that is not this port */
					warn!("stray transfer packet on the listen port from {}", client);
					self.reject(client, ErrorCode::UnknownTid, "unknown transfer id");
				},
				Ok(_) => {
					warn!("non-request packet on the listen port from {}", client);
					self.reject(client, ErrorCode::IllegalOperation, "only TFTP requests accepted here");
				},
				Err(e) => {
					warn!("unparseable packet from {}: {}", client, e);
					self.reject(client, ErrorCode::IllegalOperation, "malformed packet");
				},
			}
		}
	}

	fn reject(&self, client: SocketAddr, code: ErrorCode, msg: &str) {
		let _ = self.socket.send_to(&Packet::error(code, msg).serialize(), client);
	}
}

pub async fn server_task(
	listen_addr: SocketAddr,
	root: PathBuf,
	cxl_token: CancellationToken,
) -> io::Result<()> {
	let server = TftpServer::new(listen_addr, root)?;
	info!("listening on {}", server.local_addr()?);

	tokio::task::spawn_blocking(move || server.serve(cxl_token))
		.await
		.map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

// ############################################################################
// #### REQUEST HANDLING ######################################################
// ############################################################################

fn handle_request(
	listen_ip: IpAddr,
	root: PathBuf,
	timings: Timings,
	pkt: Packet,
	client: SocketAddr,
) -> Result<TransferState, RequestError> {
	let (kind, filename, mode, options) = match pkt {
		Packet::Rrq { filename, mode, options } => (RequestKind::Rrq, filename, mode, options),
		Packet::Wrq { filename, mode, options } => (RequestKind::Wrq, filename, mode, options),
		_ => return Err(RequestError::MalformedRequest),
	};

	/* the transfer runs on a fresh ephemeral port; the client's source port
	 * is its TID for the whole transfer */
	let conn = TftpConnection::new(listen_ip, client.ip(), Some(client.port()))?;

	if mode == Mode::Mail {
		let _ = conn.send(&Packet::error(ErrorCode::IllegalOperation, "MAIL transfers are not supported"));
		return Err(RequestError::UnsupportedMode);
	}

	let Some(path) = resolve_under_root(&root, &filename) else {
		let _ = conn.send(&Packet::error(ErrorCode::AccessViolation, "path not served"));
		return Err(RequestError::PathOutsideRoot);
	};

	info!("{} for '{}' from {}", kind, filename, client);
	match kind {
		RequestKind::Rrq => serve_read(&conn, &path, &options, timings),
		RequestKind::Wrq => serve_write(&conn, &path, &options, timings),
	}
}

fn serve_read(
	conn: &TftpConnection,
	path: &Path,
	options: &OptionSet,
	timings: Timings,
) -> Result<TransferState, RequestError> {
	let file = match File::open(path) {
		Ok(f) => f,
		Err(e) if e.kind() == io::ErrorKind::NotFound => {
			let _ = conn.send(&Packet::error(ErrorCode::FileNotFound, "file not found"));
			return Err(RequestError::FileNotFound);
		},
		Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
			let _ = conn.send(&Packet::error(ErrorCode::AccessViolation, "access denied"));
			return Err(RequestError::FileNotAccessible);
		},
		Err(e) => {
			let _ = conn.send(&Packet::error(ErrorCode::StorageError, &e.to_string()));
			return Err(e.into());
		},
	};
	let size = file.metadata()?.len();

	let (oack_sent, timings) = negotiate(conn, options, RequestKind::Rrq, size, timings)?;

	let mut reader = BufReader::new(file);
	let mut sink = LogSink;
	/* without an OACK the request itself counts as ACK 0; with one the
	 * client has to acknowledge the options first */
	let state = SendTransaction::new(conn, &mut reader, size, oack_sent, timings, &mut sink).run();
	info!("read transfer for {} finished: {}", conn.peer_addr().map(|a| a.to_string()).unwrap_or_default(), state);
	Ok(state)
}

fn serve_write(
	conn: &TftpConnection,
	path: &Path,
	options: &OptionSet,
	timings: Timings,
) -> Result<TransferState, RequestError> {
	let file = match OpenOptions::new().write(true).create_new(true).open(path) {
		Ok(f) => f,
		Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
			let _ = conn.send(&Packet::error(ErrorCode::FileExists, "file already exists"));
			return Err(RequestError::FileExists);
		},
		Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
			let _ = conn.send(&Packet::error(ErrorCode::AccessViolation, "access denied"));
			return Err(RequestError::FileNotAccessible);
		},
		Err(e) => {
			let _ = conn.send(&Packet::error(ErrorCode::StorageError, &e.to_string()));
			return Err(e.into());
		},
	};

	let announced = options.get(consts::OPT_TRANSFERSIZE_IDENT)
		.and_then(|v| v.parse::<u64>().ok())
		.unwrap_or(0);
	let (oack_sent, timings) = negotiate(conn, options, RequestKind::Wrq, announced, timings)?;

	let mut writer = BufWriter::new(file);
	let mut sink = LogSink;
	/* an OACK replaces ACK 0 */
	let state = ReceiveTransaction::new(conn, &mut writer, !oack_sent, false, timings, &mut sink).run();
	info!("write transfer for {} finished: {}", conn.peer_addr().map(|a| a.to_string()).unwrap_or_default(), state);

	if state != TransferState::Complete {
		warn!("incomplete upload left at '{}'", path.display());
	}
	Ok(state)
}

/// Replies with an OACK when the request carries at least one option this
/// server understands. Returns whether an OACK went out and the timings the
/// transfer must use afterwards.
fn negotiate(
	conn: &TftpConnection,
	options: &OptionSet,
	kind: RequestKind,
	file_size: u64,
	mut timings: Timings,
) -> Result<(bool, Timings), RequestError> {
	if options.is_empty() {
		return Ok((false, timings));
	}

	let requested = match parse_tftp_options(options) {
		Ok(opts) => opts,
		Err(e) => {
			let _ = conn.send(&Packet::error(ErrorCode::InvalidOption, "unusable option value"));
			return Err(RequestError::Option(e));
		},
	};
	if requested.is_empty() {
		/* nothing we support: fall back to a plain transfer */
		return Ok((false, timings));
	}

	let mut reply = OptionSet::new();
	for opt in requested {
		match opt {
			TftpOption::Timeout(t) => {
				timings.resend = t;
				let (name, value) = TftpOption::Timeout(t).as_str_tuple();
				reply.insert(name, &value);
			},
			TftpOption::TransferSize(announced) => {
				let confirmed = match kind {
					RequestKind::Rrq => file_size,
					RequestKind::Wrq => announced,
				};
				let (name, value) = TftpOption::TransferSize(confirmed).as_str_tuple();
				reply.insert(name, &value);
			},
		}
	}

	conn.send(&Packet::OAck { options: reply })
		.map_err(|_| RequestError::Option(OptionError::NoAck))?;
	Ok((true, timings))
}

fn resolve_under_root(root: &Path, requested: &str) -> Option<PathBuf> {
	let requested = Path::new(requested);
	if requested.is_absolute() {
		return None;
	}

	let mut resolved = root.to_path_buf();
	for component in requested.components() {
		match component {
			Component::Normal(part) => resolved.push(part),
			Component::CurDir => {},
			/* ParentDir and prefixes would escape the served tree */
			_ => return None,
		}
	}
	Some(resolved)
}

// ############################################################################
// ############################################################################
